use crate::{
    config::DeployConfig,
    error::DeployError,
    runtime::{
        CommandOutput, ContainerSpec, LaunchedPid, LogLocation, ProcessSpec, RuntimeBackend,
        RuntimeHandle,
    },
    services::{
        build_strategy::{BuildStrategy, BuildStrategyDetector},
        workspace_service::WorkspaceService,
    },
};
use entity::sea_orm_active_enums::RuntimeKind;
use std::{
    future::Future,
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

/// One deploy attempt, already admitted and named.
#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub owner_id: String,
    pub repo_url: String,
    pub repo_name: String,
    pub runtime_name: String,
    pub memory_mb: i32,
    /// Filled in by the backend as soon as an interpreted launch has a child
    pub launched: LaunchedPid,
}

#[derive(Debug, Clone)]
pub struct DeployedRuntime {
    pub handle: RuntimeHandle,
    pub workspace: PathBuf,
    pub strategy: BuildStrategy,
}

/// clone -> environment -> detect -> build -> launch.
///
/// Every step is an external process bounded by its own timeout. The first
/// failing step aborts the rest and its captured output is returned as is.
pub struct DeploymentPipeline {
    backend: Arc<dyn RuntimeBackend>,
    workspace: Arc<WorkspaceService>,
    detector: BuildStrategyDetector,
    config: DeployConfig,
}

impl DeploymentPipeline {
    pub fn new(
        backend: Arc<dyn RuntimeBackend>,
        workspace: Arc<WorkspaceService>,
        config: &DeployConfig,
    ) -> Self {
        Self {
            backend,
            workspace,
            detector: BuildStrategyDetector::new(config),
            config: config.clone(),
        }
    }

    #[instrument(
        skip(self, request),
        fields(owner = %request.owner_id, repo = %request.repo_name, runtime_name = %request.runtime_name)
    )]
    pub async fn run(&self, request: &PipelineRequest) -> Result<DeployedRuntime, DeployError> {
        let timeouts = &self.config.timeouts;

        // 1. Clone into a freshly reset workspace
        let workspace = self
            .workspace
            .prepare_workspace(&request.owner_id, &request.repo_name)
            .await
            .map_err(|e| DeployError::CloneFailed(format!("could not prepare workspace: {e}")))?;

        step(
            "clone",
            timeouts.clone_timeout(),
            self.backend.clone_repository(&request.repo_url, &workspace),
        )
        .await
        .map_err(DeployError::CloneFailed)?;

        // 2. Default configuration, never overwriting the repository's own
        let written = materialize_env(&workspace, &self.config.env_file, self.config.default_port)
            .await
            .map_err(|e| {
                DeployError::EnvironmentFailed(format!(
                    "could not write {}: {e}",
                    self.config.env_file
                ))
            })?;
        debug!(written, "environment file ready");

        // 3. Detect
        let detector = self.detector.clone();
        let root = workspace.clone();
        let strategy = tokio::task::spawn_blocking(move || detector.detect(&root))
            .await
            .map_err(|e| DeployError::NoEntrypoint(format!("detection did not complete: {e}")))?;
        info!(strategy = strategy.as_str(), "build strategy detected");

        // 4 + 5. Build and launch
        let handle = match &strategy {
            BuildStrategy::Containerized => self.launch_container(request, &workspace).await?,
            BuildStrategy::InterpretedFallback {
                entrypoint,
                manifest,
            } => {
                self.launch_process(request, &workspace, entrypoint, manifest.as_deref())
                    .await?
            }
            BuildStrategy::Unsupported => {
                return Err(DeployError::NoEntrypoint(self.detector.expectations()));
            }
        };

        info!(kind = ?handle.kind, id = %handle.id, "runtime launched");

        Ok(DeployedRuntime {
            handle,
            workspace,
            strategy,
        })
    }

    async fn launch_container(
        &self,
        request: &PipelineRequest,
        workspace: &Path,
    ) -> Result<RuntimeHandle, DeployError> {
        let timeouts = &self.config.timeouts;
        let name = &request.runtime_name;
        let image = format!("{name}:latest");

        step(
            "build",
            timeouts.build_timeout(),
            self.backend.build_image(workspace, &image),
        )
        .await
        .map_err(DeployError::BuildFailed)?;

        // A leftover container with this name is not expected; failure here is normal
        if let Err(output) = step(
            "remove-stale",
            timeouts.launch_timeout(),
            self.backend.remove_container(name),
        )
        .await
        {
            debug!(output = %output, "no stale container to remove");
        }

        let spec = ContainerSpec {
            name: name.clone(),
            image: image.clone(),
            memory_mb: request.memory_mb,
            env_file: Some(workspace.join(&self.config.env_file)),
        };

        if let Err(output) = step("launch", timeouts.launch_timeout(), self.backend.run_container(&spec)).await
        {
            // Whatever half-started under this name must go before any retry
            if let Err(cleanup) = step(
                "remove-partial",
                timeouts.launch_timeout(),
                self.backend.remove_container(name),
            )
            .await
            {
                debug!(output = %cleanup, "no partial container to remove");
            }
            warn!(image = %image, "image from failed launch is eligible for cleanup");
            return Err(DeployError::LaunchFailed(output));
        }

        Ok(RuntimeHandle {
            kind: RuntimeKind::Container,
            id: name.clone(),
            log: LogLocation::Container(name.clone()),
        })
    }

    async fn launch_process(
        &self,
        request: &PipelineRequest,
        workspace: &Path,
        entrypoint: &str,
        manifest: Option<&Path>,
    ) -> Result<RuntimeHandle, DeployError> {
        let timeouts = &self.config.timeouts;
        let env_dir = workspace.join(&self.config.venv_dir);

        step(
            "isolate",
            timeouts.install_timeout(),
            self.backend.create_environment(workspace, &env_dir),
        )
        .await
        .map_err(DeployError::LaunchFailed)?;

        if let Some(manifest) = manifest {
            step(
                "install",
                timeouts.install_timeout(),
                self.backend.install_dependencies(workspace, &env_dir, manifest),
            )
            .await
            .map_err(DeployError::LaunchFailed)?;
        }

        let env = read_env_file(&workspace.join(&self.config.env_file))
            .await
            .map_err(DeployError::LaunchFailed)?;
        let log_path = workspace.join(&self.config.log_file);

        let spec = ProcessSpec {
            workspace: workspace.to_path_buf(),
            program: env_dir.join("bin").join("python"),
            args: vec![entrypoint.to_string()],
            env,
            log_path: log_path.clone(),
        };

        let spawned = tokio::time::timeout(
            timeouts.launch_timeout(),
            self.backend.spawn_process(&spec, &request.launched),
        )
        .await;

        let failure = match spawned {
            Ok(Ok(pid)) => {
                return Ok(RuntimeHandle {
                    kind: RuntimeKind::Process,
                    id: pid.to_string(),
                    log: LogLocation::File(log_path),
                })
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("launch timed out after {:?}", timeouts.launch_timeout()),
        };

        // A child that never became the application's runtime must not outlive it
        if let Some(pid) = request.launched.get() {
            self.terminate_unregistered(pid).await;
        }
        Err(DeployError::LaunchFailed(failure))
    }

    async fn terminate_unregistered(&self, pid: u32) {
        match step(
            "terminate-partial",
            self.config.timeouts.launch_timeout(),
            self.backend.terminate_process_group(pid),
        )
        .await
        {
            Ok(_) => info!(pid, "terminated process from failed launch"),
            Err(output) => debug!(pid, output = %output, "process from failed launch already gone"),
        }
    }
}


/// Run one external step under a timeout. Failures come back as the text to
/// report: the command's own output when it ran, otherwise why it did not.
async fn step<F>(name: &'static str, limit: Duration, fut: F) -> Result<CommandOutput, String>
where
    F: Future<Output = io::Result<CommandOutput>>,
{
    let started = Instant::now();
    let result = tokio::time::timeout(limit, fut).await;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    match result {
        Err(_) => {
            warn!(step = name, elapsed_ms, "step timed out");
            Err(format!("{name} timed out after {limit:?}"))
        }
        Ok(Err(e)) => {
            warn!(step = name, error = %e, "step could not start");
            Err(format!("{name} could not be started: {e}"))
        }
        Ok(Ok(output)) if !output.success => {
            warn!(step = name, exit_code = ?output.exit_code, elapsed_ms, "step failed");
            if output.output.trim().is_empty() {
                Err(format!("{name} exited with status {:?}", output.exit_code))
            } else {
                Err(output.output)
            }
        }
        Ok(Ok(output)) => {
            info!(step = name, elapsed_ms, "step complete");
            Ok(output)
        }
    }
}

/// Write `PORT=<default_port>` unless the file already exists. Returns
/// whether a file was written.
pub async fn materialize_env(
    workspace: &Path,
    file_name: &str,
    default_port: u16,
) -> io::Result<bool> {
    let path = workspace.join(file_name);
    let opened = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .await;

    match opened {
        Ok(mut file) => {
            file.write_all(format!("PORT={default_port}\n").as_bytes())
                .await?;
            file.flush().await?;
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e),
    }
}

async fn read_env_file(path: &Path) -> Result<Vec<(String, String)>, String> {
    let contents = tokio::fs::read(path)
        .await
        .map_err(|e| format!("could not read {}: {e}", path.display()))?;
    dotenvy::from_read_iter(contents.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("invalid {}: {e}", path.display()))
}
