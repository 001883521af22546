//! [`RuntimeBackend`] backed by the host's git, container engine and Python
//! toolchain. Every invocation is an explicit argument vector; nothing goes
//! through a shell, so repository-controlled names cannot inject commands.

use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{read_log_tail, CommandOutput, ContainerSpec, LaunchedPid, ProcessSpec, RuntimeBackend};
use crate::config::DeployConfig;

pub struct LocalRuntime {
    git_bin: String,
    docker_bin: String,
    python_bin: String,
    kill_bin: String,
    startup_grace: Duration,
}

impl LocalRuntime {
    pub fn new(config: &DeployConfig) -> Self {
        Self {
            git_bin: config.tools.git_bin.clone(),
            docker_bin: config.tools.docker_bin.clone(),
            python_bin: config.tools.python_bin.clone(),
            kill_bin: config.tools.kill_bin.clone(),
            startup_grace: config.timeouts.startup_grace(),
        }
    }

    fn docker(&self) -> Command {
        Command::new(&self.docker_bin)
    }
}

/// Run a command to completion, capturing both streams.
///
/// The child is killed if the returned future is dropped, which is how step
/// timeouts and cancelled deploys stop a clone or build midway.
async fn run(mut cmd: Command) -> io::Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!(command = ?cmd.as_std(), "running external command");

    let output = cmd.output().await?;

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.is_empty() {
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&stderr);
    }

    Ok(CommandOutput {
        success: output.status.success(),
        exit_code: output.status.code(),
        output: text,
    })
}

#[async_trait]
impl RuntimeBackend for LocalRuntime {
    async fn clone_repository(&self, repo_url: &str, dest: &Path) -> io::Result<CommandOutput> {
        let mut cmd = Command::new(&self.git_bin);
        // `--` keeps a hostile URL from being parsed as an option
        cmd.arg("clone").arg("--").arg(repo_url).arg(dest);
        run(cmd).await
    }

    async fn build_image(&self, context_dir: &Path, tag: &str) -> io::Result<CommandOutput> {
        let mut cmd = self.docker();
        cmd.arg("build")
            .arg("-t")
            .arg(tag)
            .arg(".")
            .current_dir(context_dir);
        run(cmd).await
    }

    async fn remove_container(&self, name: &str) -> io::Result<CommandOutput> {
        let mut cmd = self.docker();
        cmd.arg("rm").arg("-f").arg(name);
        run(cmd).await
    }

    async fn run_container(&self, spec: &ContainerSpec) -> io::Result<CommandOutput> {
        let mut cmd = self.docker();
        cmd.arg("run")
            .arg("-d")
            .arg("--name")
            .arg(&spec.name)
            .arg(format!("--memory={}m", spec.memory_mb));
        if let Some(env_file) = &spec.env_file {
            cmd.arg("--env-file").arg(env_file);
        }
        cmd.arg(&spec.image);
        run(cmd).await
    }

    async fn container_logs(&self, name: &str, tail_lines: usize) -> io::Result<CommandOutput> {
        let mut cmd = self.docker();
        cmd.arg("logs")
            .arg("--tail")
            .arg(tail_lines.to_string())
            .arg(name);
        run(cmd).await
    }

    async fn create_environment(
        &self,
        workspace: &Path,
        env_dir: &Path,
    ) -> io::Result<CommandOutput> {
        let mut cmd = Command::new(&self.python_bin);
        cmd.arg("-m").arg("venv").arg(env_dir).current_dir(workspace);
        run(cmd).await
    }

    async fn install_dependencies(
        &self,
        workspace: &Path,
        env_dir: &Path,
        manifest: &Path,
    ) -> io::Result<CommandOutput> {
        let mut cmd = Command::new(env_dir.join("bin").join("pip"));
        cmd.arg("install")
            .arg("-r")
            .arg(manifest)
            .current_dir(workspace);
        run(cmd).await
    }

    async fn spawn_process(&self, spec: &ProcessSpec, launched: &LaunchedPid) -> io::Result<u32> {
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&spec.log_path)?;
        let log_err = log.try_clone()?;

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&spec.workspace)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));
        // Own process group, so stop can signal the app and its children together
        #[cfg(unix)]
        cmd.process_group(0);

        debug!(command = ?cmd.as_std(), "spawning supervised process");

        let mut child = cmd.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| io::Error::other("process exited before its pid was read"))?;
        launched.record(pid);

        tokio::time::sleep(self.startup_grace).await;

        if let Some(status) = child.try_wait()? {
            let tail = read_log_tail(&spec.log_path, 40).unwrap_or_default();
            return Err(io::Error::other(format!(
                "process {pid} exited during startup ({status})\n{tail}"
            )));
        }

        info!(pid, log = %spec.log_path.display(), "process launched");

        // Dropping the handle detaches it; tokio reaps the child when it exits
        drop(child);
        Ok(pid)
    }

    async fn terminate_process_group(&self, pid: u32) -> io::Result<CommandOutput> {
        let mut cmd = Command::new(&self.kill_bin);
        cmd.arg("-TERM").arg("--").arg(format!("-{pid}"));
        let output = run(cmd).await?;
        if !output.success {
            warn!(pid, output = %output.output, "process group termination failed");
        }
        Ok(output)
    }
}
