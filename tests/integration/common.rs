//! Shared fixtures: a scripted runtime backend and a fully wired state on an
//! in-memory SQLite database.

use async_trait::async_trait;
use deckhand::{
    config::{AdmissionConfig, Config, DatabaseConfig, DeployConfig, LedgerConfig, ServerConfig},
    runtime::{CommandOutput, ContainerSpec, LaunchedPid, ProcessSpec, RuntimeBackend},
    AppState,
};
use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use std::{
    collections::{HashMap, HashSet},
    io,
    path::Path,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tempfile::TempDir;

pub const ADMIN: &str = "admin";
pub const TOKEN: &str = "test-token";
pub const SITE: &str = "https://git.example.com/acme/site.git";
pub const API: &str = "https://git.example.com/acme/api.git";
pub const SCRIPT: &str = "https://git.example.com/acme/script.git";
pub const DOCS: &str = "https://git.example.com/acme/docs.git";

/// In-memory stand-in for git, the container engine and the process table.
///
/// Repositories are scripted as file lists; a clone writes them into the
/// destination. Any step can be told to fail with a given output.
#[derive(Default)]
pub struct FakeRuntime {
    repos: Mutex<HashMap<String, Vec<(String, String)>>>,
    failures: Mutex<HashMap<&'static str, String>>,
    clone_delay: Mutex<Option<Duration>>,
    spawn_delay: Mutex<Option<Duration>>,
    calls: Mutex<Vec<String>>,
    containers: Mutex<HashSet<String>>,
    processes: Mutex<HashSet<u32>>,
    next_pid: AtomicU32,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            next_pid: AtomicU32::new(4000),
            ..Default::default()
        }
    }

    pub fn set_repo(&self, url: &str, files: &[(&str, &str)]) {
        self.repos.lock().unwrap().insert(
            url.to_string(),
            files
                .iter()
                .map(|(name, body)| (name.to_string(), body.to_string()))
                .collect(),
        );
    }

    /// Make `step` (clone, build, run, venv, install, spawn) fail with `output`
    pub fn fail(&self, step: &'static str, output: &str) {
        self.failures
            .lock()
            .unwrap()
            .insert(step, output.to_string());
    }

    pub fn clear_failures(&self) {
        self.failures.lock().unwrap().clear();
    }

    pub fn delay_clones(&self, delay: Duration) {
        *self.clone_delay.lock().unwrap() = Some(delay);
    }

    /// Keep spawned processes in their startup grace for `delay`
    pub fn delay_spawns(&self, delay: Duration) {
        *self.spawn_delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn verbs(&self) -> Vec<String> {
        self.calls()
            .iter()
            .map(|call| call.split(' ').next().unwrap_or_default().to_string())
            .collect()
    }

    pub fn live_containers(&self) -> HashSet<String> {
        self.containers.lock().unwrap().clone()
    }

    pub fn live_processes(&self) -> HashSet<u32> {
        self.processes.lock().unwrap().clone()
    }

    /// Remove a container behind the registry's back
    pub fn forget_container(&self, name: &str) {
        self.containers.lock().unwrap().remove(name);
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn failure(&self, step: &str) -> Option<String> {
        self.failures.lock().unwrap().get(step).cloned()
    }
}

#[async_trait]
impl RuntimeBackend for FakeRuntime {
    async fn clone_repository(&self, repo_url: &str, dest: &Path) -> io::Result<CommandOutput> {
        self.record(format!("clone {repo_url}"));

        let delay = *self.clone_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(output) = self.failure("clone") {
            return Ok(CommandOutput::failed(128, output));
        }
        let files = self.repos.lock().unwrap().get(repo_url).cloned();
        let Some(files) = files else {
            return Ok(CommandOutput::failed(
                128,
                format!("fatal: repository '{repo_url}' not found\n"),
            ));
        };

        std::fs::create_dir_all(dest)?;
        for (name, body) in files {
            std::fs::write(dest.join(name), body)?;
        }
        Ok(CommandOutput::succeeded(format!(
            "Cloning into '{}'...\n",
            dest.display()
        )))
    }

    async fn build_image(&self, context_dir: &Path, tag: &str) -> io::Result<CommandOutput> {
        self.record(format!("build {tag}"));
        assert!(context_dir.join("Dockerfile").is_file());
        match self.failure("build") {
            Some(output) => Ok(CommandOutput::failed(1, output)),
            None => Ok(CommandOutput::succeeded(format!("Successfully tagged {tag}\n"))),
        }
    }

    async fn remove_container(&self, name: &str) -> io::Result<CommandOutput> {
        self.record(format!("rm {name}"));
        if self.containers.lock().unwrap().remove(name) {
            Ok(CommandOutput::succeeded(format!("{name}\n")))
        } else {
            Ok(CommandOutput::failed(
                1,
                format!("Error response from daemon: No such container: {name}\n"),
            ))
        }
    }

    async fn run_container(&self, spec: &ContainerSpec) -> io::Result<CommandOutput> {
        self.record(format!("run {} {}m", spec.name, spec.memory_mb));
        if let Some(output) = self.failure("run") {
            // A half-started container still occupies the name
            self.containers.lock().unwrap().insert(spec.name.clone());
            return Ok(CommandOutput::failed(125, output));
        }
        self.containers.lock().unwrap().insert(spec.name.clone());
        Ok(CommandOutput::succeeded("4f2a9c0d1e\n"))
    }

    async fn container_logs(&self, name: &str, tail_lines: usize) -> io::Result<CommandOutput> {
        self.record(format!("logs {name} {tail_lines}"));
        if self.containers.lock().unwrap().contains(name) {
            Ok(CommandOutput::succeeded(" * Running on http://0.0.0.0:8000\n"))
        } else {
            Ok(CommandOutput::failed(
                1,
                format!("Error response from daemon: No such container: {name}\n"),
            ))
        }
    }

    async fn create_environment(
        &self,
        _workspace: &Path,
        env_dir: &Path,
    ) -> io::Result<CommandOutput> {
        self.record("venv".to_string());
        if let Some(output) = self.failure("venv") {
            return Ok(CommandOutput::failed(1, output));
        }
        std::fs::create_dir_all(env_dir.join("bin"))?;
        Ok(CommandOutput::succeeded(""))
    }

    async fn install_dependencies(
        &self,
        _workspace: &Path,
        _env_dir: &Path,
        manifest: &Path,
    ) -> io::Result<CommandOutput> {
        self.record(format!(
            "install {}",
            manifest.file_name().unwrap_or_default().to_string_lossy()
        ));
        match self.failure("install") {
            Some(output) => Ok(CommandOutput::failed(1, output)),
            None => Ok(CommandOutput::succeeded("Successfully installed\n")),
        }
    }

    async fn spawn_process(&self, spec: &ProcessSpec, launched: &LaunchedPid) -> io::Result<u32> {
        self.record(format!("spawn {}", spec.args.join(" ")));
        if let Some(output) = self.failure("spawn") {
            return Err(io::Error::other(output));
        }

        let port = spec
            .env
            .iter()
            .find(|(key, _)| key == "PORT")
            .map(|(_, value)| value.clone())
            .unwrap_or_default();
        std::fs::write(
            &spec.log_path,
            format!("booting\nlistening on {port}\nready\n"),
        )?;

        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.processes.lock().unwrap().insert(pid);
        launched.record(pid);

        let delay = *self.spawn_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(pid)
    }

    async fn terminate_process_group(&self, pid: u32) -> io::Result<CommandOutput> {
        self.record(format!("kill {pid}"));
        if self.processes.lock().unwrap().remove(&pid) {
            Ok(CommandOutput::succeeded(""))
        } else {
            Ok(CommandOutput::failed(
                1,
                format!("kill: (-{pid}) - No such process\n"),
            ))
        }
    }
}

pub struct TestContext {
    pub state: AppState,
    pub runtime: Arc<FakeRuntime>,
    pub db: DatabaseConnection,
    pub root: TempDir,
}

pub fn test_config(root: &Path) -> Config {
    Config {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            frontend_token: TOKEN.to_string(),
        },
        database: DatabaseConfig {
            url: "sqlite::memory:".to_string(),
        },
        deploy: DeployConfig::with_root(root.join("apps")),
        admission: AdmissionConfig {
            free_allowance_mb: 512,
        },
        ledger: LedgerConfig {
            admin_identity: ADMIN.to_string(),
            credits_per_unit: 1,
        },
    }
}

/// One connection, so the in-memory database is shared by every query
pub async fn memory_db() -> DatabaseConnection {
    let mut options = ConnectOptions::new("sqlite::memory:");
    options
        .max_connections(1)
        .min_connections(1)
        .sqlx_logging(false);
    Database::connect(options)
        .await
        .expect("Failed to open in-memory database")
}

pub async fn setup() -> TestContext {
    setup_with(|_| {}).await
}

pub async fn setup_with(adjust: impl FnOnce(&mut Config)) -> TestContext {
    let root = tempfile::tempdir().expect("Failed to create temp dir");
    let mut config = test_config(root.path());
    adjust(&mut config);

    let runtime = Arc::new(FakeRuntime::new());
    runtime.set_repo(SITE, &[("Dockerfile", "FROM python:3.12\n"), ("app.py", "v1\n")]);
    runtime.set_repo(API, &[("Dockerfile", "FROM python:3.12\n")]);
    runtime.set_repo(
        SCRIPT,
        &[("app.py", "print('hi')\n"), ("requirements.txt", "flask\n")],
    );
    runtime.set_repo(DOCS, &[("README.md", "# docs\n")]);

    let db = memory_db().await;
    let state = AppState::with_backend(db.clone(), config, runtime.clone())
        .await
        .expect("Failed to build state");

    TestContext {
        state,
        runtime,
        db,
        root,
    }
}

impl TestContext {
    /// Give `owner` credits through the normal order approval path
    pub async fn grant_credits(&self, owner: &str, amount: i32) -> i32 {
        let order = self
            .state
            .ledger_service
            .create_order(owner, amount)
            .await
            .expect("create order");
        let (_, balance) = self
            .state
            .ledger_service
            .approve(&order.order_id, ADMIN)
            .await
            .expect("approve order");
        balance
    }

    pub async fn credits(&self, owner: &str) -> i32 {
        self.state
            .admission_service
            .balance(owner)
            .await
            .expect("balance")
            .credits
    }
}
