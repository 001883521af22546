//! Runtime control: the seam between the deploy core and the external tools
//! (git, the container engine, the Python toolchain, process signals).
//!
//! Everything behind [`RuntimeBackend`] is an external process invocation.
//! The core only ever sees captured output and exit status, which keeps the
//! pipeline testable with a scripted backend.

mod local;

pub use local::LocalRuntime;

use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use entity::sea_orm_active_enums::RuntimeKind;

/// Captured result of one external command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    /// stdout followed by stderr, lossily decoded
    pub output: String,
}

impl CommandOutput {
    pub fn succeeded(output: impl Into<String>) -> Self {
        Self {
            success: true,
            exit_code: Some(0),
            output: output.into(),
        }
    }

    pub fn failed(exit_code: i32, output: impl Into<String>) -> Self {
        Self {
            success: false,
            exit_code: Some(exit_code),
            output: output.into(),
        }
    }
}

/// Parameters for starting a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// Hard memory ceiling
    pub memory_mb: i32,
    pub env_file: Option<PathBuf>,
}

/// Parameters for starting a supervised background process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub workspace: PathBuf,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// stdout and stderr are both appended here
    pub log_path: PathBuf,
}

/// Pid of a spawned process, published as soon as the child exists so a
/// cancelled or timed-out launch can still find and terminate it.
#[derive(Debug, Clone, Default)]
pub struct LaunchedPid(Arc<OnceLock<u32>>);

impl LaunchedPid {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, pid: u32) {
        let _ = self.0.set(pid);
    }

    pub fn get(&self) -> Option<u32> {
        self.0.get().copied()
    }
}

/// Where the output of a live runtime can be read back from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogLocation {
    Container(String),
    File(PathBuf),
}

/// Opaque reference to the live container or process backing an application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeHandle {
    pub kind: RuntimeKind,
    /// Container name or process id
    pub id: String,
    pub log: LogLocation,
}

impl RuntimeHandle {
    pub fn log_path(&self) -> Option<&Path> {
        match &self.log {
            LogLocation::File(path) => Some(path),
            LogLocation::Container(_) => None,
        }
    }
}

#[async_trait]
pub trait RuntimeBackend: Send + Sync {
    /// Clone `repo_url` into `dest`.
    async fn clone_repository(&self, repo_url: &str, dest: &Path) -> io::Result<CommandOutput>;

    /// Build the image described by the workspace build descriptor.
    async fn build_image(&self, context_dir: &Path, tag: &str) -> io::Result<CommandOutput>;

    /// Force-remove a container by name.
    async fn remove_container(&self, name: &str) -> io::Result<CommandOutput>;

    /// Start a detached container.
    async fn run_container(&self, spec: &ContainerSpec) -> io::Result<CommandOutput>;

    async fn container_logs(&self, name: &str, tail_lines: usize) -> io::Result<CommandOutput>;

    /// Create an isolated dependency environment at `env_dir`.
    async fn create_environment(&self, workspace: &Path, env_dir: &Path)
        -> io::Result<CommandOutput>;

    async fn install_dependencies(
        &self,
        workspace: &Path,
        env_dir: &Path,
        manifest: &Path,
    ) -> io::Result<CommandOutput>;

    /// Start a detached process in its own process group and return its pid
    /// once it has survived startup. The pid goes into `launched` right after
    /// the spawn.
    async fn spawn_process(&self, spec: &ProcessSpec, launched: &LaunchedPid) -> io::Result<u32>;

    /// Terminate every process in the group led by `pid`.
    async fn terminate_process_group(&self, pid: u32) -> io::Result<CommandOutput>;
}

const TAIL_WINDOW_BYTES: u64 = 256 * 1024;

/// Last `lines` lines of a log file. Only the final window of the file is
/// read, so this stays cheap on long-running processes.
pub fn read_log_tail(path: &Path, lines: usize) -> io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let len = file.metadata()?.len();
    let start = len.saturating_sub(TAIL_WINDOW_BYTES);
    file.seek(SeekFrom::Start(start))?;

    let mut buf = Vec::with_capacity((len - start) as usize);
    file.read_to_end(&mut buf)?;
    let text = String::from_utf8_lossy(&buf);

    Ok(last_lines(&text, lines))
}

pub(crate) fn last_lines(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    let skip = all.len().saturating_sub(lines);
    all[skip..].join("\n")
}
