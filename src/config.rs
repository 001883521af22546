use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub deploy: DeployConfig,
    pub admission: AdmissionConfig,
    pub ledger: LedgerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Bearer token the chat front-end presents on every request
    pub frontend_token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeployConfig {
    pub app_root: PathBuf,
    #[serde(default = "default_port")]
    pub default_port: u16,
    #[serde(default = "default_memory_mb")]
    pub default_memory_mb: i32,
    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: i32,
    #[serde(default = "default_runtime_prefix")]
    pub runtime_prefix: String,
    #[serde(default = "default_build_descriptor")]
    pub build_descriptor: String,
    #[serde(default = "default_entrypoints")]
    pub entrypoints: Vec<String>,
    #[serde(default = "default_dependency_manifest")]
    pub dependency_manifest: String,
    #[serde(default = "default_env_file")]
    pub env_file: String,
    #[serde(default = "default_log_file")]
    pub log_file: String,
    #[serde(default = "default_venv_dir")]
    pub venv_dir: String,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default = "default_logs_tail_lines")]
    pub logs_tail_lines: usize,
}

/// Binaries the local runtime shells out to (never through a shell)
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsConfig {
    pub git_bin: String,
    pub docker_bin: String,
    pub python_bin: String,
    pub kill_bin: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            git_bin: "git".to_string(),
            docker_bin: "docker".to_string(),
            python_bin: "python3".to_string(),
            kill_bin: "kill".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutsConfig {
    pub clone_secs: u64,
    pub build_secs: u64,
    pub install_secs: u64,
    pub launch_secs: u64,
    /// A spawned process must survive this long to count as launched
    pub process_startup_grace_ms: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            clone_secs: 300,
            build_secs: 900,
            install_secs: 600,
            launch_secs: 120,
            process_startup_grace_ms: 1500,
        }
    }
}

impl TimeoutsConfig {
    pub fn clone_timeout(&self) -> Duration {
        Duration::from_secs(self.clone_secs)
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_secs)
    }

    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_secs)
    }

    pub fn launch_timeout(&self) -> Duration {
        Duration::from_secs(self.launch_secs)
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.process_startup_grace_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdmissionConfig {
    // Process-wide, not per user
    pub free_allowance_mb: i32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    pub admin_identity: String,
    #[serde(default = "default_credits_per_unit")]
    pub credits_per_unit: i32,
}

fn default_port() -> u16 {
    8000
}

fn default_memory_mb() -> i32 {
    256
}

fn default_max_memory_mb() -> i32 {
    8192
}

fn default_runtime_prefix() -> String {
    "dh".to_string()
}

fn default_build_descriptor() -> String {
    "Dockerfile".to_string()
}

fn default_entrypoints() -> Vec<String> {
    vec!["app.py".to_string(), "main.py".to_string()]
}

fn default_dependency_manifest() -> String {
    "requirements.txt".to_string()
}

fn default_env_file() -> String {
    ".env".to_string()
}

fn default_log_file() -> String {
    "app.log".to_string()
}

fn default_venv_dir() -> String {
    ".venv".to_string()
}

fn default_logs_tail_lines() -> usize {
    200
}

fn default_credits_per_unit() -> i32 {
    1
}

impl DeployConfig {
    /// Defaults for everything but the workspace root
    pub fn with_root(app_root: impl Into<PathBuf>) -> Self {
        Self {
            app_root: app_root.into(),
            default_port: default_port(),
            default_memory_mb: default_memory_mb(),
            max_memory_mb: default_max_memory_mb(),
            runtime_prefix: default_runtime_prefix(),
            build_descriptor: default_build_descriptor(),
            entrypoints: default_entrypoints(),
            dependency_manifest: default_dependency_manifest(),
            env_file: default_env_file(),
            log_file: default_log_file(),
            venv_dir: default_venv_dir(),
            tools: ToolsConfig::default(),
            timeouts: TimeoutsConfig::default(),
            logs_tail_lines: default_logs_tail_lines(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        // Load .env file if it exists (for environment variable overrides)
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(true))
            .add_source(
                config::Environment::with_prefix("DECKHAND")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("deploy.entrypoints")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }
}
