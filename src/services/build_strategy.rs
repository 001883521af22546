use crate::config::DeployConfig;
use std::path::{Path, PathBuf};

/// How a cloned workspace gets turned into a running workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildStrategy {
    /// A build descriptor sits at the workspace root
    Containerized,
    /// No build descriptor, but a recognized entrypoint script
    InterpretedFallback {
        entrypoint: String,
        manifest: Option<PathBuf>,
    },
    Unsupported,
}

impl BuildStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Containerized => "containerized",
            Self::InterpretedFallback { .. } => "interpreted",
            Self::Unsupported => "unsupported",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BuildStrategyDetector {
    build_descriptor: String,
    entrypoints: Vec<String>,
    dependency_manifest: String,
}

impl BuildStrategyDetector {
    pub fn new(config: &DeployConfig) -> Self {
        Self {
            build_descriptor: config.build_descriptor.clone(),
            entrypoints: config.entrypoints.clone(),
            dependency_manifest: config.dependency_manifest.clone(),
        }
    }

    /// Classify a workspace. Only files at the workspace root count, and the
    /// build descriptor always wins over an entrypoint.
    pub fn detect(&self, workspace: &Path) -> BuildStrategy {
        if workspace.join(&self.build_descriptor).is_file() {
            return BuildStrategy::Containerized;
        }

        let entrypoint = self
            .entrypoints
            .iter()
            .find(|entry| workspace.join(entry.as_str()).is_file());

        match entrypoint {
            Some(entry) => {
                let manifest = workspace.join(&self.dependency_manifest);
                BuildStrategy::InterpretedFallback {
                    entrypoint: entry.clone(),
                    manifest: manifest.is_file().then_some(manifest),
                }
            }
            None => BuildStrategy::Unsupported,
        }
    }

    /// Human-readable list of what detection looks for, for error messages
    pub fn expectations(&self) -> String {
        format!(
            "expected a {} or one of [{}] at the repository root",
            self.build_descriptor,
            self.entrypoints.join(", ")
        )
    }
}
