use crate::{
    config::DeployConfig,
    error::{ApiError, Result},
};
use dashmap::DashSet;
use std::path::PathBuf;
use tracing::{debug, info, instrument};
use uuid::Uuid;

const URL_SCHEMES: [&str; 5] = ["https://", "http://", "ssh://", "git://", "file://"];
const MAX_IDENTITY_LEN: usize = 128;

/// Naming and on-disk workspace layout: `<app_root>/<owner>/<repo_name>/`.
pub struct WorkspaceService {
    app_root: PathBuf,
    runtime_prefix: String,
    // Names of deploys in flight; the database unique index covers recorded ones
    allocated: DashSet<String>,
}

impl WorkspaceService {
    pub fn new(config: &DeployConfig) -> Self {
        Self {
            app_root: config.app_root.clone(),
            runtime_prefix: config.runtime_prefix.clone(),
            allocated: DashSet::new(),
        }
    }

    /// Derive the repository short name from its URL: the final path segment
    /// without a trailing `.git`.
    pub fn repo_short_name(repo_url: &str) -> Result<String> {
        let path = repo_path(repo_url)?;

        let segment = path
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default();
        let name = segment.strip_suffix(".git").unwrap_or(segment);

        if name.is_empty() || name == "." || name == ".." {
            return Err(ApiError::InvalidRequest(format!(
                "Cannot derive a repository name from {repo_url}"
            )));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        {
            return Err(ApiError::InvalidRequest(format!(
                "Repository name {name:?} contains unsupported characters"
            )));
        }

        Ok(name.to_string())
    }

    pub fn workspace_path(&self, owner_id: &str, repo_name: &str) -> PathBuf {
        self.app_root.join(owner_id).join(repo_name)
    }

    /// Resolve the workspace for (owner, repo), destroying whatever a previous
    /// deploy left there. The directory itself is left for the clone to create.
    #[instrument(skip(self))]
    pub async fn prepare_workspace(&self, owner_id: &str, repo_name: &str) -> Result<PathBuf> {
        validate_owner_id(owner_id)?;
        let path = self.workspace_path(owner_id, repo_name);

        if tokio::fs::try_exists(&path)
            .await
            .map_err(|e| ApiError::Internal(e.into()))?
        {
            info!(path = %path.display(), "removing previous workspace");
            tokio::fs::remove_dir_all(&path)
                .await
                .map_err(|e| ApiError::Internal(e.into()))?;
        }

        let owner_root = self.app_root.join(owner_id);
        tokio::fs::create_dir_all(&owner_root)
            .await
            .map_err(|e| ApiError::Internal(e.into()))?;

        Ok(path)
    }

    /// Allocate a runtime name unique across this process:
    /// `<prefix>_<owner>_<repo>_<random>`, lowercased for image tags.
    pub fn allocate_runtime_name(&self, owner_id: &str, repo_name: &str) -> String {
        let base = format!(
            "{}_{}_{}",
            self.runtime_prefix,
            sanitize_component(owner_id),
            sanitize_component(repo_name)
        );

        loop {
            let suffix = Uuid::new_v4().simple().to_string();
            let candidate = format!("{}_{}", base, &suffix[..8]);
            if self.allocated.insert(candidate.clone()) {
                debug!(runtime_name = %candidate, "allocated runtime name");
                return candidate;
            }
        }
    }

    /// Forget a name once its deploy has finished, successfully or not
    pub fn release_runtime_name(&self, runtime_name: &str) {
        self.allocated.remove(runtime_name);
    }

    pub fn names_in_flight(&self) -> usize {
        self.allocated.len()
    }
}

/// Owner identities become directory names, so they are held to a strict
/// alphabet.
pub fn validate_owner_id(owner_id: &str) -> Result<()> {
    let valid = !owner_id.is_empty()
        && owner_id.len() <= MAX_IDENTITY_LEN
        && owner_id != "."
        && owner_id != ".."
        && owner_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '@'));

    if valid {
        Ok(())
    } else {
        Err(ApiError::InvalidRequest(format!(
            "Invalid owner identity {owner_id:?}"
        )))
    }
}

/// Validate the URL and return its path portion (everything after the host).
fn repo_path(repo_url: &str) -> Result<&str> {
    let url = repo_url.trim();
    if url.is_empty() {
        return Err(ApiError::InvalidRequest(
            "Repository URL is empty".to_string(),
        ));
    }
    if url.starts_with('-') || url.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(ApiError::InvalidRequest(format!(
            "Malformed repository URL {repo_url:?}"
        )));
    }

    if let Some(scheme) = URL_SCHEMES.iter().find(|scheme| url.starts_with(**scheme)) {
        let rest = &url[scheme.len()..];
        return Ok(rest.split_once('/').map(|(_, path)| path).unwrap_or_default());
    }

    // scp-like syntax: user@host:path
    if !url.contains("://") {
        if let Some((_, host_and_path)) = url.split_once('@') {
            if let Some((_, path)) = host_and_path.split_once(':') {
                return Ok(path);
            }
        }
    }

    Err(ApiError::InvalidRequest(format!(
        "Unsupported repository URL {repo_url:?}"
    )))
}

/// Lowercase alphanumerics joined by single `-`, so the assembled name is a
/// valid image reference component.
fn sanitize_component(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut pending_separator = false;
    for c in value.chars().map(|c| c.to_ascii_lowercase()) {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            if pending_separator && !out.is_empty() {
                out.push('-');
            }
            pending_separator = false;
            out.push(c);
        } else {
            pending_separator = true;
        }
    }

    if out.is_empty() {
        out.push('x');
    }
    out
}
