use crate::{
    config::DeployConfig,
    error::{ApiError, Result, StopError},
    runtime::{read_log_tail, RuntimeBackend, RuntimeHandle},
};
use anyhow::anyhow;
use entity::sea_orm_active_enums::{ApplicationStatus, RuntimeKind};
use sea_orm::{entity::*, query::*, ConnectionTrait, DatabaseConnection, DatabaseTransaction};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Result of a log read. "Nothing printed yet" and "cannot read logs for
/// this runtime" are different answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogsOutput {
    Available(String),
    Unavailable(String),
}

/// Fields of an admitted deploy, recorded before the pipeline runs
#[derive(Debug, Clone)]
pub struct NewApplication {
    pub owner_id: String,
    pub name: String,
    pub repository_url: String,
    pub memory_mb: i32,
    pub runtime_name: String,
    pub workspace_path: PathBuf,
    pub credit_deficit: i32,
}

/// Maps (owner, application name) to its live runtime and status.
pub struct RegistryService {
    db: DatabaseConnection,
    backend: Arc<dyn RuntimeBackend>,
    teardown_timeout: Duration,
    logs_tail_lines: usize,
}

impl RegistryService {
    pub fn new(
        db: DatabaseConnection,
        backend: Arc<dyn RuntimeBackend>,
        config: &DeployConfig,
    ) -> Self {
        Self {
            db,
            backend,
            teardown_timeout: config.timeouts.launch_timeout(),
            logs_tail_lines: config.logs_tail_lines,
        }
    }

    /// Record an admitted deploy as pending. Its `credit_deficit` stays
    /// reserved until the row leaves `pending`.
    #[instrument(skip(self, new, txn), fields(owner = %new.owner_id, name = %new.name))]
    pub async fn register_pending_in_txn(
        &self,
        new: NewApplication,
        txn: &DatabaseTransaction,
    ) -> Result<entity::applications::Model> {
        let now = time::OffsetDateTime::now_utc();
        let app = entity::applications::ActiveModel {
            id: Set(Uuid::now_v7()),
            owner_id: Set(new.owner_id),
            name: Set(new.name),
            repository_url: Set(new.repository_url),
            memory_mb: Set(new.memory_mb),
            runtime_name: Set(new.runtime_name),
            runtime_kind: Set(None),
            runtime_handle: Set(String::new()),
            workspace_path: Set(new.workspace_path.to_string_lossy().into_owned()),
            log_path: Set(None),
            credit_deficit: Set(new.credit_deficit),
            status: Set(ApplicationStatus::Pending),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(txn)
        .await?;

        info!(
            "Registered pending application {} ({}), memory={}MB, reserved={}",
            app.name, app.runtime_name, app.memory_mb, app.credit_deficit
        );
        Ok(app)
    }

    /// Drop leftovers of earlier attempts for this pair that never produced a
    /// runtime. The caller holds the pair's section, so none is in flight.
    pub async fn purge_stale_in_txn(
        &self,
        owner_id: &str,
        name: &str,
        txn: &DatabaseTransaction,
    ) -> Result<u64> {
        let purged = entity::applications::Entity::delete_many()
            .filter(entity::applications::Column::OwnerId.eq(owner_id))
            .filter(entity::applications::Column::Name.eq(name))
            .filter(
                entity::applications::Column::Status
                    .is_in([ApplicationStatus::Pending, ApplicationStatus::Failed]),
            )
            .exec(txn)
            .await?;
        Ok(purged.rows_affected)
    }

    pub async fn mark_running_in_txn(
        &self,
        id: Uuid,
        handle: &RuntimeHandle,
        txn: &DatabaseTransaction,
    ) -> Result<entity::applications::Model> {
        let app = entity::applications::Entity::find_by_id(id)
            .one(txn)
            .await?
            .ok_or_else(|| ApiError::Internal(anyhow!("Application {} vanished mid-deploy", id)))?;

        let mut active: entity::applications::ActiveModel = app.into();
        active.status = Set(ApplicationStatus::Running);
        active.runtime_kind = Set(Some(handle.kind));
        active.runtime_handle = Set(handle.id.clone());
        active.log_path = Set(handle
            .log_path()
            .map(|path| path.to_string_lossy().into_owned()));
        active.updated_at = Set(time::OffsetDateTime::now_utc());

        Ok(active.update(txn).await?)
    }

    /// Release a pending row's reservation and leave it as a failed record
    pub async fn mark_failed<C: ConnectionTrait>(&self, id: Uuid, conn: &C) -> Result<()> {
        mark_failed_in(id, conn).await
    }

    /// Stop every other running instance of the application once its
    /// replacement is confirmed. Returns the retired rows for teardown.
    pub async fn retire_previous_in_txn(
        &self,
        owner_id: &str,
        name: &str,
        keep: Uuid,
        txn: &DatabaseTransaction,
    ) -> Result<Vec<entity::applications::Model>> {
        let previous = entity::applications::Entity::find()
            .filter(entity::applications::Column::OwnerId.eq(owner_id))
            .filter(entity::applications::Column::Name.eq(name))
            .filter(entity::applications::Column::Status.eq(ApplicationStatus::Running))
            .filter(entity::applications::Column::Id.ne(keep))
            .all(txn)
            .await?;

        if !previous.is_empty() {
            entity::applications::Entity::update_many()
                .set(entity::applications::ActiveModel {
                    status: Set(ApplicationStatus::Stopped),
                    updated_at: Set(time::OffsetDateTime::now_utc()),
                    ..Default::default()
                })
                .filter(
                    entity::applications::Column::Id
                        .is_in(previous.iter().map(|app| app.id).collect::<Vec<_>>()),
                )
                .exec(txn)
                .await?;
        }

        Ok(previous)
    }

    /// The application's current record: its live instance if there is one,
    /// otherwise the most recent attempt.
    #[instrument(skip(self))]
    pub async fn get(&self, owner_id: &str, name: &str) -> Result<entity::applications::Model> {
        let rows = entity::applications::Entity::find()
            .filter(entity::applications::Column::OwnerId.eq(owner_id))
            .filter(entity::applications::Column::Name.eq(name))
            .order_by_desc(entity::applications::Column::CreatedAt)
            .all(&self.db)
            .await?;

        current(rows).ok_or_else(|| ApiError::NotFound(format!("Application {name} not found")))
    }

    /// One entry per application name, as [`Self::get`] would report it
    #[instrument(skip(self))]
    pub async fn list(&self, owner_id: &str) -> Result<Vec<entity::applications::Model>> {
        let rows = entity::applications::Entity::find()
            .filter(entity::applications::Column::OwnerId.eq(owner_id))
            .order_by_asc(entity::applications::Column::Name)
            .order_by_desc(entity::applications::Column::CreatedAt)
            .all(&self.db)
            .await?;

        let mut apps = Vec::new();
        let mut group: Vec<entity::applications::Model> = Vec::new();
        for row in rows {
            if group.first().is_some_and(|first| first.name != row.name) {
                apps.extend(current(std::mem::take(&mut group)));
            }
            group.push(row);
        }
        apps.extend(current(group));

        Ok(apps)
    }

    /// Tear down a running application's runtime and mark it stopped. If the
    /// teardown fails the status is left as it was.
    #[instrument(skip(self))]
    pub async fn stop(&self, owner_id: &str, name: &str) -> Result<entity::applications::Model> {
        let app = self
            .get(owner_id, name)
            .await
            .map_err(|e| match e {
                ApiError::NotFound(_) => StopError::NotFound(name.to_string()).into(),
                other => other,
            })?;

        if app.status != ApplicationStatus::Running {
            return Err(StopError::NotRunning {
                name: name.to_string(),
                status: app.status.to_value(),
            }
            .into());
        }

        self.teardown(&app).await?;

        let mut active: entity::applications::ActiveModel = app.into();
        active.status = Set(ApplicationStatus::Stopped);
        active.updated_at = Set(time::OffsetDateTime::now_utc());
        let stopped = active.update(&self.db).await?;

        info!("Stopped application {} ({})", stopped.name, stopped.runtime_handle);
        Ok(stopped)
    }

    /// Remove the container or terminate the process group behind `app`
    pub async fn teardown(
        &self,
        app: &entity::applications::Model,
    ) -> std::result::Result<(), StopError> {
        let handle = app.runtime_handle.as_str();
        let result = match app.runtime_kind {
            Some(_) if handle.is_empty() => {
                return Err(StopError::RuntimeNotFound(app.runtime_name.clone()))
            }
            None => return Err(StopError::RuntimeNotFound(app.runtime_name.clone())),
            Some(RuntimeKind::Container) => {
                tokio::time::timeout(self.teardown_timeout, self.backend.remove_container(handle))
                    .await
            }
            Some(RuntimeKind::Process) => {
                let pid: u32 = handle.parse().map_err(|_| {
                    StopError::TeardownFailed(format!("invalid process id {handle:?}"))
                })?;
                tokio::time::timeout(
                    self.teardown_timeout,
                    self.backend.terminate_process_group(pid),
                )
                .await
            }
        };

        match result {
            Err(_) => Err(StopError::TeardownFailed(format!(
                "teardown timed out after {:?}",
                self.teardown_timeout
            ))),
            Ok(Err(e)) => Err(StopError::TeardownFailed(e.to_string())),
            Ok(Ok(output)) if output.success => Ok(()),
            Ok(Ok(output)) if is_missing_runtime(&output.output) => {
                warn!(handle, "runtime already gone");
                Err(StopError::RuntimeNotFound(handle.to_string()))
            }
            Ok(Ok(output)) => Err(StopError::TeardownFailed(output.output)),
        }
    }

    /// Last `tail` lines (configured default when `None`) of the
    /// application's output.
    #[instrument(skip(self))]
    pub async fn fetch_logs(
        &self,
        owner_id: &str,
        name: &str,
        tail: Option<usize>,
    ) -> Result<LogsOutput> {
        let app = self.get(owner_id, name).await?;
        let lines = tail.unwrap_or(self.logs_tail_lines);

        match (app.runtime_kind, app.log_path.as_deref()) {
            (Some(RuntimeKind::Process), Some(path)) => read_file_tail(Path::new(path), lines).await,
            (Some(RuntimeKind::Container), _) if !app.runtime_handle.is_empty() => {
                let output = self
                    .backend
                    .container_logs(&app.runtime_handle, lines)
                    .await
                    .map_err(|e| ApiError::Internal(e.into()))?;
                if output.success {
                    Ok(LogsOutput::Available(output.output))
                } else {
                    Ok(LogsOutput::Unavailable(output.output))
                }
            }
            _ => Ok(LogsOutput::Unavailable(format!(
                "application {name} has no runtime ({})",
                app.status.to_value()
            ))),
        }
    }

    /// Deploys interrupted by a restart can never finish; release their
    /// reservations.
    pub async fn reconcile_interrupted(&self) -> Result<u64> {
        let interrupted = entity::applications::Entity::update_many()
            .set(entity::applications::ActiveModel {
                status: Set(ApplicationStatus::Failed),
                credit_deficit: Set(0),
                updated_at: Set(time::OffsetDateTime::now_utc()),
                ..Default::default()
            })
            .filter(entity::applications::Column::Status.eq(ApplicationStatus::Pending))
            .exec(&self.db)
            .await?;

        if interrupted.rows_affected > 0 {
            warn!(
                "Marked {} interrupted deploys as failed",
                interrupted.rows_affected
            );
        }
        Ok(interrupted.rows_affected)
    }
}

pub(crate) async fn mark_failed_in<C: ConnectionTrait>(id: Uuid, conn: &C) -> Result<()> {
    entity::applications::Entity::update_many()
        .set(entity::applications::ActiveModel {
            status: Set(ApplicationStatus::Failed),
            credit_deficit: Set(0),
            updated_at: Set(time::OffsetDateTime::now_utc()),
            ..Default::default()
        })
        .filter(entity::applications::Column::Id.eq(id))
        .filter(entity::applications::Column::Status.eq(ApplicationStatus::Pending))
        .exec(conn)
        .await?;
    Ok(())
}

/// Rows must be newest first
fn current(rows: Vec<entity::applications::Model>) -> Option<entity::applications::Model> {
    let live = rows.iter().position(|app| {
        matches!(
            app.status,
            ApplicationStatus::Running | ApplicationStatus::Pending
        )
    });
    let index = live.unwrap_or(0);
    rows.into_iter().nth(index)
}

fn is_missing_runtime(output: &str) -> bool {
    let lower = output.to_ascii_lowercase();
    lower.contains("no such container") || lower.contains("no such process")
}

async fn read_file_tail(path: &Path, lines: usize) -> Result<LogsOutput> {
    let path = path.to_path_buf();
    let display = path.display().to_string();
    let read = tokio::task::spawn_blocking(move || read_log_tail(&path, lines))
        .await
        .map_err(|e| ApiError::Internal(e.into()))?;

    match read {
        Ok(text) => Ok(LogsOutput::Available(text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(LogsOutput::Unavailable(
            format!("log file {display} does not exist"),
        )),
        Err(e) => Ok(LogsOutput::Unavailable(format!(
            "log file {display} is unreadable: {e}"
        ))),
    }
}
