use crate::{
    config::DeployConfig,
    error::{ApiError, Result},
    runtime::{LaunchedPid, RuntimeBackend},
    services::{
        admission_service::AdmissionService,
        build_strategy::BuildStrategy,
        ledger_service::{get_or_create_user_in, LedgerService},
        pipeline_service::{DeployedRuntime, DeploymentPipeline, PipelineRequest},
        registry_service::{mark_failed_in, NewApplication, RegistryService},
        workspace_service::{validate_owner_id, WorkspaceService},
    },
    utils::KeyedLocks,
};
use sea_orm::{DatabaseConnection, TransactionTrait};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct DeployOutcome {
    pub app: entity::applications::Model,
    pub strategy: BuildStrategy,
    pub credits_debited: i32,
    pub credits_remaining: i32,
    /// Previous runtimes of this application that could not be torn down
    pub teardown_warnings: Vec<String>,
}

/// Admission, pipeline, registry and ledger for one deploy request.
///
/// Lock order is pair section, then user section, then database
/// transaction. The user section is only held for the two short
/// transactions on either side of the pipeline; the pending row's
/// reservation keeps concurrent deploys from spending the same credit.
pub struct DeployService {
    db: DatabaseConnection,
    backend: Arc<dyn RuntimeBackend>,
    admission: Arc<AdmissionService>,
    ledger: Arc<LedgerService>,
    registry: Arc<RegistryService>,
    workspace: Arc<WorkspaceService>,
    pipeline: DeploymentPipeline,
    pair_locks: KeyedLocks,
    user_locks: Arc<KeyedLocks>,
    default_memory_mb: i32,
    max_memory_mb: i32,
}

impl DeployService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: DatabaseConnection,
        backend: Arc<dyn RuntimeBackend>,
        admission: Arc<AdmissionService>,
        ledger: Arc<LedgerService>,
        registry: Arc<RegistryService>,
        workspace: Arc<WorkspaceService>,
        user_locks: Arc<KeyedLocks>,
        config: &DeployConfig,
    ) -> Self {
        Self {
            pipeline: DeploymentPipeline::new(backend.clone(), workspace.clone(), config),
            db,
            backend,
            admission,
            ledger,
            registry,
            workspace,
            pair_locks: KeyedLocks::new(),
            user_locks,
            default_memory_mb: config.default_memory_mb,
            max_memory_mb: config.max_memory_mb,
        }
    }

    /// Deploy `repo_url` for `owner_id`, replacing any running instance of
    /// the same repository once the new one is up.
    #[instrument(skip(self))]
    pub async fn deploy(
        &self,
        owner_id: &str,
        repo_url: &str,
        memory_mb: Option<i32>,
    ) -> Result<DeployOutcome> {
        let memory_mb = memory_mb.unwrap_or(self.default_memory_mb);
        if memory_mb <= 0 {
            return Err(ApiError::InvalidRequest(format!(
                "Requested memory must be positive, got {memory_mb} MB"
            )));
        }
        if memory_mb > self.max_memory_mb {
            return Err(ApiError::InvalidRequest(format!(
                "Requested memory {memory_mb} MB exceeds the {} MB limit",
                self.max_memory_mb
            )));
        }
        validate_owner_id(owner_id)?;
        let name = WorkspaceService::repo_short_name(repo_url)?;

        let _pair = self
            .pair_locks
            .lock(&KeyedLocks::pair_key(owner_id, &name))
            .await;

        let runtime_name = self.workspace.allocate_runtime_name(owner_id, &name);
        let _lease = NameLease {
            workspace: self.workspace.as_ref(),
            runtime_name: &runtime_name,
        };
        let pending = self
            .admit(owner_id, &name, repo_url, memory_mb, &runtime_name)
            .await?;

        let request = PipelineRequest {
            owner_id: owner_id.to_string(),
            repo_url: repo_url.to_string(),
            repo_name: name.clone(),
            runtime_name: runtime_name.clone(),
            memory_mb,
            launched: LaunchedPid::new(),
        };

        let guard = PendingDeployGuard::arm(PendingCleanup {
            db: self.db.clone(),
            backend: self.backend.clone(),
            app_id: pending.id,
            runtime_name: runtime_name.clone(),
            launched: request.launched.clone(),
        });
        let result = self.pipeline.run(&request).await;
        guard.disarm();

        let deployed = match result {
            Ok(deployed) => deployed,
            Err(e) => {
                warn!(step = e.step(), runtime_name = %runtime_name, "deploy failed");
                // The reservation goes with the pending state; no credit is taken
                if let Err(mark) = self.registry.mark_failed(pending.id, &self.db).await {
                    error!("Failed to mark {} as failed: {}", runtime_name, mark);
                }
                return Err(e.into());
            }
        };

        let (app, credits_remaining, retired) = match self.commit(owner_id, &pending, &deployed).await {
            Ok(committed) => committed,
            Err(e) => {
                error!("Could not record runtime {}: {}", runtime_name, e);
                self.abandon(&pending, &deployed).await;
                return Err(e);
            }
        };

        let mut teardown_warnings = Vec::new();
        for old in &retired {
            match self.registry.teardown(old).await {
                Ok(()) => info!("Tore down previous runtime {}", old.runtime_handle),
                Err(e) => {
                    warn!("Previous runtime {} not torn down: {}", old.runtime_name, e);
                    teardown_warnings.push(format!("{}: {}", old.runtime_name, e));
                }
            }
        }

        info!(
            "Deployed {} for {} as {} ({}), debited={}, remaining={}",
            app.name,
            owner_id,
            app.runtime_name,
            deployed.strategy.as_str(),
            pending.credit_deficit,
            credits_remaining
        );

        Ok(DeployOutcome {
            app,
            strategy: deployed.strategy,
            credits_debited: pending.credit_deficit,
            credits_remaining,
            teardown_warnings,
        })
    }

    /// Admit the request and record it as pending, reserving its deficit
    async fn admit(
        &self,
        owner_id: &str,
        name: &str,
        repo_url: &str,
        memory_mb: i32,
        runtime_name: &str,
    ) -> Result<entity::applications::Model> {
        let _user = self.user_locks.lock(owner_id).await;
        let txn = self.db.begin().await?;

        get_or_create_user_in(owner_id, &txn).await?;
        let purged = self.registry.purge_stale_in_txn(owner_id, name, &txn).await?;
        if purged > 0 {
            info!("Purged {} stale records of {}", purged, name);
        }

        let usage = self.admission.usage(owner_id, Some(name), &txn).await?;
        let decision = self.admission.evaluate(&usage, memory_mb)?;

        if !decision.admitted {
            txn.rollback().await?;
            info!(
                "Denied {}MB for {}: deficit={}, available credits={}",
                memory_mb,
                owner_id,
                decision.credit_deficit,
                usage.available_credits()
            );
            return Err(ApiError::InsufficientCredit {
                requested_mb: memory_mb,
                deficit: decision.credit_deficit,
            });
        }

        let app = self
            .registry
            .register_pending_in_txn(
                NewApplication {
                    owner_id: owner_id.to_string(),
                    name: name.to_string(),
                    repository_url: repo_url.to_string(),
                    memory_mb,
                    runtime_name: runtime_name.to_string(),
                    workspace_path: self.workspace.workspace_path(owner_id, name),
                    credit_deficit: decision.credit_deficit,
                },
                &txn,
            )
            .await?;
        txn.commit().await?;

        Ok(app)
    }

    /// Debit the reservation, mark the new instance running and retire the
    /// old ones, all in one transaction.
    async fn commit(
        &self,
        owner_id: &str,
        pending: &entity::applications::Model,
        deployed: &DeployedRuntime,
    ) -> Result<(entity::applications::Model, i32, Vec<entity::applications::Model>)> {
        let _user = self.user_locks.lock(owner_id).await;
        let txn = self.db.begin().await?;

        let balance = self
            .ledger
            .debit_in_txn(owner_id, pending.credit_deficit, &txn)
            .await?;
        let running = self
            .registry
            .mark_running_in_txn(pending.id, &deployed.handle, &txn)
            .await?;
        let retired = self
            .registry
            .retire_previous_in_txn(owner_id, &pending.name, pending.id, &txn)
            .await?;

        txn.commit().await?;
        Ok((running, balance, retired))
    }

    /// A runtime came up but could not be recorded: take it down again
    async fn abandon(&self, pending: &entity::applications::Model, deployed: &DeployedRuntime) {
        let mut orphan = pending.clone();
        orphan.runtime_kind = Some(deployed.handle.kind);
        orphan.runtime_handle = deployed.handle.id.clone();

        if let Err(e) = self.registry.teardown(&orphan).await {
            error!("Orphaned runtime {} left behind: {}", orphan.runtime_name, e);
        }
        if let Err(e) = self.registry.mark_failed(pending.id, &self.db).await {
            error!("Failed to mark {} as failed: {}", orphan.runtime_name, e);
        }
    }
}

/// Holds an allocated runtime name for the lifetime of one deploy call
struct NameLease<'a> {
    workspace: &'a WorkspaceService,
    runtime_name: &'a str,
}

impl Drop for NameLease<'_> {
    fn drop(&mut self) {
        self.workspace.release_runtime_name(self.runtime_name);
    }
}

/// What a deploy dropped mid-pipeline leaves behind
struct PendingCleanup {
    db: DatabaseConnection,
    backend: Arc<dyn RuntimeBackend>,
    app_id: Uuid,
    runtime_name: String,
    launched: LaunchedPid,
}

impl PendingCleanup {
    async fn run(self) {
        if let Err(e) = mark_failed_in(self.app_id, &self.db).await {
            error!("Failed to mark cancelled deploy {} as failed: {}", self.runtime_name, e);
        }
        if let Some(pid) = self.launched.get() {
            match self.backend.terminate_process_group(pid).await {
                Ok(output) if output.success => {
                    info!("Terminated process {} of cancelled deploy {}", pid, self.runtime_name)
                }
                Ok(output) => warn!("Process {} of cancelled deploy not terminated: {}", pid, output.output),
                Err(e) => warn!("Process {} of cancelled deploy not terminated: {}", pid, e),
            }
            return;
        }
        if let Err(e) = self.backend.remove_container(&self.runtime_name).await {
            warn!("Cleanup of cancelled deploy {} failed: {}", self.runtime_name, e);
        }
    }
}

/// Cleans up after a deploy whose future is dropped mid-pipeline: the
/// pending row is failed (releasing its reservation) and whatever runtime
/// was started under it, container or process group, is removed.
struct PendingDeployGuard {
    cleanup: Option<PendingCleanup>,
}

impl PendingDeployGuard {
    fn arm(cleanup: PendingCleanup) -> Self {
        Self {
            cleanup: Some(cleanup),
        }
    }

    fn disarm(mut self) {
        self.cleanup = None;
    }
}

impl Drop for PendingDeployGuard {
    fn drop(&mut self) {
        let Some(cleanup) = self.cleanup.take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        warn!(runtime_name = %cleanup.runtime_name, "deploy cancelled mid-pipeline");
        handle.spawn(cleanup.run());
    }
}
