use crate::{
    config::Config,
    runtime::{LocalRuntime, RuntimeBackend},
    services::{
        AdmissionService, DeployService, LedgerService, RegistryService, WorkspaceService,
    },
    utils::KeyedLocks,
};
use migration::{Migrator, MigratorTrait};
use sea_orm::DatabaseConnection;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub db: DatabaseConnection,
    pub admission_service: Arc<AdmissionService>,
    pub ledger_service: Arc<LedgerService>,
    pub registry_service: Arc<RegistryService>,
    pub deploy_service: Arc<DeployService>,
    pub config: Arc<Config>,
}

impl AppState {
    pub async fn new(config: Config) -> Result<Self, anyhow::Error> {
        // Connect to database
        let db = sea_orm::Database::connect(&config.database.url).await?;

        let backend: Arc<dyn RuntimeBackend> = Arc::new(LocalRuntime::new(&config.deploy));
        Self::with_backend(db, config, backend).await
    }

    /// Wire every service around an existing connection and runtime backend.
    /// Migrations run and deploys interrupted by a previous shutdown are
    /// released before anything is served.
    pub async fn with_backend(
        db: DatabaseConnection,
        config: Config,
        backend: Arc<dyn RuntimeBackend>,
    ) -> Result<Self, anyhow::Error> {
        Migrator::up(&db, None).await?;

        tokio::fs::create_dir_all(&config.deploy.app_root).await?;

        // Deploys and order approvals for one user share these sections
        let user_locks = Arc::new(KeyedLocks::new());

        let workspace = Arc::new(WorkspaceService::new(&config.deploy));
        let admission_service = Arc::new(AdmissionService::new(db.clone(), &config.admission));
        let ledger_service = Arc::new(LedgerService::new(
            db.clone(),
            user_locks.clone(),
            &config.ledger,
        ));
        let registry_service = Arc::new(RegistryService::new(
            db.clone(),
            backend.clone(),
            &config.deploy,
        ));

        let interrupted = registry_service.reconcile_interrupted().await?;
        if interrupted > 0 {
            tracing::warn!("Released {} deploys interrupted by shutdown", interrupted);
        }

        let deploy_service = Arc::new(DeployService::new(
            db.clone(),
            backend,
            admission_service.clone(),
            ledger_service.clone(),
            registry_service.clone(),
            workspace,
            user_locks,
            &config.deploy,
        ));

        Ok(Self {
            db,
            admission_service,
            ledger_service,
            registry_service,
            deploy_service,
            config: Arc::new(config),
        })
    }
}
