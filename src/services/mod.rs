// Service modules
pub mod admission_service;
pub mod build_strategy;
pub mod deploy_service;
pub mod ledger_service;
pub mod pipeline_service;
pub mod registry_service;
pub mod workspace_service;

pub use admission_service::AdmissionService;
pub use build_strategy::{BuildStrategy, BuildStrategyDetector};
pub use deploy_service::{DeployOutcome, DeployService};
pub use ledger_service::LedgerService;
pub use pipeline_service::DeploymentPipeline;
pub use registry_service::{LogsOutput, RegistryService};
pub use workspace_service::WorkspaceService;
