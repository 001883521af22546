// Middleware modules
pub mod identity;
pub mod logging;

// Export identity middleware components
pub use identity::{identity_middleware, OwnerIdentity};

// Export logging middleware
pub use logging::logging_middleware;
