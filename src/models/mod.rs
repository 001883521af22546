// Request/Response models
pub mod apps;
pub mod balance;
pub mod common;
pub mod orders;
