pub mod config;
pub mod control;
pub mod errors;
pub mod gateway;
pub mod limiter;
pub mod metrics;
pub mod registry;
pub mod store;

// Re-export commonly used types
pub use config::Config;
pub use errors::{HeliosError, Result};
pub use limiter::{AdmitContext, Decision, Limiter, LimiterManager};
pub use registry::{PolicyRegistry, PolicySnapshot, TenantRecord};
