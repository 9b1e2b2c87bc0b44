//! Security-scan orchestration: quota-gated submission, concurrent tool
//! fan-out, finding normalization and risk scoring.

pub mod adapters;
pub mod archive;
pub mod config;
pub mod engine;
pub mod error;
pub mod models;
pub mod quota;
pub mod rate_limit;
pub mod redis_queue;
pub mod registry;
pub mod risk;

pub use engine::{validate_target, ScanEngine, ScanEngineBuilder};
pub use error::{ConfigError, RegistryError, SubmitError};
pub use quota::QuotaLedger;
pub use registry::ScanRegistry;
