//! Configuration for the piper worker
//!
//! The orchestrator passes everything positionally; [`WorkerConfig`] decodes
//! that contract. Settings the orchestrator does not know about live in
//! [`RuntimeSettings`] and come from `PIPER_*` environment variables.

pub mod cache;
pub mod error;
pub mod settings;
pub mod validation;
pub mod worker;

// Re-export commonly used types
pub use cache::{default_cache_size, CacheSpec};
pub use error::{ConfigError, ConfigResult};
pub use settings::RuntimeSettings;
pub use validation::Validatable;
pub use worker::WorkerConfig;
