//! Airgap Backup Library
//!
//! Streaming backup, verification and restore of physical disks and VM disk
//! images for offline machines.

pub mod backup_set;
pub mod config;
pub mod confirm;
pub mod executor;
pub mod shutdown;
pub mod tools;
pub mod transfer;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use utils::errors::{ErrorKind, PipelineError};
pub type Result<T> = std::result::Result<T, PipelineError>;
