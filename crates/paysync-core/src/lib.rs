//! # PaySync Core
//!
//! Shared vocabulary for the connector sync scheduler: domain types, the
//! error taxonomy, configuration, and the traits every collaborator implements.

pub mod cancel;
pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use cancel::CancelFlag;
pub use config::PaySyncConfig;
pub use error::{ErrorKind, Result, SyncError};
