//! modbridge basic library
//!
//! Provides functions shared by the bridge binary and its tests:
//! - logging bootstrap
//! - layered configuration loading
//! - tolerant serde deserializers
//! - shutdown signal handling

pub mod config_loader;
pub mod logging;
pub mod serde_helpers;
pub mod shutdown;
