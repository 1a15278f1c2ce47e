//! # vmlab Common
//!
//! Shared utilities for the vmlab crates.
//!
//! ## Logging
//!
//! ```rust,ignore
//! vmlab_common::init_logging("info").unwrap();
//! tracing::info!(vm = "web1", "VM started");
//! ```

pub mod logging;

pub use logging::{init_logging, init_logging_json};
