//! # virtnode Common
//!
//! Shared utilities for the virtnode components.
//!
//! ## Logging
//!
//! ```rust,ignore
//! use virtnode_common::{init_logging, LogFormat};
//!
//! init_logging("info", LogFormat::Pretty).unwrap();
//! tracing::info!("ready");
//! ```

pub mod logging;

pub use logging::{init_logging, LogFormat};
