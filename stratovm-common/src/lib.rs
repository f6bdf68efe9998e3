//! # stratovm Common
//!
//! Shared utilities for the stratovm components.
//!
//! ## Logging
//!
//! ```rust
//! use stratovm_common::init_logging;
//!
//! init_logging("info").unwrap();
//! ```

pub mod logging;

// Re-export logging functions
pub use logging::{init_logging, init_logging_json};
