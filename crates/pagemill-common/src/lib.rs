//! Pagemill Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared error handling and logging for the Pagemill workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`CommonError`] and the crate-wide [`Result`] alias
//! - **Logging**: [`logging::LogConfig`] and [`logging::init_logging`], used by
//!   every executable so workers and the launcher log the same way
//!
//! # Example
//!
//! ```no_run
//! use pagemill_common::logging::{init_logging, LogConfig, LogOutput};
//!
//! fn main() -> pagemill_common::Result<()> {
//!     let config = LogConfig::builder().output(LogOutput::Stderr).build();
//!     let _guard = init_logging(&config)?;
//!     tracing::info!("worker ready");
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod logging;

pub use error::{CommonError, Result};
