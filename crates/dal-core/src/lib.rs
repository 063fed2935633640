//! Shared building blocks for the payment device abstraction layer.
//!
//! Every other crate in the workspace depends on this one for the common
//! error type, protocol and timeout constants, the request/response data
//! model carried through a sub-workflow and the configuration tree.

pub mod config;
pub mod constants;
pub mod error;
pub mod types;

pub use config::DalConfig;
pub use error::{Error, Result};
pub use types::*;

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
