#![doc = "Common types shared across the tfuzz workspace."]

pub mod config;
pub mod error;
pub mod lock;
pub mod metrics;
pub mod status;

pub use config::*;
pub use error::*;
pub use lock::*;
pub use metrics::*;
pub use status::*;
