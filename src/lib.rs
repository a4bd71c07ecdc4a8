pub mod apiserver;
pub mod cli;
pub mod error;
pub mod k8s;
pub mod lifecycle;
pub mod manager;
pub mod metrics;
pub mod options;
pub mod provider;
pub mod sources;

pub use error::{Error, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
