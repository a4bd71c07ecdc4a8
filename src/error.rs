use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("error creating self-signed certificates: {0}")]
    Certificates(String),

    #[error("secure serving configuration failed: {0}")]
    Serving(String),

    #[error("authentication configuration failed: {0}")]
    Authentication(String),

    #[error("authorization configuration failed: {0}")]
    Authorization(String),

    #[error("feature configuration failed: {0}")]
    Features(String),

    #[error("unable to construct lister client config: {0}")]
    ClientConfig(String),

    #[error("unable to construct lister client: {0}")]
    Client(String),

    #[error("unable to construct a client to connect to the kubelets: {0}")]
    KubeletClient(String),

    #[error("unable to initialize source manager: {0}")]
    SourceManager(String),

    #[error("unable to create main manager: {0}")]
    Manager(String),

    #[error("unable to complete server configuration: {0}")]
    ServerConfig(String),

    #[error("server error: {0}")]
    Serve(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failure to collect metrics from a single source during one cycle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScrapeError {
    #[error("unable to fetch metrics from {source_name}: {reason}")]
    Fetch { source_name: String, reason: String },

    #[error("unable to decode metrics from {source_name}: {reason}")]
    Decode { source_name: String, reason: String },

    #[error("timed out fetching metrics from {source_name} after {timeout:?}")]
    Timeout {
        source_name: String,
        timeout: Duration,
    },

    #[error("node {node} has no usable address (preferred types: {preferred})")]
    NoAddress { node: String, preferred: String },

    #[error("node inventory not ready after {timeout:?}")]
    InventoryNotReady { timeout: Duration },
}

impl ScrapeError {
    pub fn source_name(&self) -> &str {
        match self {
            ScrapeError::Fetch { source_name, .. }
            | ScrapeError::Decode { source_name, .. }
            | ScrapeError::Timeout { source_name, .. } => source_name,
            ScrapeError::NoAddress { node, .. } => node,
            ScrapeError::InventoryNotReady { .. } => "node-inventory",
        }
    }
}
