use super::filters::{Authenticator, Authorizer};
use super::MetricsServer;
use crate::k8s::SharedInformerFactory;
use crate::metrics::ServiceMetrics;
use crate::provider::{NodeMetricsProvider, PodMetricsProvider};
use crate::{Error, Result};
use rustls::pki_types::CertificateDer;
use serde_json::Value;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// How long in-flight requests may keep running after shutdown begins.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Listener address and TLS material, ready to serve.
#[derive(Debug, Clone)]
pub struct SecureServingInfo {
    pub bind_address: SocketAddr,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    /// Trust roots for client certificates. Installed by authentication.
    pub client_ca: Option<Vec<CertificateDer<'static>>>,
}

/// Server settings shared by every API group.
pub struct GenericServerConfig {
    pub secure_serving: Option<SecureServingInfo>,
    pub authentication: Option<Arc<Authenticator>>,
    pub authorization: Option<Arc<Authorizer>>,
    pub enable_profiling: bool,
    pub enable_contention_profiling: bool,
    pub metrics: Option<Arc<ServiceMetrics>>,
    pub swagger: Option<Value>,
    pub shutdown_grace: Duration,
}

impl Default for GenericServerConfig {
    fn default() -> Self {
        Self {
            secure_serving: None,
            authentication: None,
            authorization: None,
            enable_profiling: false,
            enable_contention_profiling: false,
            metrics: None,
            swagger: None,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

/// Backing stores for the served resource kinds.
#[derive(Default, Clone)]
pub struct ProviderConfig {
    pub node: Option<Arc<dyn NodeMetricsProvider>>,
    pub pod: Option<Arc<dyn PodMetricsProvider>>,
}

impl ProviderConfig {
    /// Use one provider for both resource kinds.
    pub fn inject<P>(&mut self, provider: Arc<P>)
    where
        P: NodeMetricsProvider + PodMetricsProvider + 'static,
    {
        self.node = Some(provider.clone());
        self.pod = Some(provider);
    }
}

#[derive(Default)]
pub struct ServiceConfig {
    pub generic: GenericServerConfig,
    pub providers: ProviderConfig,
}

impl ServiceConfig {
    pub fn complete(self, informers: Arc<SharedInformerFactory>) -> CompletedConfig {
        CompletedConfig {
            generic: self.generic,
            providers: self.providers,
            informers,
        }
    }
}

pub struct CompletedConfig {
    pub(crate) generic: GenericServerConfig,
    pub(crate) providers: ProviderConfig,
    pub(crate) informers: Arc<SharedInformerFactory>,
}

impl CompletedConfig {
    /// Build the server. Fails if either resource provider is missing.
    #[allow(clippy::new_ret_no_self)]
    pub fn new(self) -> Result<MetricsServer> {
        let node = self
            .providers
            .node
            .ok_or_else(|| Error::ServerConfig("node metrics provider is not set".to_string()))?;
        let pod = self
            .providers
            .pod
            .ok_or_else(|| Error::ServerConfig("pod metrics provider is not set".to_string()))?;

        Ok(MetricsServer::new(self.generic, node, pod, self.informers))
    }
}
