use crate::{Error, Result};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use std::path::Path;
use tracing::{debug, info};

/// Resolve cluster credentials.
///
/// An explicit kubeconfig path always wins; without one the in-cluster service
/// account is used, which fails when the process is not running inside a pod.
pub async fn load_client_config(kubeconfig: Option<&Path>) -> Result<Config> {
    match kubeconfig {
        Some(path) => {
            debug!("Loading client config from {}", path.display());

            let kubeconfig = Kubeconfig::read_from(path)
                .map_err(|e| Error::ClientConfig(format!("{}: {}", path.display(), e)))?;

            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| Error::ClientConfig(format!("{}: {}", path.display(), e)))
        }
        None => {
            debug!("No kubeconfig given, using in-cluster config");

            Config::incluster().map_err(|e| Error::ClientConfig(format!("in-cluster: {}", e)))
        }
    }
}

/// Client to the cluster control plane together with the config it was built
/// from. The config is kept around because the kubelet client derives its
/// credentials from it.
#[derive(Clone)]
pub struct K8sClient {
    client: Client,
    config: Config,
}

impl K8sClient {
    pub fn new(config: Config) -> Result<Self> {
        let client = Client::try_from(config.clone()).map_err(|e| Error::Client(e.to_string()))?;

        info!("Constructed client for cluster at {}", config.cluster_url);

        Ok(Self { client, config })
    }

    pub async fn from_kubeconfig(kubeconfig: Option<&Path>) -> Result<Self> {
        let config = load_client_config(kubeconfig).await?;
        Self::new(config)
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}
