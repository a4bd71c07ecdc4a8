use super::types::Summary;
use crate::{Error, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use secrecy::ExposeSecret;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KubeletError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("unexpected status {0}")]
    Status(u16),

    #[error("{0}")]
    Decode(String),
}

/// Fetches the usage summary of one node.
#[async_trait]
pub trait KubeletInterface: Send + Sync {
    async fn get_summary(&self, host: &str) -> std::result::Result<Summary, KubeletError>;
}

/// Connection parameters for talking to every kubelet in the cluster.
#[derive(Debug, Clone, Default)]
pub struct KubeletConfig {
    pub port: u16,
    pub insecure: bool,
    pub bearer_token: Option<String>,
    pub root_certs: Vec<Vec<u8>>,
    /// PEM client certificate followed by its private key.
    pub identity_pem: Option<Vec<u8>>,
    pub accept_invalid_certs: bool,
}

impl KubeletConfig {
    /// Derive kubelet connection parameters from the cluster client config:
    /// same bearer token, client certificate and trust roots.
    pub fn from_client_config(config: &kube::Config, port: u16, insecure: bool) -> Result<Self> {
        let bearer_token = match (&config.auth_info.token, &config.auth_info.token_file) {
            (Some(token), _) => Some(token.expose_secret().to_string()),
            (None, Some(path)) => {
                let token = std::fs::read_to_string(path).map_err(|e| {
                    Error::KubeletClient(format!("reading token file {}: {}", path, e))
                })?;
                Some(token.trim().to_string())
            }
            (None, None) => None,
        };

        let auth = &config.auth_info;
        let certificate = load_pem(
            "client certificate",
            auth.client_certificate_data.as_deref(),
            auth.client_certificate.as_deref(),
        )?;
        let key = load_pem(
            "client key",
            auth.client_key_data.as_ref().map(|k| k.expose_secret()),
            auth.client_key.as_deref(),
        )?;
        let identity_pem = match (certificate, key) {
            (Some(mut certificate), Some(key)) => {
                certificate.push(b'\n');
                certificate.extend_from_slice(&key);
                Some(certificate)
            }
            (None, None) => None,
            _ => {
                return Err(Error::KubeletClient(
                    "client certificate and key must be configured together".to_string(),
                ))
            }
        };

        Ok(Self {
            port,
            insecure,
            bearer_token,
            root_certs: config.root_cert.clone().unwrap_or_default(),
            identity_pem,
            accept_invalid_certs: config.accept_invalid_certs,
        })
    }
}

/// Inline base64 data wins over a file path, as in kubeconfig files.
fn load_pem(what: &str, data: Option<&str>, file: Option<&str>) -> Result<Option<Vec<u8>>> {
    if let Some(data) = data {
        let pem = STANDARD
            .decode(data.trim())
            .map_err(|e| Error::KubeletClient(format!("decoding {} data: {}", what, e)))?;
        return Ok(Some(pem));
    }
    match file {
        Some(path) => std::fs::read(path)
            .map(Some)
            .map_err(|e| Error::KubeletClient(format!("reading {} {}: {}", what, path, e))),
        None => Ok(None),
    }
}

pub struct KubeletClient {
    client: reqwest::Client,
    scheme: &'static str,
    port: u16,
    bearer_token: Option<String>,
}

impl KubeletClient {
    pub fn new(config: KubeletConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .danger_accept_invalid_certs(config.accept_invalid_certs);

        for der in &config.root_certs {
            let cert = reqwest::Certificate::from_der(der)
                .map_err(|e| Error::KubeletClient(format!("invalid CA certificate: {}", e)))?;
            builder = builder.add_root_certificate(cert);
        }

        if let Some(pem) = &config.identity_pem {
            let identity = reqwest::Identity::from_pem(pem)
                .map_err(|e| Error::KubeletClient(format!("invalid client identity: {}", e)))?;
            builder = builder.identity(identity);
        }

        let client = builder
            .build()
            .map_err(|e| Error::KubeletClient(e.to_string()))?;

        Ok(Self {
            client,
            scheme: if config.insecure { "http" } else { "https" },
            port: config.port,
            bearer_token: config.bearer_token,
        })
    }

    pub fn summary_url(&self, host: &str) -> String {
        // Bare IPv6 literals need brackets in the authority.
        if host.contains(':') && !host.starts_with('[') {
            format!("{}://[{}]:{}/stats/summary", self.scheme, host, self.port)
        } else {
            format!("{}://{}:{}/stats/summary", self.scheme, host, self.port)
        }
    }
}

#[async_trait]
impl KubeletInterface for KubeletClient {
    async fn get_summary(&self, host: &str) -> std::result::Result<Summary, KubeletError> {
        let url = self.summary_url(host);
        debug!("Fetching {}", url);

        let mut request = self.client.get(&url);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| KubeletError::Request(e.to_string()))?;

        if !response.status().is_success() {
            return Err(KubeletError::Status(response.status().as_u16()));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| KubeletError::Request(e.to_string()))?;

        serde_json::from_slice(&body).map_err(|e| KubeletError::Decode(e.to_string()))
    }
}
