use super::{delegate_client, parse_duration};
use crate::apiserver::filters::{Authenticator, KubeTokenReviewer, TokenReviewer};
use crate::apiserver::tls::load_certs;
use crate::apiserver::SecureServingInfo;
use crate::{Error, Result};
use clap::Args;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Args, Clone, Debug)]
pub struct DelegatingAuthenticationOptions {
    #[arg(
        long,
        help = "Kubeconfig pointing at the cluster allowed to create tokenreviews (defaults to in-cluster config)"
    )]
    pub authentication_kubeconfig: Option<PathBuf>,

    #[arg(
        long,
        help = "PEM bundle of CAs trusted to sign client certificates; the certificate CN is the username"
    )]
    pub client_ca_file: Option<PathBuf>,

    #[arg(
        long,
        value_parser = parse_duration,
        default_value = "10s",
        help = "Duration to cache responses from the token authenticator"
    )]
    pub authentication_token_webhook_cache_ttl: Duration,
}

impl Default for DelegatingAuthenticationOptions {
    fn default() -> Self {
        Self {
            authentication_kubeconfig: None,
            client_ca_file: None,
            authentication_token_webhook_cache_ttl: Duration::from_secs(10),
        }
    }
}

impl DelegatingAuthenticationOptions {
    /// Install the client CA into the serving info and build the request
    /// authenticator. Secure serving must already be applied.
    pub async fn apply_to(
        &self,
        authentication: &mut Option<Arc<Authenticator>>,
        serving: Option<&mut SecureServingInfo>,
    ) -> Result<()> {
        let serving = serving.ok_or_else(|| {
            Error::Authentication(
                "secure serving must be configured before authentication".to_string(),
            )
        })?;

        if let Some(path) = &self.client_ca_file {
            let roots = load_certs(path).map_err(|e| Error::Authentication(e.to_string()))?;
            info!("Verifying client certificates against {}", path.display());
            serving.client_ca = Some(roots);
        }

        let client = delegate_client(self.authentication_kubeconfig.as_deref())
            .await
            .map_err(|e| Error::Authentication(e.to_string()))?;
        let reviewer = match client {
            Some(client) => Some(Arc::new(KubeTokenReviewer::new(client)) as Arc<dyn TokenReviewer>),
            None => {
                warn!("No cluster config for token reviews, bearer tokens will be ignored");
                None
            }
        };

        *authentication = Some(Arc::new(Authenticator::new(
            reviewer,
            self.authentication_token_webhook_cache_ttl,
        )));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_requires_secure_serving() {
        let mut authn = None;
        let err = DelegatingAuthenticationOptions::default()
            .apply_to(&mut authn, None)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Authentication(_)));
        assert!(authn.is_none());
    }

    #[tokio::test]
    async fn test_unreadable_client_ca_fails() {
        let mut serving = SecureServingInfo {
            bind_address: "127.0.0.1:8443".parse().unwrap(),
            cert_file: PathBuf::from("tls.crt"),
            key_file: PathBuf::from("tls.key"),
            client_ca: None,
        };
        let opts = DelegatingAuthenticationOptions {
            client_ca_file: Some(PathBuf::from("/nonexistent/ca.crt")),
            ..Default::default()
        };

        let mut authn = None;
        let err = opts.apply_to(&mut authn, Some(&mut serving)).await.unwrap_err();
        assert!(matches!(err, Error::Authentication(_)));
    }
}
