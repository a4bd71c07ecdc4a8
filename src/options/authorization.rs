use super::{delegate_client, parse_duration};
use crate::apiserver::filters::{AccessReviewer, Authorizer, KubeAccessReviewer};
use crate::{Error, Result};
use clap::Args;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

#[derive(Args, Clone, Debug)]
pub struct DelegatingAuthorizationOptions {
    #[arg(
        long,
        help = "Kubeconfig pointing at the cluster allowed to create subjectaccessreviews (defaults to in-cluster config)"
    )]
    pub authorization_kubeconfig: Option<PathBuf>,

    #[arg(
        long,
        value_delimiter = ',',
        default_value = "/healthz",
        help = "Paths that skip authorization; a trailing '*' matches any suffix"
    )]
    pub authorization_always_allow_paths: Vec<String>,

    #[arg(
        long,
        value_parser = parse_duration,
        default_value = "10s",
        help = "Duration to cache 'authorized' responses from the authorizer"
    )]
    pub authorization_webhook_cache_authorized_ttl: Duration,

    #[arg(
        long,
        value_parser = parse_duration,
        default_value = "10s",
        help = "Duration to cache 'unauthorized' responses from the authorizer"
    )]
    pub authorization_webhook_cache_unauthorized_ttl: Duration,
}

impl Default for DelegatingAuthorizationOptions {
    fn default() -> Self {
        Self {
            authorization_kubeconfig: None,
            authorization_always_allow_paths: vec!["/healthz".to_string()],
            authorization_webhook_cache_authorized_ttl: Duration::from_secs(10),
            authorization_webhook_cache_unauthorized_ttl: Duration::from_secs(10),
        }
    }
}

impl DelegatingAuthorizationOptions {
    pub fn validate(&self) -> Result<()> {
        for path in &self.authorization_always_allow_paths {
            if let Some(pos) = path.find('*') {
                if pos != path.len() - 1 {
                    return Err(Error::Authorization(format!(
                        "only a trailing '*' is allowed in always-allow path {:?}",
                        path
                    )));
                }
            }
        }
        Ok(())
    }

    pub async fn apply_to(&self, authorization: &mut Option<Arc<Authorizer>>) -> Result<()> {
        self.validate()?;

        let client = delegate_client(self.authorization_kubeconfig.as_deref())
            .await
            .map_err(|e| Error::Authorization(e.to_string()))?;
        let reviewer = match client {
            Some(client) => Some(Arc::new(KubeAccessReviewer::new(client)) as Arc<dyn AccessReviewer>),
            None => {
                warn!("No cluster config for access reviews, only always-allowed paths are served");
                None
            }
        };

        *authorization = Some(Arc::new(Authorizer::new(
            self.authorization_always_allow_paths.clone(),
            reviewer,
            self.authorization_webhook_cache_authorized_ttl,
            self.authorization_webhook_cache_unauthorized_ttl,
        )));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_only_at_end() {
        let mut opts = DelegatingAuthorizationOptions::default();
        assert!(opts.validate().is_ok());

        opts.authorization_always_allow_paths = vec!["/healthz".to_string(), "/debug/*".to_string()];
        assert!(opts.validate().is_ok());

        opts.authorization_always_allow_paths = vec!["/de*bug".to_string()];
        assert!(matches!(opts.validate(), Err(Error::Authorization(_))));
    }

    #[tokio::test]
    async fn test_invalid_paths_fail_apply() {
        let opts = DelegatingAuthorizationOptions {
            authorization_always_allow_paths: vec!["*/healthz".to_string()],
            ..Default::default()
        };
        let mut authz = None;
        assert!(opts.apply_to(&mut authz).await.is_err());
        assert!(authz.is_none());
    }
}
