//! Command-line options and the assembly of the server configuration and the
//! collection pipeline from them.

pub mod authentication;
pub mod authorization;
pub mod features;
pub mod serving;

pub use authentication::DelegatingAuthenticationOptions;
pub use authorization::DelegatingAuthorizationOptions;
pub use features::FeatureOptions;
pub use serving::SecureServingOptions;

use crate::apiserver::handlers::default_swagger;
use crate::apiserver::{HealthzChecker, ServiceConfig};
use crate::k8s::{load_client_config, K8sClient, NodeAddressType, SharedInformerFactory};
use crate::lifecycle;
use crate::manager::Manager;
use crate::metrics::ServiceMetrics;
use crate::provider::SinkProvider;
use crate::sources::summary::{KubeletClient, KubeletConfig, SummaryProvider};
use crate::sources::{SourceManager, DEFAULT_SCRAPE_TIMEOUT};
use crate::{Error, Result};
use clap::Args;
use kube::Client;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Args, Clone, Debug)]
pub struct ServiceOptions {
    #[command(flatten)]
    pub secure_serving: SecureServingOptions,

    #[command(flatten)]
    pub authentication: DelegatingAuthenticationOptions,

    #[command(flatten)]
    pub authorization: DelegatingAuthorizationOptions,

    #[command(flatten)]
    pub features: FeatureOptions,

    #[arg(
        long,
        help = "Kubeconfig used to reach the API server and the kubelets (defaults to in-cluster config)"
    )]
    pub kubeconfig: Option<PathBuf>,

    /// Skips authentication and authorization wiring. Only settable from code.
    #[arg(skip)]
    pub disable_auth_for_testing: bool,

    #[arg(
        long,
        value_parser = parse_duration,
        default_value = "60s",
        help = "Interval between metric collections (e.g. 30s, 1m)"
    )]
    pub metric_resolution: Duration,

    #[arg(long, default_value_t = 10250, help = "Port used to connect to the kubelets")]
    pub kubelet_port: u16,

    #[arg(long, help = "Connect to the kubelets over plain HTTP")]
    pub kubelet_insecure: bool,

    #[arg(
        long,
        value_delimiter = ',',
        default_value = "Hostname,InternalDNS,InternalIP,ExternalDNS,ExternalIP",
        help = "Order of node address types tried when connecting to a kubelet"
    )]
    pub kubelet_preferred_address_types: Vec<NodeAddressType>,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            secure_serving: SecureServingOptions::default(),
            authentication: DelegatingAuthenticationOptions::default(),
            authorization: DelegatingAuthorizationOptions::default(),
            features: FeatureOptions::default(),
            kubeconfig: None,
            disable_auth_for_testing: false,
            metric_resolution: Duration::from_secs(60),
            kubelet_port: 10250,
            kubelet_insecure: false,
            kubelet_preferred_address_types: NodeAddressType::default_preference(),
        }
    }
}

impl ServiceOptions {
    /// Assemble the server configuration. Certificates come first, then
    /// serving, then authentication and authorization, then features.
    pub async fn config(&self) -> Result<ServiceConfig> {
        let mut serving = self.secure_serving.clone();
        serving.maybe_default_with_self_signed_certs(
            "localhost",
            &[],
            &[IpAddr::V4(Ipv4Addr::LOCALHOST)],
        )?;

        let mut config = ServiceConfig::default();
        serving.apply_to(&mut config.generic.secure_serving)?;

        if !self.disable_auth_for_testing {
            self.authentication
                .apply_to(
                    &mut config.generic.authentication,
                    config.generic.secure_serving.as_mut(),
                )
                .await?;
            self.authorization
                .apply_to(&mut config.generic.authorization)
                .await?;
        }

        self.features.apply_to(&mut config.generic)?;
        config.generic.swagger = Some(default_swagger());

        Ok(config)
    }

    /// Wire the collection pipeline to the API server and run both until
    /// `token` is cancelled.
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        let mut config = self.config().await?;

        let metrics = Arc::new(
            ServiceMetrics::new().map_err(|e| Error::ServerConfig(format!("metrics registry: {}", e)))?,
        );
        config.generic.metrics = Some(metrics.clone());

        let client = K8sClient::from_kubeconfig(self.kubeconfig.as_deref()).await?;
        let informers = Arc::new(SharedInformerFactory::new(client.client()));

        let kubelet_config =
            KubeletConfig::from_client_config(client.config(), self.kubelet_port, self.kubelet_insecure)?;
        let kubelet = KubeletClient::new(kubelet_config)?;

        let source_provider = SummaryProvider::new(
            Arc::new(informers.nodes()),
            Arc::new(kubelet),
            self.kubelet_preferred_address_types.clone(),
        );
        let source_manager =
            SourceManager::new(Arc::new(source_provider), DEFAULT_SCRAPE_TIMEOUT, metrics.clone())?;

        let sink = SinkProvider::new(self.metric_resolution);
        let manager = Arc::new(Manager::new(
            source_manager,
            sink.clone(),
            self.metric_resolution,
            metrics,
        )?);

        config.providers.inject(sink);
        let mut server = config.complete(informers).new()?;
        server.add_healthz_checks(vec![manager.clone() as Arc<dyn HealthzChecker>])?;

        info!(
            "Collecting metrics every {:?} from kubelets on port {}",
            self.metric_resolution, self.kubelet_port
        );

        lifecycle::run(manager, server, token).await
    }
}

/// Client for delegated authentication or authorization. An explicit
/// kubeconfig must load; without one the in-cluster config is tried and its
/// absence is not an error.
pub(crate) async fn delegate_client(kubeconfig: Option<&Path>) -> Result<Option<Client>> {
    let config = match kubeconfig {
        Some(path) => load_client_config(Some(path)).await?,
        None => match load_client_config(None).await {
            Ok(config) => config,
            Err(e) => {
                debug!("No delegate client: {}", e);
                return Ok(None);
            }
        },
    };

    Ok(Some(K8sClient::new(config)?.client()))
}

/// Parse durations such as `500ms`, `30s`, `5m` or `1h`.
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    let (num, unit_ms) = if let Some(num) = s.strip_suffix("ms") {
        (num, 1u64)
    } else if let Some(num) = s.strip_suffix('s') {
        (num, 1000u64)
    } else if let Some(num) = s.strip_suffix('m') {
        (num, 60_000u64)
    } else if let Some(num) = s.strip_suffix('h') {
        (num, 3_600_000u64)
    } else {
        return Err("Invalid duration format. Use: 30s, 5m, 1h, 500ms".to_string());
    };

    let value: u64 = num
        .parse()
        .map_err(|_| format!("Invalid duration number {:?}", num))?;
    let millis = value
        .checked_mul(unit_ms)
        .ok_or_else(|| format!("Duration {:?} is too large", s))?;
    Ok(Duration::from_millis(millis))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        options: ServiceOptions,
    }

    fn write_kubeconfig(dir: &Path) -> PathBuf {
        let path = dir.join("kubeconfig");
        std::fs::write(
            &path,
            r#"apiVersion: v1
kind: Config
clusters:
- name: test
  cluster:
    server: https://10.0.0.1:6443
    insecure-skip-tls-verify: true
users:
- name: test
  user:
    token: abc
contexts:
- name: test
  context:
    cluster: test
    user: test
current-context: test
"#,
        )
        .unwrap();
        path
    }

    fn write_ca(dir: &Path) -> PathBuf {
        let ca = rcgen::generate_simple_self_signed(vec!["test-ca".to_string()]).unwrap();
        let path = dir.join("ca.crt");
        std::fs::write(&path, ca.serialize_pem().unwrap()).unwrap();
        path
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("60s"), Ok(Duration::from_secs(60)));
        assert_eq!(parse_duration("1m"), Ok(Duration::from_secs(60)));
        assert_eq!(parse_duration("500ms"), Ok(Duration::from_millis(500)));
        assert_eq!(parse_duration("2h"), Ok(Duration::from_secs(7200)));
        assert!(parse_duration("60").is_err());
        assert!(parse_duration("abcs").is_err());
    }

    #[test]
    fn test_flag_defaults_match_default_impl() {
        let parsed = TestCli::parse_from(["kubemetrics"]).options;
        let defaults = ServiceOptions::default();

        assert_eq!(parsed.metric_resolution, defaults.metric_resolution);
        assert_eq!(parsed.kubelet_port, 10250);
        assert_eq!(parsed.secure_serving.secure_port, 443);
        assert_eq!(parsed.secure_serving.cert_dir, defaults.secure_serving.cert_dir);
        assert_eq!(
            parsed.kubelet_preferred_address_types,
            NodeAddressType::default_preference()
        );
        assert_eq!(
            parsed.authorization.authorization_always_allow_paths,
            vec!["/healthz"]
        );
        assert!(parsed.features.profiling);
        assert!(!parsed.disable_auth_for_testing);
    }

    #[test]
    fn test_flags() {
        let parsed = TestCli::parse_from([
            "kubemetrics",
            "--metric-resolution",
            "30s",
            "--kubelet-insecure",
            "--kubelet-port",
            "10255",
            "--kubelet-preferred-address-types",
            "InternalIP,Hostname",
            "--profiling",
            "false",
            "--authorization-always-allow-paths",
            "/healthz,/metrics",
        ])
        .options;

        assert_eq!(parsed.metric_resolution, Duration::from_secs(30));
        assert!(parsed.kubelet_insecure);
        assert_eq!(parsed.kubelet_port, 10255);
        assert_eq!(
            parsed.kubelet_preferred_address_types,
            vec![NodeAddressType::InternalIp, NodeAddressType::Hostname]
        );
        assert!(!parsed.features.profiling);
        assert_eq!(parsed.authorization.authorization_always_allow_paths.len(), 2);
    }

    #[tokio::test]
    async fn test_config_without_auth() {
        let dir = tempfile::tempdir().unwrap();
        let mut options = ServiceOptions {
            disable_auth_for_testing: true,
            ..Default::default()
        };
        options.secure_serving.cert_dir = dir.path().join("certs");
        options.secure_serving.secure_port = 8443;

        let config = options.config().await.unwrap();

        assert!(dir.path().join("certs/apiserver.crt").exists());
        assert!(config.generic.secure_serving.is_some());
        assert!(config.generic.authentication.is_none());
        assert!(config.generic.authorization.is_none());
        assert!(config.generic.enable_profiling);
        assert!(config.generic.swagger.is_some());
    }

    #[tokio::test]
    async fn test_client_ca_lands_in_generated_serving_info() {
        let dir = tempfile::tempdir().unwrap();
        let kubeconfig = write_kubeconfig(dir.path());

        let mut options = ServiceOptions::default();
        options.secure_serving.cert_dir = dir.path().join("certs");
        options.secure_serving.secure_port = 8443;
        options.authentication.client_ca_file = Some(write_ca(dir.path()));
        options.authentication.authentication_kubeconfig = Some(kubeconfig.clone());
        options.authorization.authorization_kubeconfig = Some(kubeconfig);

        let config = options.config().await.unwrap();

        let serving = config.generic.secure_serving.unwrap();
        assert_eq!(serving.cert_file, dir.path().join("certs/apiserver.crt"));
        assert_eq!(serving.client_ca.map(|c| c.len()), Some(1));
        assert!(config.generic.authentication.is_some());
        assert!(config.generic.authorization.is_some());
    }

    #[tokio::test]
    async fn test_authentication_without_serving_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut options = ServiceOptions::default();
        options.secure_serving.cert_dir = dir.path().join("certs");
        options.secure_serving.secure_port = 0;

        let err = options.config().await.err().unwrap();
        assert!(matches!(err, Error::Authentication(_)), "{}", err);
    }

    #[tokio::test]
    async fn test_certificate_failure_aborts_before_anything_else() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();

        let mut options = ServiceOptions::default();
        options.secure_serving.cert_dir = blocker.join("certs");
        options.secure_serving.secure_port = 8443;
        options.authorization.authorization_always_allow_paths = vec!["*bad".to_string()];

        let err = options.config().await.err().unwrap();
        assert!(matches!(err, Error::Certificates(_)), "{}", err);
    }

    #[tokio::test]
    async fn test_bad_delegate_kubeconfig_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut options = ServiceOptions::default();
        options.secure_serving.cert_dir = dir.path().join("certs");
        options.secure_serving.secure_port = 8443;
        options.authentication.authentication_kubeconfig = Some(dir.path().join("missing"));

        let err = options.config().await.err().unwrap();
        assert!(matches!(err, Error::Authentication(_)), "{}", err);
    }
}
