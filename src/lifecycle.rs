//! Runs the collection manager and the API server side by side under one
//! cancellation token.

use crate::apiserver::MetricsServer;
use crate::manager::Manager;
use crate::Result;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Start the manager loop, then prepare and run the server. Returns once the
/// token has fired and both have stopped, or with the first error. A server
/// that fails to prepare stops the already running manager before the error
/// is returned.
pub async fn run(
    manager: Arc<Manager>,
    server: MetricsServer,
    token: CancellationToken,
) -> Result<()> {
    let manager_token = token.child_token();
    let manager_task = manager.run_until(manager_token.clone());

    let prepared = match server.prepare_run() {
        Ok(prepared) => prepared,
        Err(e) => {
            error!("Unable to prepare API server: {}", e);
            manager_token.cancel();
            join_logged("Metrics manager", manager_task).await;
            return Err(e);
        }
    };

    let result = prepared.run(token).await;

    manager_token.cancel();
    join_logged("Metrics manager", manager_task).await;

    info!("Shutdown complete");
    result
}

/// Await a background task, logging a panic rather than dropping it.
/// Returns whether the task finished normally.
pub(crate) async fn join_logged(name: &str, task: JoinHandle<()>) -> bool {
    match task.await {
        Ok(()) => true,
        Err(e) => {
            error!("{} task failed: {}", name, e);
            false
        }
    }
}

/// Cancel `token` on SIGINT or SIGTERM.
pub async fn shutdown_on_signal(token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = interrupted(tokio::signal::ctrl_c()) => info!("Received SIGINT"),
                    _ = terminate.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("Unable to listen for SIGTERM: {}", e);
                interrupted(tokio::signal::ctrl_c()).await;
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        interrupted(tokio::signal::ctrl_c()).await;
        info!("Received Ctrl+C");
    }

    token.cancel();
}

/// Resolves once `signal` fires. A handler that failed to install never
/// resolves, so it cannot be mistaken for a shutdown request.
async fn interrupted(signal: impl Future<Output = std::io::Result<()>>) {
    if let Err(e) = signal.await {
        warn!("Unable to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apiserver::{GenericServerConfig, HealthzChecker, ProviderConfig, ServiceConfig};
    use crate::k8s::SharedInformerFactory;
    use crate::metrics::ServiceMetrics;
    use crate::options::SecureServingOptions;
    use crate::provider::SinkProvider;
    use crate::sources::testing::FakeProvider;
    use crate::k8s::NodeAddressType;
    use crate::sources::summary::types::Summary;
    use crate::sources::summary::{KubeletError, KubeletInterface, SummaryProvider};
    use crate::sources::SourceManager;
    use crate::Error;
    use k8s_openapi::api::core::v1::{Node, NodeAddress, NodeStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kube::runtime::{reflector, watcher};
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    fn manager() -> Arc<Manager> {
        let metrics = Arc::new(ServiceMetrics::new().unwrap());
        let provider = Arc::new(FakeProvider::with_nodes(&[(
            "node-1",
            Duration::from_millis(10),
            false,
        )]));
        let source = SourceManager::new(provider, Duration::from_secs(4), metrics.clone()).unwrap();
        Arc::new(
            Manager::new(
                source,
                SinkProvider::new(Duration::from_secs(1)),
                Duration::from_secs(1),
                metrics,
            )
            .unwrap(),
        )
    }

    struct OneNodeKubelet;

    #[async_trait::async_trait]
    impl KubeletInterface for OneNodeKubelet {
        async fn get_summary(&self, _: &str) -> std::result::Result<Summary, KubeletError> {
            serde_json::from_str(
                r#"{"node": {
                    "nodeName": "node-1",
                    "cpu": {"time": "2024-05-01T10:00:00Z", "usageNanoCores": 1000},
                    "memory": {"time": "2024-05-01T10:00:00Z", "workingSetBytes": 4096}
                }}"#,
            )
            .map_err(|e| KubeletError::Decode(e.to_string()))
        }
    }

    fn serving(dir: &std::path::Path) -> GenericServerConfig {
        let mut serving_options = SecureServingOptions {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            secure_port: 8443,
            cert_dir: dir.to_path_buf(),
            ..Default::default()
        };
        serving_options
            .maybe_default_with_self_signed_certs("localhost", &[], &[])
            .unwrap();
        let mut generic = GenericServerConfig::default();
        serving_options.apply_to(&mut generic.secure_serving).unwrap();
        if let Some(serving) = generic.secure_serving.as_mut() {
            serving.bind_address.set_port(0);
        }
        generic
    }

    fn server(generic: GenericServerConfig, manager: &Arc<Manager>) -> MetricsServer {
        let client = kube::Client::try_from(kube::Config::new("http://127.0.0.1:1".parse().unwrap()))
            .unwrap();
        let mut config = ServiceConfig {
            generic,
            providers: ProviderConfig::default(),
        };
        config.providers.inject(SinkProvider::new(Duration::from_secs(1)));

        let mut server = config
            .complete(Arc::new(SharedInformerFactory::new(client)))
            .new()
            .unwrap();
        server
            .add_healthz_checks(vec![manager.clone() as Arc<dyn HealthzChecker>])
            .unwrap();
        server
    }

    #[tokio::test]
    async fn test_prepare_failure_stops_manager() {
        let manager = manager();
        let server = server(GenericServerConfig::default(), &manager);
        let token = CancellationToken::new();

        let err = tokio::time::timeout(Duration::from_secs(5), run(manager.clone(), server, token.clone()))
            .await
            .expect("returns promptly")
            .unwrap_err();
        assert!(matches!(err, Error::Serve(_)));
        assert!(!token.is_cancelled(), "caller's token is left alone");

        let ticks = manager.ticks();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(manager.ticks(), ticks, "manager stopped");
    }

    #[tokio::test]
    async fn test_cancellation_stops_server_and_manager() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager();
        let server = server(serving(dir.path()), &manager);
        let token = CancellationToken::new();
        let task = tokio::spawn(run(manager.clone(), server, token.clone()));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(manager.ticks() >= 1, "first cycle runs immediately");

        token.cancel();
        tokio::time::timeout(Duration::from_secs(12), task)
            .await
            .expect("shutdown within the grace period")
            .unwrap()
            .unwrap();

        let ticks = manager.ticks();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(manager.ticks(), ticks, "no cycle after cancellation");
    }

    #[tokio::test]
    async fn test_first_cycle_waits_for_node_inventory() {
        let (store, mut writer) = reflector::store::<Node>();
        let metrics = Arc::new(ServiceMetrics::new().unwrap());
        let provider = SummaryProvider::new(
            Arc::new(store),
            Arc::new(OneNodeKubelet),
            vec![NodeAddressType::InternalIp],
        );
        let source = SourceManager::new(Arc::new(provider), Duration::from_secs(4), metrics.clone())
            .unwrap();
        let manager = Arc::new(
            Manager::new(
                source,
                SinkProvider::new(Duration::from_secs(10)),
                Duration::from_secs(10),
                metrics,
            )
            .unwrap(),
        );

        let dir = tempfile::tempdir().unwrap();
        let server = server(serving(dir.path()), &manager);
        let token = CancellationToken::new();
        let task = tokio::spawn(run(manager.clone(), server, token.clone()));

        tokio::time::sleep(Duration::from_millis(300)).await;
        writer.apply_watcher_event(&watcher::Event::Init);
        writer.apply_watcher_event(&watcher::Event::InitApply(Node {
            metadata: ObjectMeta {
                name: Some("node-1".to_string()),
                ..Default::default()
            },
            status: Some(NodeStatus {
                addresses: Some(vec![NodeAddress {
                    type_: "InternalIP".to_string(),
                    address: "10.0.0.1".to_string(),
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }));
        writer.apply_watcher_event(&watcher::Event::InitDone);

        let mut healthy = false;
        for _ in 0..30 {
            if manager.check_health().is_ok() {
                healthy = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(healthy, "first cycle sees the node once the store is ready");
        assert_eq!(manager.ticks(), 1);

        token.cancel();
        tokio::time::timeout(Duration::from_secs(12), task)
            .await
            .expect("shutdown within the grace period")
            .unwrap()
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_signal_handler_does_not_resolve() {
        let failed = interrupted(async { Err(std::io::Error::other("no signal driver")) });
        assert!(tokio::time::timeout(Duration::from_secs(3600), failed)
            .await
            .is_err());

        let fired = interrupted(async { Ok(()) });
        assert!(tokio::time::timeout(Duration::from_secs(1), fired)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_join_logged_reports_panics() {
        assert!(join_logged("quiet", tokio::spawn(async {})).await);
        let panicked = tokio::spawn(async { panic!("informer watch exploded") });
        assert!(!join_logged("informer", panicked).await);
    }
}
