use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::runtime::reflector::{self, store::Writer, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Shared watch-backed caches over cluster objects.
///
/// Stores are filled exclusively from watch events. There is no periodic
/// relist: a missed event is recovered by the watcher's own re-list on
/// reconnect, never by a resync timer.
pub struct SharedInformerFactory {
    client: Client,
    nodes: Store<Node>,
    node_writer: Mutex<Option<Writer<Node>>>,
}

impl SharedInformerFactory {
    pub fn new(client: Client) -> Self {
        let (nodes, writer) = reflector::store();

        Self {
            client,
            nodes,
            node_writer: Mutex::new(Some(writer)),
        }
    }

    /// Interval between forced re-deliveries of cached objects. Always zero.
    pub fn resync_period(&self) -> Duration {
        Duration::ZERO
    }

    /// Read-only view of the node inventory.
    pub fn nodes(&self) -> Store<Node> {
        self.nodes.clone()
    }

    /// Spawn the watch loops. Calling this more than once is a no-op, so both
    /// the server and tests can start the factory without coordinating.
    pub fn start(&self, token: CancellationToken) -> Option<JoinHandle<()>> {
        let writer = match self.node_writer.lock() {
            Ok(mut guard) => guard.take()?,
            Err(poisoned) => poisoned.into_inner().take()?,
        };

        let api: Api<Node> = Api::all(self.client.clone());

        Some(tokio::spawn(async move {
            info!("Starting node informer");

            let mut stream = reflector::reflector(
                writer,
                watcher(api, watcher::Config::default()).default_backoff(),
            )
            .applied_objects()
            .boxed();

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    next = stream.next() => match next {
                        Some(Ok(node)) => debug!("Observed node {}", node.name_any()),
                        Some(Err(e)) => warn!("Node watch error: {}", e),
                        None => break,
                    },
                }
            }

            info!("Node informer stopped");
        }))
    }

    /// Wait until the initial list has been delivered to every store.
    pub async fn wait_for_cache_sync(&self) -> bool {
        self.nodes.wait_until_ready().await.is_ok()
    }
}
