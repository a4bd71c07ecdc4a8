//! In-memory sink holding the latest collected snapshot, and the query side
//! that serves it.
//!
//! The sink keeps exactly one point per node and per pod. Each write builds a
//! complete new snapshot and swaps it in; readers clone the `Arc` of whatever
//! snapshot is current, so a reader never sees half of a write.

pub mod resources;

use crate::sources::{MetricsBatch, NodeMetricsPoint, PodMetricsPoint};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use resources::{
    format_window, usage_to_quantities, ContainerMetrics, NodeMetrics, ObjectMeta, PodMetrics,
    API_VERSION,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Write side: replaces the stored snapshot with a full cycle's results.
#[async_trait]
pub trait MetricSink: Send + Sync {
    async fn receive(&self, batch: MetricsBatch);
}

#[async_trait]
pub trait NodeMetricsProvider: Send + Sync {
    async fn get_node_metrics(&self, name: &str) -> Option<NodeMetrics>;

    async fn list_node_metrics(&self) -> Vec<NodeMetrics>;
}

#[async_trait]
pub trait PodMetricsProvider: Send + Sync {
    async fn get_pod_metrics(&self, namespace: &str, name: &str) -> Option<PodMetrics>;

    /// All pods, or only those in `namespace` when given.
    async fn list_pod_metrics(&self, namespace: Option<&str>) -> Vec<PodMetrics>;
}

#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub nodes: HashMap<String, NodeMetricsPoint>,
    pub pods: HashMap<(String, String), PodMetricsPoint>,
    pub received_at: Option<DateTime<Utc>>,
}

impl MetricsSnapshot {
    fn from_batch(batch: MetricsBatch) -> Self {
        Self {
            nodes: batch
                .nodes
                .into_iter()
                .map(|n| (n.name.clone(), n))
                .collect(),
            pods: batch
                .pods
                .into_iter()
                .map(|p| ((p.namespace.clone(), p.name.clone()), p))
                .collect(),
            received_at: Some(Utc::now()),
        }
    }
}

pub struct SinkProvider {
    snapshot: RwLock<Arc<MetricsSnapshot>>,
    window: Duration,
}

impl SinkProvider {
    pub fn new(window: Duration) -> Arc<Self> {
        Arc::new(Self {
            snapshot: RwLock::new(Arc::new(MetricsSnapshot::default())),
            window,
        })
    }

    pub async fn snapshot(&self) -> Arc<MetricsSnapshot> {
        self.snapshot.read().await.clone()
    }

    fn node_metrics(&self, point: &NodeMetricsPoint) -> NodeMetrics {
        NodeMetrics {
            kind: "NodeMetrics".to_string(),
            api_version: API_VERSION.to_string(),
            metadata: ObjectMeta {
                name: Some(point.name.clone()),
                namespace: None,
                creation_timestamp: Some(Utc::now()),
            },
            timestamp: point.timestamp,
            window: format_window(self.window),
            usage: usage_to_quantities(&point.usage),
        }
    }

    fn pod_metrics(&self, point: &PodMetricsPoint) -> PodMetrics {
        PodMetrics {
            kind: "PodMetrics".to_string(),
            api_version: API_VERSION.to_string(),
            metadata: ObjectMeta {
                name: Some(point.name.clone()),
                namespace: Some(point.namespace.clone()),
                creation_timestamp: Some(Utc::now()),
            },
            timestamp: point.timestamp,
            window: format_window(self.window),
            containers: point
                .containers
                .iter()
                .map(|c| ContainerMetrics {
                    name: c.name.clone(),
                    usage: usage_to_quantities(&c.usage),
                })
                .collect(),
        }
    }
}

#[async_trait]
impl MetricSink for SinkProvider {
    async fn receive(&self, batch: MetricsBatch) {
        let next = Arc::new(MetricsSnapshot::from_batch(batch));
        *self.snapshot.write().await = next;
    }
}

#[async_trait]
impl NodeMetricsProvider for SinkProvider {
    async fn get_node_metrics(&self, name: &str) -> Option<NodeMetrics> {
        let snapshot = self.snapshot().await;
        snapshot.nodes.get(name).map(|p| self.node_metrics(p))
    }

    async fn list_node_metrics(&self) -> Vec<NodeMetrics> {
        let snapshot = self.snapshot().await;
        let mut items: Vec<_> = snapshot.nodes.values().map(|p| self.node_metrics(p)).collect();
        items.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        items
    }
}

#[async_trait]
impl PodMetricsProvider for SinkProvider {
    async fn get_pod_metrics(&self, namespace: &str, name: &str) -> Option<PodMetrics> {
        let snapshot = self.snapshot().await;
        snapshot
            .pods
            .get(&(namespace.to_string(), name.to_string()))
            .map(|p| self.pod_metrics(p))
    }

    async fn list_pod_metrics(&self, namespace: Option<&str>) -> Vec<PodMetrics> {
        let snapshot = self.snapshot().await;
        let mut items: Vec<_> = snapshot
            .pods
            .values()
            .filter(|p| namespace.map_or(true, |ns| p.namespace == ns))
            .map(|p| self.pod_metrics(p))
            .collect();
        items.sort_by(|a, b| {
            (&a.metadata.namespace, &a.metadata.name).cmp(&(&b.metadata.namespace, &b.metadata.name))
        });
        items
    }
}
