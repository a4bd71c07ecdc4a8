//! Kubelet summary API source.
//!
//! One source per node currently in the node store. Each source fetches the
//! node's summary from its kubelet and decodes node, pod and container usage.

pub mod client;
pub mod types;

pub use client::{KubeletClient, KubeletConfig, KubeletError, KubeletInterface};

use super::{
    ContainerMetricsPoint, MetricSource, MetricSourceProvider, MetricsBatch, NodeMetricsPoint,
    PodMetricsPoint, Usage,
};
use crate::error::ScrapeError;
use crate::k8s::{preferred_address, NodeAddressType};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::runtime::reflector::Store;
use kube::ResourceExt;
use std::sync::Arc;
use tracing::{debug, warn};
use types::{ContainerStats, CpuStats, MemoryStats, PodStats, Summary};

/// Read access to the current node inventory.
#[async_trait]
pub trait NodeLister: Send + Sync {
    fn list(&self) -> Vec<Arc<Node>>;

    /// Resolves once the initial listing has been delivered.
    async fn ready(&self) {}
}

#[async_trait]
impl NodeLister for Store<Node> {
    fn list(&self) -> Vec<Arc<Node>> {
        self.state()
    }

    async fn ready(&self) {
        if self.wait_until_ready().await.is_err() {
            warn!("Node store closed before the initial listing");
        }
    }
}

pub struct SummaryProvider {
    nodes: Arc<dyn NodeLister>,
    kubelet: Arc<dyn KubeletInterface>,
    address_types: Vec<NodeAddressType>,
}

impl SummaryProvider {
    pub fn new(
        nodes: Arc<dyn NodeLister>,
        kubelet: Arc<dyn KubeletInterface>,
        address_types: Vec<NodeAddressType>,
    ) -> Self {
        Self {
            nodes,
            kubelet,
            address_types,
        }
    }
}

#[async_trait]
impl MetricSourceProvider for SummaryProvider {
    async fn get_metric_sources(&self) -> (Vec<Box<dyn MetricSource>>, Vec<ScrapeError>) {
        let mut sources: Vec<Box<dyn MetricSource>> = Vec::new();
        let mut errors = Vec::new();

        self.nodes.ready().await;
        for node in self.nodes.list() {
            let node_name = node.name_any();

            match preferred_address(&node, &self.address_types) {
                Some(address) => sources.push(Box::new(SummaryMetricsSource {
                    name: format!("kubelet_summary:{}", node_name),
                    node_name,
                    address,
                    kubelet: self.kubelet.clone(),
                })),
                None => errors.push(ScrapeError::NoAddress {
                    node: node_name,
                    preferred: self
                        .address_types
                        .iter()
                        .map(|t| t.as_str())
                        .collect::<Vec<_>>()
                        .join(","),
                }),
            }
        }

        (sources, errors)
    }
}

pub struct SummaryMetricsSource {
    name: String,
    node_name: String,
    address: String,
    kubelet: Arc<dyn KubeletInterface>,
}

#[async_trait]
impl MetricSource for SummaryMetricsSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn collect(&self) -> Result<MetricsBatch, ScrapeError> {
        let summary = self
            .kubelet
            .get_summary(&self.address)
            .await
            .map_err(|e| match e {
                KubeletError::Decode(reason) => ScrapeError::Decode {
                    source_name: self.name.clone(),
                    reason,
                },
                other => ScrapeError::Fetch {
                    source_name: self.name.clone(),
                    reason: format!("{} ({})", other, self.address),
                },
            })?;

        decode_batch(&summary, &self.node_name).map_err(|reason| ScrapeError::Decode {
            source_name: self.name.clone(),
            reason,
        })
    }
}

/// Convert a kubelet summary into a batch. The node point is mandatory;
/// pods with any incomplete container are skipped.
pub fn decode_batch(summary: &Summary, node_name: &str) -> Result<MetricsBatch, String> {
    let (timestamp, usage) = decode_usage(summary.node.cpu.as_ref(), summary.node.memory.as_ref())
        .ok_or_else(|| format!("missing cpu or memory usage for node {}", node_name))?;

    let pods = summary
        .pods
        .iter()
        .filter_map(|pod| {
            let decoded = decode_pod(pod);
            if decoded.is_none() {
                debug!(
                    "Skipping pod {}/{} with incomplete container metrics",
                    pod.pod_ref.namespace, pod.pod_ref.name
                );
            }
            decoded
        })
        .collect();

    Ok(MetricsBatch {
        nodes: vec![NodeMetricsPoint {
            name: node_name.to_string(),
            timestamp,
            usage,
        }],
        pods,
    })
}

fn decode_pod(pod: &PodStats) -> Option<PodMetricsPoint> {
    if pod.containers.is_empty() {
        return None;
    }

    let mut timestamp = None;
    let mut containers = Vec::with_capacity(pod.containers.len());

    for container in &pod.containers {
        let (ts, usage) = decode_container(container)?;
        timestamp = Some(timestamp.map_or(ts, |t: chrono::DateTime<chrono::Utc>| t.max(ts)));
        containers.push(ContainerMetricsPoint {
            name: container.name.clone(),
            usage,
        });
    }

    Some(PodMetricsPoint {
        name: pod.pod_ref.name.clone(),
        namespace: pod.pod_ref.namespace.clone(),
        timestamp: timestamp?,
        containers,
    })
}

fn decode_container(container: &ContainerStats) -> Option<(chrono::DateTime<chrono::Utc>, Usage)> {
    decode_usage(container.cpu.as_ref(), container.memory.as_ref())
}

fn decode_usage(
    cpu: Option<&CpuStats>,
    memory: Option<&MemoryStats>,
) -> Option<(chrono::DateTime<chrono::Utc>, Usage)> {
    let cpu = cpu?;
    let memory = memory?;

    Some((
        cpu.time,
        Usage {
            cpu_nano_cores: cpu.usage_nano_cores?,
            memory_bytes: memory.working_set_bytes?,
        },
    ))
}
