//! Metric sources and the source manager that scrapes them once per cycle.
//!
//! A [`MetricSourceProvider`] enumerates the sources known right now (one per
//! node for the kubelet summary provider). The [`SourceManager`] fans out one
//! scrape per source, bounds each with the per-scrape timeout and bounds the
//! whole cycle with the cycle timeout. Whatever finished by then is returned;
//! everything else is reported as a per-source error.

pub mod summary;

use crate::error::ScrapeError;
use crate::metrics::ServiceMetrics;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Per-source scrape timeout used when none is configured.
pub const DEFAULT_SCRAPE_TIMEOUT: Duration = Duration::from_secs(20);

/// Instantaneous resource usage of a node, pod or container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub cpu_nano_cores: u64,
    pub memory_bytes: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeMetricsPoint {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub usage: Usage,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContainerMetricsPoint {
    pub name: String,
    pub usage: Usage,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PodMetricsPoint {
    pub name: String,
    pub namespace: String,
    pub timestamp: DateTime<Utc>,
    pub containers: Vec<ContainerMetricsPoint>,
}

/// Everything collected during one cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsBatch {
    pub nodes: Vec<NodeMetricsPoint>,
    pub pods: Vec<PodMetricsPoint>,
}

impl MetricsBatch {
    pub fn merge(&mut self, other: MetricsBatch) {
        self.nodes.extend(other.nodes);
        self.pods.extend(other.pods);
    }
}

#[async_trait]
pub trait MetricSource: Send + Sync {
    /// Stable identifier, used in logs, errors and scrape metrics.
    fn name(&self) -> &str;

    async fn collect(&self) -> std::result::Result<MetricsBatch, ScrapeError>;
}

#[async_trait]
pub trait MetricSourceProvider: Send + Sync {
    /// Sources to scrape this cycle, plus errors for entities that could not
    /// be turned into a source at all.
    async fn get_metric_sources(&self) -> (Vec<Box<dyn MetricSource>>, Vec<ScrapeError>);
}

/// Outcome of one collection cycle.
#[derive(Debug, Default)]
pub struct CollectOutcome {
    pub batch: MetricsBatch,
    pub errors: Vec<ScrapeError>,
    pub succeeded: usize,
}

impl CollectOutcome {
    /// A cycle is healthy only if at least one source succeeded and none failed.
    pub fn is_healthy(&self) -> bool {
        self.errors.is_empty() && self.succeeded > 0
    }
}

pub struct SourceManager {
    provider: Arc<dyn MetricSourceProvider>,
    scrape_timeout: Duration,
    metrics: Arc<ServiceMetrics>,
}

impl SourceManager {
    pub fn new(
        provider: Arc<dyn MetricSourceProvider>,
        scrape_timeout: Duration,
        metrics: Arc<ServiceMetrics>,
    ) -> Result<Self> {
        if scrape_timeout.is_zero() {
            return Err(Error::SourceManager(
                "scrape timeout must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            provider,
            scrape_timeout,
            metrics,
        })
    }

    /// Scrape every known source, returning partial results once
    /// `cycle_timeout` elapses. The cycle deadline takes precedence over the
    /// per-source timeout when both expire together.
    pub async fn collect(&self, cycle_timeout: Duration) -> CollectOutcome {
        let cycle_deadline = Instant::now() + cycle_timeout;
        let listed =
            tokio::time::timeout_at(cycle_deadline, self.provider.get_metric_sources()).await;
        let (sources, mut errors) = match listed {
            Ok(listed) => listed,
            Err(_) => {
                warn!("No sources listed within {:?}", cycle_timeout);
                return CollectOutcome {
                    errors: vec![ScrapeError::InventoryNotReady {
                        timeout: cycle_timeout,
                    }],
                    ..Default::default()
                };
            }
        };
        let scrape_timeout = self.scrape_timeout;

        debug!("Scraping {} sources", sources.len());

        let mut remaining: HashSet<String> = sources.iter().map(|s| s.name().to_string()).collect();

        let mut pending: FuturesUnordered<_> = sources
            .into_iter()
            .map(|source| async move {
                let name = source.name().to_string();
                let start = Instant::now();

                let result = match tokio::time::timeout(scrape_timeout, source.collect()).await {
                    Ok(result) => result,
                    Err(_) => Err(ScrapeError::Timeout {
                        source_name: name.clone(),
                        timeout: scrape_timeout,
                    }),
                };

                (name, start.elapsed(), result)
            })
            .collect();

        let mut outcome = CollectOutcome::default();
        let deadline = tokio::time::sleep_until(cycle_deadline);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;
                _ = &mut deadline => {
                    for source_name in remaining.drain() {
                        warn!("Cycle deadline reached before {} finished", source_name);
                        errors.push(ScrapeError::Timeout {
                            source_name,
                            timeout: cycle_timeout,
                        });
                    }
                    break;
                }
                next = pending.next() => match next {
                    Some((name, elapsed, result)) => {
                        remaining.remove(&name);
                        self.metrics.observe_scrape(&name, elapsed);

                        match result {
                            Ok(batch) => {
                                outcome.succeeded += 1;
                                outcome.batch.merge(batch);
                            }
                            Err(e) => {
                                warn!("{}", e);
                                errors.push(e);
                            }
                        }
                    }
                    None => break,
                },
            }
        }

        info!(
            "Collected {} nodes and {} pods ({} sources ok, {} errors)",
            outcome.batch.nodes.len(),
            outcome.batch.pods.len(),
            outcome.succeeded,
            errors.len()
        );

        outcome.errors = errors;
        outcome
    }
}
