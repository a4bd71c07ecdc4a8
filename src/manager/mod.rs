//! Periodic driver of the collection pipeline.
//!
//! The manager is the only reader of the source manager and the only writer
//! of the sink. It also owns the health signal for the pipeline: the outcome
//! of the most recent completed cycle.

use crate::apiserver::healthz::HealthzChecker;
use crate::metrics::ServiceMetrics;
use crate::provider::MetricSink;
use crate::sources::SourceManager;
use crate::{Error, Result};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[derive(Debug, Default, Clone)]
struct HealthState {
    last_tick_start: Option<Instant>,
    last_ok: bool,
    last_error: Option<String>,
    ticks: u64,
}

pub struct Manager {
    source: SourceManager,
    sink: Arc<dyn MetricSink>,
    resolution: Duration,
    health: RwLock<HealthState>,
    metrics: Arc<ServiceMetrics>,
}

impl Manager {
    pub fn new(
        source: SourceManager,
        sink: Arc<dyn MetricSink>,
        resolution: Duration,
        metrics: Arc<ServiceMetrics>,
    ) -> Result<Self> {
        if resolution.is_zero() {
            return Err(Error::Manager(
                "metric resolution must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            source,
            sink,
            resolution,
            health: RwLock::new(HealthState::default()),
            metrics,
        })
    }

    /// Number of completed cycles.
    pub fn ticks(&self) -> u64 {
        self.read_health().ticks
    }

    /// Run one collection cycle and store its results. The cycle is bounded
    /// by the resolution so that a slow cycle never overlaps the next tick.
    pub async fn collect(&self) {
        let start = Instant::now();
        self.write_health(|h| h.last_tick_start = Some(start));

        let outcome = self.source.collect(self.resolution).await;
        let healthy = outcome.is_healthy();
        let last_error = if healthy {
            None
        } else if outcome.errors.is_empty() {
            Some("no sources returned metrics".to_string())
        } else {
            Some(
                outcome
                    .errors
                    .iter()
                    .map(|e| e.to_string())
                    .collect::<Vec<_>>()
                    .join("; "),
            )
        };

        self.sink.receive(outcome.batch).await;

        let elapsed = start.elapsed();
        self.metrics.observe_tick(elapsed);

        match &last_error {
            None => debug!("Collection cycle finished in {:?}", elapsed),
            Some(e) => error!("Collection cycle finished in {:?} with errors: {}", elapsed, e),
        }

        self.write_health(|h| {
            h.last_ok = healthy;
            h.last_error = last_error;
            h.ticks += 1;
        });
    }

    /// Start the periodic loop. The first cycle starts immediately; after the
    /// token fires no new cycle is started, and a cycle already running is
    /// left to finish within its own deadline.
    pub fn run_until(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Starting metrics manager with resolution {:?}", self.resolution);

            let mut ticker = tokio::time::interval(self.resolution);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => self.collect().await,
                }
            }

            info!("Metrics manager stopped");
        })
    }

    /// Healthy when the last cycle started recently and succeeded.
    pub fn check_health(&self) -> std::result::Result<(), String> {
        let health = self.read_health();

        let last_tick = health
            .last_tick_start
            .ok_or_else(|| "no collection cycle has run yet".to_string())?;

        // 1.1x leaves a little room for timer jitter.
        let max_tick_wait = self.resolution.mul_f64(1.1);
        let tick_wait = last_tick.elapsed();
        if tick_wait > max_tick_wait {
            return Err(format!(
                "time since last tick ({:?}) was greater than expected metrics resolution ({:?})",
                tick_wait, max_tick_wait
            ));
        }

        if !health.last_ok {
            return Err(format!(
                "there was an error collecting or saving metrics in the last collection tick: {}",
                health
                    .last_error
                    .as_deref()
                    .unwrap_or("cycle still in progress")
            ));
        }

        Ok(())
    }

    fn read_health(&self) -> HealthState {
        match self.health.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn write_health(&self, update: impl FnOnce(&mut HealthState)) {
        match self.health.write() {
            Ok(mut guard) => update(&mut guard),
            Err(poisoned) => update(&mut poisoned.into_inner()),
        }
    }
}

impl HealthzChecker for Manager {
    fn name(&self) -> &str {
        "healthz"
    }

    fn check(&self) -> std::result::Result<(), String> {
        self.check_health()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{NodeMetricsProvider, SinkProvider};
    use crate::sources::testing::FakeProvider;

    const RESOLUTION: Duration = Duration::from_secs(10);

    fn pipeline(provider: Arc<FakeProvider>) -> (Arc<Manager>, Arc<SinkProvider>) {
        let metrics = Arc::new(ServiceMetrics::new().unwrap());
        let source = SourceManager::new(provider, Duration::from_secs(4), metrics.clone()).unwrap();
        let sink = SinkProvider::new(RESOLUTION);
        let manager = Manager::new(source, sink.clone(), RESOLUTION, metrics).unwrap();
        (Arc::new(manager), sink)
    }

    #[test]
    fn test_zero_resolution_is_rejected() {
        let metrics = Arc::new(ServiceMetrics::new().unwrap());
        let source =
            SourceManager::new(Arc::new(FakeProvider::default()), Duration::from_secs(1), metrics.clone())
                .unwrap();
        let result = Manager::new(source, SinkProvider::new(RESOLUTION), Duration::ZERO, metrics);
        assert!(matches!(result, Err(Error::Manager(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unhealthy_before_first_cycle() {
        let (manager, _) = pipeline(Arc::new(FakeProvider::default()));
        assert!(manager.check_health().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_nodes_respond() {
        let provider = Arc::new(FakeProvider::with_nodes(&[
            ("node-1", Duration::from_millis(100), false),
            ("node-2", Duration::from_millis(200), false),
            ("node-3", Duration::from_millis(300), false),
        ]));
        let (manager, sink) = pipeline(provider);

        manager.collect().await;

        assert_eq!(sink.list_node_metrics().await.len(), 3);
        assert!(manager.check_health().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_node_is_dropped_and_unhealthy() {
        let provider = Arc::new(FakeProvider::with_nodes(&[
            ("node-1", Duration::from_millis(100), false),
            ("node-2", Duration::from_millis(100), false),
            ("node-3", Duration::from_millis(100), false),
        ]));
        let (manager, sink) = pipeline(provider.clone());

        manager.collect().await;
        assert_eq!(sink.list_node_metrics().await.len(), 3);

        provider.set_nodes(&[
            ("node-1", Duration::from_millis(100), false),
            ("node-2", Duration::from_millis(100), false),
            ("node-3", Duration::from_secs(5), false),
        ]);
        manager.collect().await;

        let nodes = sink.list_node_metrics().await;
        assert_eq!(nodes.len(), 2);
        assert!(sink.get_node_metrics("node-3").await.is_none());

        let err = manager.check_health().unwrap_err();
        assert!(err.contains("node-3"), "{}", err);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_tracks_only_last_cycle() {
        let provider = Arc::new(FakeProvider::with_nodes(&[(
            "node-1",
            Duration::from_millis(10),
            true,
        )]));
        let (manager, _) = pipeline(provider.clone());

        manager.collect().await;
        assert!(manager.check_health().is_err());

        provider.set_nodes(&[("node-1", Duration::from_millis(10), false)]);
        manager.collect().await;
        assert!(manager.check_health().is_ok());

        provider.set_nodes(&[("node-1", Duration::from_millis(10), true)]);
        manager.collect().await;
        assert!(manager.check_health().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_tick_is_unhealthy() {
        let provider = Arc::new(FakeProvider::with_nodes(&[(
            "node-1",
            Duration::from_millis(10),
            false,
        )]));
        let (manager, _) = pipeline(provider);

        manager.collect().await;
        assert!(manager.check_health().is_ok());

        tokio::time::advance(Duration::from_secs(12)).await;
        let err = manager.check_health().unwrap_err();
        assert!(err.contains("time since last tick"), "{}", err);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_until_ticks_at_resolution_and_stops() {
        let provider = Arc::new(FakeProvider::with_nodes(&[(
            "node-1",
            Duration::from_millis(10),
            false,
        )]));
        let (manager, _) = pipeline(provider);
        let token = CancellationToken::new();

        let handle = manager.clone().run_until(token.clone());

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(manager.ticks(), 3, "ticks at 0s, 10s and 20s");

        token.cancel();
        handle.await.unwrap();

        let ticks = manager.ticks();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(manager.ticks(), ticks, "no cycle after cancellation");
    }
}
