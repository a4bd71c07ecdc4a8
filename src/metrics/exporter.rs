use prometheus::{
    Encoder, GaugeVec, Histogram, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;

/// Prometheus instrumentation for the collection pipeline and the API server.
///
/// Every instance owns its own registry so that tests can build as many
/// pipelines as they like without tripping duplicate registration.
pub struct ServiceMetrics {
    registry: Registry,
    scrape_duration: HistogramVec,
    last_scrape: GaugeVec,
    tick_duration: Histogram,
    http_requests: IntCounterVec,
}

impl ServiceMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let scrape_duration = HistogramVec::new(
            HistogramOpts::new(
                "kubemetrics_scraper_duration_seconds",
                "Time spent scraping sources in seconds",
            )
            .buckets(prometheus::exponential_buckets(0.01, 2.0, 12)?),
            &["source"],
        )?;
        let last_scrape = GaugeVec::new(
            Opts::new(
                "kubemetrics_scraper_last_time_seconds",
                "Last time the source was scraped, in seconds since the epoch",
            ),
            &["source"],
        )?;
        let tick_duration = Histogram::with_opts(
            HistogramOpts::new(
                "kubemetrics_manager_tick_duration_seconds",
                "The total time spent collecting and storing metrics in seconds",
            )
            .buckets(prometheus::exponential_buckets(0.01, 2.0, 14)?),
        )?;
        let http_requests = IntCounterVec::new(
            Opts::new(
                "kubemetrics_http_requests_total",
                "Requests served by the API server, by response code",
            ),
            &["code"],
        )?;

        registry.register(Box::new(scrape_duration.clone()))?;
        registry.register(Box::new(last_scrape.clone()))?;
        registry.register(Box::new(tick_duration.clone()))?;
        registry.register(Box::new(http_requests.clone()))?;

        #[cfg(target_os = "linux")]
        registry.register(Box::new(
            prometheus::process_collector::ProcessCollector::for_self(),
        ))?;

        Ok(Self {
            registry,
            scrape_duration,
            last_scrape,
            tick_duration,
            http_requests,
        })
    }

    pub fn observe_scrape(&self, source: &str, elapsed: Duration) {
        self.scrape_duration
            .with_label_values(&[source])
            .observe(elapsed.as_secs_f64());

        let now = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
        self.last_scrape.with_label_values(&[source]).set(now);
    }

    pub fn observe_tick(&self, elapsed: Duration) {
        self.tick_duration.observe(elapsed.as_secs_f64());
    }

    pub fn record_request(&self, code: u16) {
        self.http_requests
            .with_label_values(&[&code.to_string()])
            .inc();
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn encode(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;

        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_independent_registries() {
        let a = ServiceMetrics::new().unwrap();
        let b = ServiceMetrics::new().unwrap();

        a.observe_tick(Duration::from_millis(20));
        assert!(a.encode().unwrap().contains("kubemetrics_manager_tick_duration_seconds_count 1"));
        assert!(b.encode().unwrap().contains("kubemetrics_manager_tick_duration_seconds_count 0"));
    }

    #[test]
    fn test_scrape_metrics_are_labelled_by_source() {
        let metrics = ServiceMetrics::new().unwrap();
        metrics.observe_scrape("kubelet_summary:node-1", Duration::from_millis(150));
        metrics.record_request(200);

        let text = metrics.encode().unwrap();
        assert!(text.contains(r#"kubemetrics_scraper_duration_seconds_count{source="kubelet_summary:node-1"} 1"#));
        assert!(text.contains(r#"kubemetrics_http_requests_total{code="200"} 1"#));
    }
}
