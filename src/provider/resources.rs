//! `metrics.k8s.io/v1beta1` resource shapes.

use crate::sources::Usage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

pub const GROUP: &str = "metrics.k8s.io";
pub const VERSION: &str = "v1beta1";
pub const API_VERSION: &str = "metrics.k8s.io/v1beta1";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeMetrics {
    pub kind: String,
    pub api_version: String,
    pub metadata: ObjectMeta,
    pub timestamp: DateTime<Utc>,
    pub window: String,
    pub usage: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerMetrics {
    pub name: String,
    pub usage: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodMetrics {
    pub kind: String,
    pub api_version: String,
    pub metadata: ObjectMeta,
    pub timestamp: DateTime<Utc>,
    pub window: String,
    pub containers: Vec<ContainerMetrics>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsList<T> {
    pub kind: String,
    pub api_version: String,
    pub metadata: BTreeMap<String, String>,
    pub items: Vec<T>,
}

impl<T> MetricsList<T> {
    pub fn new(kind: &str, items: Vec<T>) -> Self {
        Self {
            kind: kind.to_string(),
            api_version: API_VERSION.to_string(),
            metadata: BTreeMap::new(),
            items,
        }
    }
}

/// Render usage as Kubernetes quantities: CPU in nanocores, memory in
/// binary-SI units when the byte count is an exact multiple of 1Ki.
pub fn usage_to_quantities(usage: &Usage) -> BTreeMap<String, String> {
    let memory = if usage.memory_bytes != 0 && usage.memory_bytes % 1024 == 0 {
        format!("{}Ki", usage.memory_bytes / 1024)
    } else {
        usage.memory_bytes.to_string()
    };

    let mut quantities = BTreeMap::new();
    quantities.insert("cpu".to_string(), format!("{}n", usage.cpu_nano_cores));
    quantities.insert("memory".to_string(), memory);
    quantities
}

/// Format a window the way the API machinery prints durations: `1.5s`,
/// `1m0s`, `1h2m3s`, `250ms`.
pub fn format_window(window: Duration) -> String {
    let secs = window.as_secs();
    let nanos = u64::from(window.subsec_nanos());

    if secs == 0 {
        return match nanos {
            0 => "0s".to_string(),
            n if n < 1_000 => format!("{}ns", n),
            n if n < 1_000_000 => format!("{}µs", decimal(n / 1_000, n % 1_000, 3)),
            n => format!("{}ms", decimal(n / 1_000_000, n % 1_000_000, 6)),
        };
    }

    let hours = secs / 3600;
    let minutes = secs / 60 % 60;
    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{}h", hours));
    }
    if hours > 0 || minutes > 0 {
        out.push_str(&format!("{}m", minutes));
    }
    out.push_str(&format!("{}s", decimal(secs % 60, nanos, 9)));
    out
}

/// `whole.frac` with the fraction zero-padded to `digits` and trailing zeros trimmed.
fn decimal(whole: u64, frac: u64, digits: usize) -> String {
    let frac = format!("{:0width$}", frac, width = digits);
    let frac = frac.trim_end_matches('0');
    if frac.is_empty() {
        whole.to_string()
    } else {
        format!("{}.{}", whole, frac)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantities() {
        let q = usage_to_quantities(&Usage {
            cpu_nano_cores: 250_000_000,
            memory_bytes: 2048,
        });
        assert_eq!(q["cpu"], "250000000n");
        assert_eq!(q["memory"], "2Ki");

        let q = usage_to_quantities(&Usage {
            cpu_nano_cores: 0,
            memory_bytes: 1000,
        });
        assert_eq!(q["cpu"], "0n");
        assert_eq!(q["memory"], "1000");
    }

    #[test]
    fn test_format_window() {
        assert_eq!(format_window(Duration::from_secs(30)), "30s");
        assert_eq!(format_window(Duration::from_millis(1500)), "1.5s");
        assert_eq!(format_window(Duration::from_millis(1050)), "1.05s");
        assert_eq!(format_window(Duration::from_secs(60)), "1m0s");
        assert_eq!(format_window(Duration::from_secs(90)), "1m30s");
        assert_eq!(format_window(Duration::from_secs(3723)), "1h2m3s");
        assert_eq!(format_window(Duration::from_millis(250)), "250ms");
        assert_eq!(format_window(Duration::from_micros(1500)), "1.5ms");
        assert_eq!(format_window(Duration::from_nanos(1500)), "1.5µs");
        assert_eq!(format_window(Duration::ZERO), "0s");
    }
}
