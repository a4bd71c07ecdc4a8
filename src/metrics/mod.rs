pub mod exporter;

pub use exporter::ServiceMetrics;
