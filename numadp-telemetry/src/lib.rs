//! # numadp Telemetry
//!
//! Logging setup and Prometheus gauges for the pool system.

pub mod logging;
pub mod metrics;

pub use logging::init_logging;
pub use metrics::MetricsRecorder;
