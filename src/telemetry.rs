use anyhow::{Context, Result};
use metrics::gauge;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::observe::ensure_metrics_described;

pub struct Telemetry {
    pub handle: PrometheusHandle,
}

impl Telemetry {
    /// Install the global Prometheus recorder and publish the configured poll interval.
    pub fn init(interval_secs: u64) -> Result<Self> {
        // Use default buckets to avoid API differences across crate versions.
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("prometheus: install recorder")?;

        ensure_metrics_described();
        gauge!("sentinel_poll_interval_secs").set(interval_secs as f64);

        Ok(Self { handle })
    }
}
