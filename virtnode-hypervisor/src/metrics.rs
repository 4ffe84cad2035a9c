//! Usage metrics for running OpenVZ containers.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::backend::Backend;
use crate::counters::{CounterSample, CounterStore};
use crate::error::{Result, VirtError};
use crate::probe::{GuestProbe, CPU_IDLE_INDEX};
use crate::traits::Hypervisor;
use crate::types::{DomainHandle, VmMetrics};

/// Fraction of non-idle time between two CPU counter samples.
pub fn cpu_usage(previous: &[u64], current: &[u64]) -> f64 {
    let deltas: Vec<u64> = current
        .iter()
        .zip(previous.iter().chain(std::iter::repeat(&0)))
        .map(|(cur, prev)| cur.saturating_sub(*prev))
        .collect();

    let total: u64 = deltas.iter().sum();
    if total == 0 {
        return 0.0;
    }
    let idle = deltas.get(CPU_IDLE_INDEX).copied().unwrap_or(0);
    1.0 - idle as f64 / total as f64
}

/// Larger of the receive and transmit rates, in bytes per second.
pub fn network_rate(previous: &CounterSample, current: &CounterSample) -> f64 {
    let window = current.timestamp - previous.timestamp;
    if window <= 0.0 {
        return 0.0;
    }

    let rate = |i: usize| {
        let cur = current.values.get(i).copied().unwrap_or(0);
        let prev = previous.values.get(i).copied().unwrap_or(0);
        cur.saturating_sub(prev) as f64 / window
    };
    rate(0).max(rate(1))
}

/// Samples container usage, keeping counter history in a [`CounterStore`].
pub struct MetricsSampler {
    probe: Arc<dyn GuestProbe>,
    counters: Arc<dyn CounterStore>,
}

impl MetricsSampler {
    pub fn new(probe: Arc<dyn GuestProbe>, counters: Arc<dyn CounterStore>) -> Self {
        Self { probe, counters }
    }

    /// Metrics for every running container, keyed by UUID.
    ///
    /// Non-OpenVZ backends yield an empty map, as does any driver fault
    /// while enumerating. Probe failures are returned.
    #[instrument(skip_all, fields(uri = %hv.uri()))]
    pub async fn sample_all(&self, hv: &dyn Hypervisor, backend: &Backend) -> Result<BTreeMap<String, VmMetrics>> {
        if !matches!(backend, Backend::OpenVz(_)) {
            return Ok(BTreeMap::new());
        }

        match self.collect(hv, backend).await {
            Err(VirtError::Backend(fault)) => {
                warn!(%fault, "Driver fault while sampling metrics");
                Ok(BTreeMap::new())
            }
            other => other,
        }
    }

    async fn collect(&self, hv: &dyn Hypervisor, backend: &Backend) -> Result<BTreeMap<String, VmMetrics>> {
        let mut metrics = BTreeMap::new();
        for id in backend.running_ids(hv).await? {
            let dom = hv.lookup_by_id(id).await?;
            let sample = self.sample(&dom).await?;
            metrics.insert(dom.uuid_string(), sample);
        }
        debug!(count = metrics.len(), "Sampled container metrics");
        Ok(metrics)
    }

    /// Metrics for a single container.
    pub async fn sample(&self, dom: &DomainHandle) -> Result<VmMetrics> {
        let ctid = dom.name.as_str();

        let cpu_now = CounterSample::now(self.probe.cpu_counters(ctid).await?);
        let cpu_prev = self
            .counters
            .roll(&format!("cpu-{}", ctid), cpu_now.clone(), cpu_now.clone())
            .await?;

        let load = self.probe.load_average(ctid).await?;
        let memory_usage = self.probe.memory_used_mib(ctid).await?;

        let (rx, tx) = self.probe.network_bytes(ctid).await?;
        let net_now = CounterSample::now(vec![rx, tx]);
        let net_prev = self
            .counters
            .roll(&format!("network-{}", ctid), net_now.clone(), net_now.clone())
            .await?;

        let diskspace_usage = self.probe.disk_used_mib(ctid).await?;

        Ok(VmMetrics {
            cpu_usage: cpu_usage(&cpu_prev.values, &cpu_now.values),
            load,
            memory_usage,
            network_usage: network_rate(&net_prev, &net_now),
            diskspace_usage,
        })
    }
}
