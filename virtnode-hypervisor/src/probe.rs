//! Guest telemetry probes for OpenVZ containers.
//!
//! OpenVZ exposes no structured statistics through libvirt, so usage data is
//! read from inside the container with `vzctl exec`. All text parsing lives
//! in the pure `parse_*` functions below.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::error::{Result, VirtError};
use crate::shell::CommandRunner;

/// Number of CPU accounting counters sampled from `/proc/stat`
/// (user, nice, system, idle, iowait, irq).
pub const CPU_COUNTERS: usize = 6;

/// Position of the idle counter.
pub const CPU_IDLE_INDEX: usize = 3;

/// Point-in-time readings from inside a guest.
#[async_trait]
pub trait GuestProbe: Send + Sync {
    /// Raw CPU accounting counters, [`CPU_COUNTERS`] long.
    async fn cpu_counters(&self, ctid: &str) -> Result<Vec<u64>>;

    /// 1-minute load average.
    async fn load_average(&self, ctid: &str) -> Result<f64>;

    /// Used memory in MiB.
    async fn memory_used_mib(&self, ctid: &str) -> Result<f64>;

    /// Cumulative `(received, transmitted)` bytes on the venet0 interface.
    async fn network_bytes(&self, ctid: &str) -> Result<(u64, u64)>;

    /// Used space on `/` in MiB.
    async fn disk_used_mib(&self, ctid: &str) -> Result<f64>;

    /// Seconds since the guest booted.
    async fn uptime_secs(&self, ctid: &str) -> Result<f64>;
}

/// Probe implementation running commands through `vzctl exec`.
pub struct VzProbe {
    runner: Arc<dyn CommandRunner>,
}

impl VzProbe {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    async fn exec(&self, ctid: &str, command: &str) -> Result<String> {
        debug!(ctid = %ctid, command = %command, "Probing container");
        self.runner
            .execute(&format!("vzctl exec {} \"{}\"", ctid, command))
            .await
    }
}

#[async_trait]
impl GuestProbe for VzProbe {
    async fn cpu_counters(&self, ctid: &str) -> Result<Vec<u64>> {
        parse_cpu_counters(&self.exec(ctid, "head -n 1 /proc/stat").await?)
    }

    async fn load_average(&self, ctid: &str) -> Result<f64> {
        parse_loadavg(&self.exec(ctid, "cat /proc/loadavg").await?)
    }

    async fn memory_used_mib(&self, ctid: &str) -> Result<f64> {
        parse_free_used_mib(&self.exec(ctid, "free -k").await?)
    }

    async fn network_bytes(&self, ctid: &str) -> Result<(u64, u64)> {
        parse_net_dev(&self.exec(ctid, "cat /proc/net/dev").await?, "venet0")
    }

    async fn disk_used_mib(&self, ctid: &str) -> Result<f64> {
        parse_df_used_mib(&self.exec(ctid, "df -P /").await?, "/")
    }

    async fn uptime_secs(&self, ctid: &str) -> Result<f64> {
        parse_uptime(&self.exec(ctid, "cat /proc/uptime").await?)
    }
}

fn probe_error(what: &str, output: &str) -> VirtError {
    VirtError::Probe(format!("{}: unexpected output '{}'", what, output))
}

fn parse_number<T: std::str::FromStr>(what: &str, field: &str) -> Result<T> {
    field
        .parse()
        .map_err(|_| VirtError::Probe(format!("{}: '{}' is not a number", what, field)))
}

/// Parse the aggregate `cpu` line of `/proc/stat`.
///
/// Kernels older than 2.6 report only four counters; the missing ones are
/// zero.
pub fn parse_cpu_counters(output: &str) -> Result<Vec<u64>> {
    let line = output.lines().next().unwrap_or_default();
    let mut fields = line.split_whitespace();

    if fields.next() != Some("cpu") {
        return Err(probe_error("/proc/stat", line));
    }

    let mut counters = fields
        .take(CPU_COUNTERS)
        .map(|f| parse_number::<u64>("/proc/stat", f))
        .collect::<Result<Vec<_>>>()?;

    if counters.len() <= CPU_IDLE_INDEX {
        return Err(probe_error("/proc/stat", line));
    }
    counters.resize(CPU_COUNTERS, 0);

    Ok(counters)
}

/// First field of `/proc/loadavg`.
pub fn parse_loadavg(output: &str) -> Result<f64> {
    let first = output
        .split_whitespace()
        .next()
        .ok_or_else(|| probe_error("/proc/loadavg", output))?;
    parse_number("/proc/loadavg", first)
}

/// Used memory from `free -k`, in MiB.
///
/// Older procps print a `-/+ buffers/cache:` line whose used column excludes
/// caches; newer ones already exclude them on the `Mem:` line.
pub fn parse_free_used_mib(output: &str) -> Result<f64> {
    let buffers_line = output
        .lines()
        .find(|l| l.trim_start().starts_with("-/+ buffers/cache:"));

    let used = match buffers_line {
        Some(line) => line.split_whitespace().nth(2),
        None => output
            .lines()
            .find(|l| l.trim_start().starts_with("Mem:"))
            .and_then(|line| line.split_whitespace().nth(2)),
    }
    .ok_or_else(|| probe_error("free", output))?;

    Ok(parse_number::<f64>("free", used)? / 1024.0)
}

/// Cumulative receive and transmit bytes of `interface` from
/// `/proc/net/dev`.
pub fn parse_net_dev(output: &str, interface: &str) -> Result<(u64, u64)> {
    let stats = output
        .lines()
        .filter_map(|l| l.split_once(':'))
        .find(|(name, _)| name.trim() == interface)
        .map(|(_, stats)| stats.split_whitespace().collect::<Vec<_>>())
        .ok_or_else(|| probe_error("/proc/net/dev", output))?;

    if stats.len() < 9 {
        return Err(probe_error("/proc/net/dev", output));
    }

    Ok((
        parse_number("/proc/net/dev", stats[0])?,
        parse_number("/proc/net/dev", stats[8])?,
    ))
}

/// Used space on `mount_point` from POSIX `df -P` output, in MiB.
pub fn parse_df_used_mib(output: &str, mount_point: &str) -> Result<f64> {
    let used = output
        .lines()
        .skip(1)
        .map(|l| l.split_whitespace().collect::<Vec<_>>())
        .find(|fields| fields.len() >= 6 && fields[fields.len() - 1] == mount_point)
        .map(|fields| fields[2].to_string())
        .ok_or_else(|| probe_error("df", output))?;

    Ok(parse_number::<f64>("df", &used)? / 1024.0)
}

/// First field of `/proc/uptime`.
pub fn parse_uptime(output: &str) -> Result<f64> {
    let first = output
        .split_whitespace()
        .next()
        .ok_or_else(|| probe_error("/proc/uptime", output))?;
    parse_number("/proc/uptime", first)
}
