//! Command-line argument parsing.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// virtnode - VM lifecycle management for KVM/QEMU and OpenVZ hosts
#[derive(Parser, Debug)]
#[command(name = "virtnode")]
#[command(about = "virtnode - VM lifecycle management for KVM/QEMU and OpenVZ hosts")]
#[command(version)]
pub struct Args {
    /// Path to configuration file (optional, defaults used if not found)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true, env = "VIRTNODE_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Log format (pretty, json)
    #[arg(long, global = true)]
    pub log_format: Option<String>,

    /// Backend URI to operate on (e.g. qemu:///system, openvz:///system, test:///default)
    #[arg(short, long, global = true, env = "VIRTNODE_BACKEND")]
    pub backend: Option<String>,

    /// Storage pool templates are deployed from
    #[arg(long, global = true)]
    pub pool: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List all VMs, running first
    List,
    /// List VM ids: defined names, then running ids
    Ids,
    /// Show one VM
    Info { uuid: String },
    /// Start a defined VM
    Start { uuid: String },
    /// Ask a VM to shut down
    Shutdown { uuid: String },
    /// Power a VM off
    Destroy { uuid: String },
    /// Reboot a VM, power-cycling it where the driver cannot reboot
    Reboot {
        uuid: String,
        /// Give up waiting for shutoff after this many seconds
        #[arg(long)]
        timeout_secs: Option<u64>,
        /// Status poll interval in milliseconds
        #[arg(long, default_value = "1000")]
        poll_interval_ms: u64,
    },
    /// Pause a running VM
    Suspend { uuid: String },
    /// Resume a paused VM
    Resume { uuid: String },
    /// Remove a VM definition
    Undeploy { uuid: String },
    /// Deploy a VM from a local template
    Deploy {
        /// Template setting as key=value (repeatable), e.g. template_name=centos
        #[arg(short, long = "param", value_parser = parse_key_val)]
        params: Vec<(String, String)>,
    },
    /// List local templates for the backend
    Templates,
    /// Show a VM's consoles
    Consoles { uuid: String },
    /// Show a VM's network interfaces
    Interfaces { uuid: String },
    /// Sample usage metrics of running containers
    Metrics,
    /// Host memory left for new VMs, in MiB
    FreeMem,
    /// Detect installed backends from /dev
    DetectBackends,
}

/// Parse a `key=value` pair.
fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("invalid key=value: no '=' in '{}'", s))?;
    if key.is_empty() {
        return Err(format!("invalid key=value: empty key in '{}'", s));
    }
    Ok((key.to_string(), value.to_string()))
}
