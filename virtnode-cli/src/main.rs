//! # virtnode
//!
//! Command-line front end to the virtnode VM manager. Every command opens
//! a fresh session on the selected backend and prints its result as JSON.
//!
//! ## Usage
//! ```bash
//! virtnode --backend qemu:///system list
//! virtnode --backend openvz:///system deploy -p template_name=debian-7 -p vm_type=openvz
//! ```

use anyhow::Result;
use clap::Parser;
use serde::Serialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use virtnode_common::{init_logging, LogFormat};
use virtnode_hypervisor::types::backend_hname;
use virtnode_hypervisor::{RebootOptions, TemplateSettings, VirtManager};

mod cli;
mod config;

use cli::{Args, Command};
use config::{Config, DEFAULT_CONFIG_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let (config, source) = load_config(&args)?;
    let config = config.with_cli_overrides(&args);

    let format: LogFormat = config.general.log_format.parse()?;
    init_logging(&config.general.log_level, format)?;
    debug!(source = %source, "Configuration loaded");

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let mut manager = VirtManager::new(config.manager_options());
    run(&mut manager, &config, &config_path, args.command).await
}

/// Explicit `--config`, else the default location, else built-in defaults.
fn load_config(args: &Args) -> Result<(Config, String)> {
    if let Some(path) = &args.config {
        return Ok((Config::load(path)?, path.display().to_string()));
    }

    if Path::new(DEFAULT_CONFIG_PATH).exists() {
        return Ok((Config::load(DEFAULT_CONFIG_PATH)?, DEFAULT_CONFIG_PATH.to_string()));
    }

    Ok((Config::default(), "defaults".to_string()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(manager: &mut VirtManager, config: &Config, config_path: &Path, command: Command) -> Result<()> {
    // Host-wide commands need no target backend
    match command {
        Command::FreeMem => return print_json(&json!({ "free_mem_mib": manager.free_mem().await? })),
        Command::DetectBackends => {
            let backends = manager.autodetect_backends();
            Config::store_backends(config_path, &backends)?;
            info!(path = %config_path.display(), "Stored detected backends");

            let detected: Vec<_> = backends
                .into_iter()
                .map(|uri| json!({ "name": backend_hname(&uri), "uri": uri }))
                .collect();
            return print_json(&detected);
        }
        _ => {}
    }

    let uri = config.target_backend()?;
    debug!(uri = %uri, ?command, "Running command");

    match command {
        Command::List => print_json(&manager.list(&uri).await?),
        Command::Ids => print_json(&manager.list_vm_ids(&uri).await?),
        Command::Info { uuid } => print_json(&manager.info(&uri, &uuid).await?),
        Command::Start { uuid } => {
            manager.start(&uri, &uuid).await?;
            print_json(&json!({ "uuid": uuid, "action": "start" }))
        }
        Command::Shutdown { uuid } => {
            manager.shutdown(&uri, &uuid).await?;
            print_json(&json!({ "uuid": uuid, "action": "shutdown" }))
        }
        Command::Destroy { uuid } => {
            manager.destroy(&uri, &uuid).await?;
            print_json(&json!({ "uuid": uuid, "action": "destroy" }))
        }
        Command::Reboot {
            uuid,
            timeout_secs,
            poll_interval_ms,
        } => {
            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, abandoning reboot");
                    on_signal.cancel();
                }
            });

            let mut options = RebootOptions::default()
                .with_poll_interval(Duration::from_millis(poll_interval_ms))
                .with_cancel(cancel);
            if let Some(secs) = timeout_secs {
                options = options.with_deadline(Duration::from_secs(secs));
            }

            manager.reboot(&uri, &uuid, options).await?;
            print_json(&json!({ "uuid": uuid, "action": "reboot" }))
        }
        Command::Suspend { uuid } => {
            manager.suspend(&uri, &uuid).await?;
            print_json(&json!({ "uuid": uuid, "action": "suspend" }))
        }
        Command::Resume { uuid } => {
            manager.resume(&uri, &uuid).await?;
            print_json(&json!({ "uuid": uuid, "action": "resume" }))
        }
        Command::Undeploy { uuid } => {
            manager.undeploy(&uri, &uuid).await?;
            print_json(&json!({ "uuid": uuid, "action": "undeploy" }))
        }
        Command::Deploy { params } => {
            let settings = TemplateSettings::from_pairs(params);
            manager.deploy(&uri, settings).await?;
            info!(uri = %uri, "Deployment finished");
            print_json(&json!({ "action": "deploy", "status": "ok" }))
        }
        Command::Templates => print_json(&manager.local_templates(&uri).await?),
        Command::Consoles { uuid } => {
            let vnc = manager.console_vnc(&uri, &uuid).await?;
            let pty = manager.console_pty(&uri, &uuid).await?;
            print_json(&json!({ "vnc": vnc, "pty": pty }))
        }
        Command::Interfaces { uuid } => print_json(&manager.interfaces(&uri, &uuid).await?),
        Command::Metrics => print_json(&manager.metrics(&uri).await?),
        Command::FreeMem | Command::DetectBackends => Ok(()),
    }
}
