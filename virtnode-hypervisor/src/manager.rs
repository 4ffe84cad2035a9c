//! High-level VM manager.
//!
//! `VirtManager` is the public entry point. Each operation opens a fresh
//! session on the requested backend URI, runs against it and drops it.
//! Sessions on simulation fixture URIs additionally write a snapshot of the
//! simulated node after every call, successful or not.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::backend::{openvz, BackendTools};
use crate::connection::{BackendConnection, Connector, DefaultConnector, Session};
use crate::counters::{CounterStore, FileCounterStore};
use crate::deploy::{DeploymentPipeline, HostCapacity, OvfDefaults, SystemHost};
use crate::error::{Result, VirtError};
use crate::lifecycle::{self, RebootOptions};
use crate::metrics::MetricsSampler;
use crate::probe::GuestProbe;
use crate::registry;
use crate::shell::{CommandRunner, ShellRunner};
use crate::template::{TemplateRepository, TemplateSettings};
use crate::types::{ConsoleDescriptor, InterfaceDescriptor, VmMetrics, VmRecord};

/// Memory held back for the host itself, in MiB.
pub const HOST_RESERVED_MIB: i64 = 256;

/// Device nodes that reveal an installed backend.
const BACKEND_DEVICES: [(&str, &str); 2] = [("vzctl", "openvz:///system"), ("kvm", "qemu:///system")];

/// Settings for a [`VirtManager`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerOptions {
    /// Allowed backend URIs. Empty allows any.
    pub backends: Vec<String>,
    /// Root of the storage pools
    pub storage_endpoint: PathBuf,
    pub default_pool: Option<String>,
    /// Where simulation snapshots are written
    pub snapshot_path: PathBuf,
    /// Where metric counter samples are kept between calls
    pub counter_dir: PathBuf,
    /// OpenVZ OS template cache
    pub template_cache: PathBuf,
    pub ovf_defaults: OvfDefaults,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            backends: Vec::new(),
            storage_endpoint: PathBuf::from("/storage"),
            default_pool: None,
            snapshot_path: PathBuf::from("/tmp/virtnode_test_state.xml"),
            counter_dir: PathBuf::from("/var/lib/virtnode/counters"),
            template_cache: PathBuf::from(openvz::DEFAULT_TEMPLATE_CACHE),
            ovf_defaults: OvfDefaults::default(),
        }
    }
}

/// Builder for a [`VirtManager`] with replaceable collaborators.
pub struct VirtManagerBuilder {
    options: ManagerOptions,
    connector: Arc<dyn Connector>,
    runner: Arc<dyn CommandRunner>,
    probe: Option<Arc<dyn GuestProbe>>,
    counters: Option<Arc<dyn CounterStore>>,
    host: Arc<dyn HostCapacity>,
}

impl VirtManagerBuilder {
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn probe(mut self, probe: Arc<dyn GuestProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn counter_store(mut self, counters: Arc<dyn CounterStore>) -> Self {
        self.counters = Some(counters);
        self
    }

    pub fn host(mut self, host: Arc<dyn HostCapacity>) -> Self {
        self.host = host;
        self
    }

    pub fn build(self) -> VirtManager {
        let mut tools = BackendTools::new(self.runner, self.options.template_cache.clone());
        if let Some(probe) = self.probe {
            tools = tools.with_probe(probe);
        }

        let counters = self
            .counters
            .unwrap_or_else(|| Arc::new(FileCounterStore::new(self.options.counter_dir.clone())));

        let pipeline = DeploymentPipeline::new(
            TemplateRepository::new(self.options.storage_endpoint.clone()),
            self.options.default_pool.clone(),
            self.options.ovf_defaults.clone(),
            self.host,
            tools.clone(),
        );

        VirtManager {
            connection: BackendConnection::new(self.options.backends.clone(), self.connector, tools.clone()),
            pipeline: Arc::new(pipeline),
            sampler: Arc::new(MetricsSampler::new(tools.probe.clone(), counters)),
            options: self.options,
        }
    }
}

/// VM lifecycle manager over libvirt and OpenVZ backends.
pub struct VirtManager {
    options: ManagerOptions,
    connection: BackendConnection,
    pipeline: Arc<DeploymentPipeline>,
    sampler: Arc<MetricsSampler>,
}

impl VirtManager {
    /// A manager using the system shell, libvirt and host.
    pub fn new(options: ManagerOptions) -> Self {
        Self::builder(options).build()
    }

    pub fn builder(options: ManagerOptions) -> VirtManagerBuilder {
        VirtManagerBuilder {
            options,
            connector: Arc::new(DefaultConnector),
            runner: Arc::new(ShellRunner::new()),
            probe: None,
            counters: None,
            host: Arc::new(SystemHost),
        }
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.options
    }

    /// The backend allow-list.
    pub fn backends(&self) -> &[String] {
        self.connection.allow_list()
    }

    /// Run `op` on a fresh session for `uri`.
    ///
    /// On fixture URIs the snapshot is written whatever `op` returned; the
    /// error of `op` takes precedence over a snapshot failure.
    pub async fn with_session<T, F>(&self, uri: &str, op: F) -> Result<T>
    where
        F: for<'s> FnOnce(&'s Session) -> BoxFuture<'s, Result<T>>,
    {
        let session = self.connection.connect(uri).await?;
        let result = op(&session).await;

        if session.is_fixture() {
            if let Err(e) = session.write_snapshot(&self.options.snapshot_path).await {
                warn!(uri = %uri, error = %e, "Failed to write simulation snapshot");
                if result.is_ok() {
                    return Err(e);
                }
            }
        }

        result
    }

    // =========================================================================
    // Enumeration
    // =========================================================================

    #[instrument(skip(self))]
    pub async fn list(&self, uri: &str) -> Result<Vec<VmRecord>> {
        self.with_session(uri, |s| Box::pin(registry::list(s))).await
    }

    pub async fn list_vm_ids(&self, uri: &str) -> Result<Vec<String>> {
        self.with_session(uri, |s| Box::pin(registry::list_vm_ids(s))).await
    }

    pub async fn info(&self, uri: &str, uuid: &str) -> Result<VmRecord> {
        let uuid = uuid.to_string();
        self.with_session(uri, move |s| Box::pin(async move { registry::info(s, &uuid).await }))
            .await
    }

    pub async fn console_vnc(&self, uri: &str, uuid: &str) -> Result<Option<ConsoleDescriptor>> {
        let uuid = uuid.to_string();
        self.with_session(uri, move |s| Box::pin(async move { registry::console_vnc(s, &uuid).await }))
            .await
    }

    pub async fn console_pty(&self, uri: &str, uuid: &str) -> Result<Option<ConsoleDescriptor>> {
        let uuid = uuid.to_string();
        self.with_session(uri, move |s| Box::pin(async move { registry::console_pty(s, &uuid).await }))
            .await
    }

    pub async fn interfaces(&self, uri: &str, uuid: &str) -> Result<Vec<InterfaceDescriptor>> {
        let uuid = uuid.to_string();
        self.with_session(uri, move |s| Box::pin(async move { registry::interfaces(s, &uuid).await }))
            .await
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub async fn start(&self, uri: &str, uuid: &str) -> Result<()> {
        let uuid = uuid.to_string();
        self.with_session(uri, move |s| Box::pin(async move { lifecycle::start(s, &uuid).await }))
            .await
    }

    pub async fn shutdown(&self, uri: &str, uuid: &str) -> Result<()> {
        let uuid = uuid.to_string();
        self.with_session(uri, move |s| Box::pin(async move { lifecycle::shutdown(s, &uuid).await }))
            .await
    }

    pub async fn destroy(&self, uri: &str, uuid: &str) -> Result<()> {
        let uuid = uuid.to_string();
        self.with_session(uri, move |s| Box::pin(async move { lifecycle::destroy(s, &uuid).await }))
            .await
    }

    pub async fn reboot(&self, uri: &str, uuid: &str, options: RebootOptions) -> Result<()> {
        let uuid = uuid.to_string();
        self.with_session(uri, move |s| {
            Box::pin(async move { lifecycle::reboot(s, &uuid, &options).await })
        })
        .await
    }

    pub async fn suspend(&self, uri: &str, uuid: &str) -> Result<()> {
        let uuid = uuid.to_string();
        self.with_session(uri, move |s| Box::pin(async move { lifecycle::suspend(s, &uuid).await }))
            .await
    }

    pub async fn resume(&self, uri: &str, uuid: &str) -> Result<()> {
        let uuid = uuid.to_string();
        self.with_session(uri, move |s| Box::pin(async move { lifecycle::resume(s, &uuid).await }))
            .await
    }

    pub async fn undeploy(&self, uri: &str, uuid: &str) -> Result<()> {
        let uuid = uuid.to_string();
        self.with_session(uri, move |s| Box::pin(async move { lifecycle::undeploy(s, &uuid).await }))
            .await
    }

    // =========================================================================
    // Deployment & Templates
    // =========================================================================

    /// Deploy a VM from a local template.
    #[instrument(skip(self, params))]
    pub async fn deploy(&self, uri: &str, params: TemplateSettings) -> Result<()> {
        let pipeline = self.pipeline.clone();
        self.with_session(uri, move |s| {
            Box::pin(async move { pipeline.deploy(s.hv(), &params).await })
        })
        .await
    }

    /// Templates available for the backend family behind `uri`.
    pub async fn local_templates(&self, uri: &str) -> Result<Vec<TemplateSettings>> {
        let pipeline = self.pipeline.clone();
        self.with_session(uri, move |s| {
            Box::pin(async move { pipeline.local_templates(s.family()).await })
        })
        .await
    }

    /// The configured default storage pool.
    pub fn default_pool(&self) -> Option<&str> {
        self.pipeline.default_pool()
    }

    // =========================================================================
    // Metrics & Host
    // =========================================================================

    /// Usage metrics of running containers, keyed by UUID.
    pub async fn metrics(&self, uri: &str) -> Result<BTreeMap<String, VmMetrics>> {
        let sampler = self.sampler.clone();
        self.with_session(uri, move |s| {
            Box::pin(async move { sampler.sample_all(s.hv(), s.backend()).await })
        })
        .await
    }

    /// Host memory left for new VMs, in MiB, across all allowed backends.
    #[instrument(skip(self))]
    pub async fn free_mem(&self) -> Result<i64> {
        let backends = self.backends().to_vec();
        let first = backends
            .first()
            .ok_or_else(|| VirtError::InvalidConfig("no backends configured".to_string()))?;

        let total = self
            .with_session(first, |s| {
                Box::pin(async move { Ok::<_, VirtError>(s.hv().node_info().await?.memory_kib) })
            })
            .await?;
        let mut memory = (total / 1024) as i64 - HOST_RESERVED_MIB;

        for uri in &backends {
            let used = self
                .with_session(uri, |s| {
                    Box::pin(async move {
                        let hv = s.hv();
                        let mut used_kib: u64 = 0;
                        for id in hv.list_domain_ids().await? {
                            if id == 0 {
                                continue;
                            }
                            let dom = hv.lookup_by_id(id).await?;
                            used_kib += hv.domain_info(&dom).await?.memory_kib;
                        }
                        Ok::<_, VirtError>(used_kib)
                    })
                })
                .await?;
            memory -= (used / 1024) as i64;
        }

        debug!(memory, "Computed free memory");
        Ok(memory)
    }

    /// Detect installed backends from `/dev` and make them the allow-list.
    pub fn autodetect_backends(&mut self) -> Vec<String> {
        let detected = detect_backends_in(Path::new("/dev"));
        info!(backends = ?detected, "Detected backends");
        self.connection.set_allow_list(detected.clone());
        self.options.backends = detected.clone();
        detected
    }
}

/// Backend URIs whose device nodes exist under `dev_root`.
pub fn detect_backends_in(dev_root: &Path) -> Vec<String> {
    BACKEND_DEVICES
        .iter()
        .filter(|(device, _)| dev_root.join(device).exists())
        .map(|(_, uri)| uri.to_string())
        .collect()
}
