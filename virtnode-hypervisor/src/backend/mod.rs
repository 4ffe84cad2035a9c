//! Backend families.
//!
//! A connection is served by exactly one [`Backend`] variant, chosen from the
//! driver type the hypervisor reports. Each variant supplies the
//! family-specific parts of rendering, lifecycle and deployment:
//!
//! - [`KvmBackend`]: libvirt-native domains (QEMU/KVM, Xen, test driver)
//! - [`OpenVzBackend`]: OpenVZ containers, partly driven through `vzctl`

pub mod kvm;
pub mod openvz;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::deploy::HostResources;
use crate::error::Result;
use crate::probe::{GuestProbe, VzProbe};
use crate::shell::{CommandRunner, ShellRunner};
use crate::template::{OvfDescriptor, TemplateRepository, TemplateSettings};
use crate::traits::Hypervisor;
use crate::types::{DomainHandle, VmFamily, VmState};

pub use kvm::KvmBackend;
pub use openvz::OpenVzBackend;

/// Host-side collaborators shared by the backends.
#[derive(Clone)]
pub struct BackendTools {
    pub runner: Arc<dyn CommandRunner>,
    pub probe: Arc<dyn GuestProbe>,
    /// OpenVZ template cache (`/vz/template/cache`)
    pub template_cache: PathBuf,
}

impl BackendTools {
    pub fn new(runner: Arc<dyn CommandRunner>, template_cache: impl Into<PathBuf>) -> Self {
        Self {
            probe: Arc::new(VzProbe::new(runner.clone())),
            runner,
            template_cache: template_cache.into(),
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn GuestProbe>) -> Self {
        self.probe = probe;
        self
    }
}

impl Default for BackendTools {
    fn default() -> Self {
        Self::new(Arc::new(ShellRunner::new()), openvz::DEFAULT_TEMPLATE_CACHE)
    }
}

/// The backend serving one connection.
pub enum Backend {
    Kvm(KvmBackend),
    OpenVz(OpenVzBackend),
}

impl Backend {
    pub fn new(family: VmFamily, tools: &BackendTools) -> Self {
        match family {
            VmFamily::Kvm => Backend::Kvm(KvmBackend::new(tools.runner.clone())),
            VmFamily::OpenVz => Backend::OpenVz(OpenVzBackend::new(
                tools.runner.clone(),
                tools.probe.clone(),
                tools.template_cache.clone(),
            )),
        }
    }

    pub fn family(&self) -> VmFamily {
        match self {
            Backend::Kvm(_) => VmFamily::Kvm,
            Backend::OpenVz(_) => VmFamily::OpenVz,
        }
    }

    // =========================================================================
    // Enumeration & Rendering
    // =========================================================================

    /// Ids of running domains.
    pub async fn running_ids(&self, hv: &dyn Hypervisor) -> Result<Vec<u32>> {
        match self {
            Backend::Kvm(_) => Ok(hv.list_domain_ids().await?),
            Backend::OpenVz(b) => b.running_ids(hv).await,
        }
    }

    /// Name shown to callers.
    pub async fn display_name(&self, dom: &DomainHandle) -> Result<String> {
        match self {
            Backend::Kvm(_) => Ok(dom.name.clone()),
            Backend::OpenVz(b) => b.hostname(&dom.name).await,
        }
    }

    pub async fn template_name(&self, dom: &DomainHandle) -> Result<Option<String>> {
        match self {
            Backend::Kvm(_) => Ok(None),
            Backend::OpenVz(b) => b.template_name(&dom.name).await.map(Some),
        }
    }

    /// Memory in MiB. libvirt exposes no usable figure for KVM here, so it
    /// reports 0.
    pub async fn memory_mib(&self, dom: &DomainHandle) -> Result<f64> {
        match self {
            Backend::Kvm(_) => Ok(0.0),
            Backend::OpenVz(b) => b.memory_mib(&dom.name).await,
        }
    }

    pub async fn swap_mib(&self, dom: &DomainHandle) -> Result<f64> {
        match self {
            Backend::Kvm(_) => Ok(0.0),
            Backend::OpenVz(b) => b.swap_mib(&dom.name).await,
        }
    }

    /// Uptime in seconds; `None` unless the VM is active.
    pub async fn uptime_secs(&self, dom: &DomainHandle, state: VmState) -> Result<Option<f64>> {
        if state != VmState::Active {
            return Ok(None);
        }
        match self {
            Backend::Kvm(_) => Ok(Some(0.0)),
            Backend::OpenVz(b) => b.uptime_secs(&dom.name).await.map(Some),
        }
    }

    /// Mount point to size in MiB.
    pub async fn diskspace(&self, dom: &DomainHandle) -> Result<BTreeMap<String, f64>> {
        let root = match self {
            Backend::Kvm(_) => 0.0,
            Backend::OpenVz(b) => b.diskspace_mib(&dom.name).await?,
        };
        Ok(BTreeMap::from([("/".to_string(), root)]))
    }

    /// Backend-local id used for the native console fallback.
    pub fn native_console_id<'a>(&self, dom: &'a DomainHandle) -> Option<&'a str> {
        match self {
            Backend::Kvm(_) => None,
            Backend::OpenVz(_) => Some(dom.name.as_str()),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Graceful shutdown. The libvirt OpenVZ driver's shutdown is unreliable,
    /// so containers are stopped with `vzctl stop`.
    pub async fn shutdown(&self, hv: &dyn Hypervisor, dom: &DomainHandle) -> Result<()> {
        match self {
            Backend::Kvm(_) => Ok(hv.shutdown(dom).await?),
            Backend::OpenVz(b) => b.stop(&dom.name).await,
        }
    }

    // =========================================================================
    // Deployment
    // =========================================================================

    /// Family defaults seeded from a template descriptor.
    pub fn template_settings(
        &self,
        ovf: &OvfDescriptor,
        defaults: &BTreeMap<String, String>,
    ) -> Result<TemplateSettings> {
        match self {
            Backend::Kvm(_) => kvm::template_settings(ovf, defaults),
            Backend::OpenVz(_) => openvz::template_settings(ovf, defaults),
        }
    }

    /// Clamp requested resources to the host. Returns every violated
    /// minimum.
    pub fn adjust_to_host(&self, settings: &mut TemplateSettings, host: &HostResources) -> Vec<String> {
        let mut errors = adjust_memory_and_vcpu(settings, host);
        if let Backend::OpenVz(_) = self {
            errors.extend(openvz::adjust_disk(settings, host));
        }
        errors
    }

    /// Create the VM from fully merged settings.
    pub async fn provision(
        &self,
        hv: &dyn Hypervisor,
        settings: &TemplateSettings,
        repo: &TemplateRepository,
        pool: &str,
    ) -> Result<()> {
        match self {
            Backend::Kvm(b) => b.provision(hv, settings, repo, pool).await.map(|_| ()),
            Backend::OpenVz(b) => b.provision(settings, repo, pool).await.map(|_| ()),
        }
    }
}

/// Render a number the way settings store it.
pub(crate) fn fmt_number(value: f64) -> String {
    format!("{}", value)
}

/// Shared memory/vCPU clamping.
///
/// Maximums are lowered to what the host offers and the requested amounts to
/// the maximums. Minimums are never adjusted: a minimum above the adjusted
/// maximum is an error.
pub(crate) fn adjust_memory_and_vcpu(st: &mut TemplateSettings, host: &HostResources) -> Vec<String> {
    let mut errors = Vec::new();

    let memory_max = st.get_f64("memory_max").unwrap_or(f64::INFINITY).min(host.ram_gb);
    st.set("memory_max", fmt_number(memory_max));
    match st.get_f64("memory") {
        Some(memory) => st.set("memory", fmt_number(memory.min(memory_max))),
        None => errors.push("Required setting 'memory' is missing".to_string()),
    }

    let vcpu_max = st.get_u32("vcpu_max").unwrap_or(u32::MAX).min(host.cpu_count);
    st.set("vcpu_max", vcpu_max.to_string());
    match st.get_u32("vcpu") {
        Some(vcpu) => st.set("vcpu", vcpu.min(vcpu_max).to_string()),
        None => errors.push("Required setting 'vcpu' is missing".to_string()),
    }

    if let Some(memory_min) = st.get_f64("memory_min") {
        if memory_min > memory_max {
            errors.push(format!(
                "Minimum required memory {}GB exceeds total available memory {}GB",
                fmt_number(memory_min),
                fmt_number(memory_max)
            ));
        }
    }
    if let Some(vcpu_min) = st.get_u32("vcpu_min") {
        if vcpu_min > vcpu_max {
            errors.push(format!(
                "Minimum required number of vcpus {} exceeds available number {}.",
                vcpu_min, vcpu_max
            ));
        }
    }

    errors
}
