//! Template deployment.
//!
//! ```text
//! pool -> template -> family -> descriptor -> family defaults
//!      -> caller overlay -> host adjustment -> provision
//! ```
//!
//! Deployment is not transactional: a failure while provisioning leaves
//! whatever was already created in place.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use sysinfo::{CpuRefreshKind, Disks, MemoryRefreshKind, RefreshKind, System};
use tracing::{debug, info, instrument, warn};

use crate::backend::{kvm, openvz, Backend, BackendTools};
use crate::error::{Result, VirtError};
use crate::template::{TemplateRepository, TemplateSettings};
use crate::traits::Hypervisor;
use crate::types::VmFamily;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

// =============================================================================
// HOST CAPACITY
// =============================================================================

/// Resources available to new VMs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HostResources {
    pub ram_gb: f64,
    pub cpu_count: u32,
    /// Free space on the filesystem holding the storage endpoint
    pub free_disk_gb: f64,
}

/// Source of host capacity figures.
pub trait HostCapacity: Send + Sync {
    fn resources(&self, storage: &Path) -> Result<HostResources>;
}

/// Reads capacity from the running system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemHost;

impl HostCapacity for SystemHost {
    fn resources(&self, storage: &Path) -> Result<HostResources> {
        let system = System::new_with_specifics(
            RefreshKind::new()
                .with_cpu(CpuRefreshKind::everything())
                .with_memory(MemoryRefreshKind::everything()),
        );
        let disks = Disks::new_with_refreshed_list();

        let free_disk_gb = disks
            .list()
            .iter()
            .filter(|d| storage.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
            .map(|d| d.available_space() as f64 / GIB)
            .unwrap_or_else(|| {
                warn!(path = %storage.display(), "No mounted filesystem holds the storage endpoint");
                0.0
            });

        Ok(HostResources {
            ram_gb: system.total_memory() as f64 / GIB,
            cpu_count: system.cpus().len() as u32,
            free_disk_gb,
        })
    }
}

/// Fixed capacity figures.
#[derive(Debug, Clone, Copy)]
pub struct FixedHost(pub HostResources);

impl HostCapacity for FixedHost {
    fn resources(&self, _storage: &Path) -> Result<HostResources> {
        Ok(self.0)
    }
}

// =============================================================================
// OVF DEFAULTS
// =============================================================================

/// Per-family settings applied underneath every template.
///
/// Configured entries override the built-in ones key by key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OvfDefaults {
    pub kvm: BTreeMap<String, String>,
    pub openvz: BTreeMap<String, String>,
}

impl OvfDefaults {
    pub fn for_family(&self, family: VmFamily) -> BTreeMap<String, String> {
        let (mut merged, configured) = match family {
            VmFamily::Kvm => (kvm::default_settings(), &self.kvm),
            VmFamily::OpenVz => (openvz::default_settings(), &self.openvz),
        };
        merged.extend(configured.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }
}

// =============================================================================
// PIPELINE
// =============================================================================

/// Deploys templates from the local repository.
pub struct DeploymentPipeline {
    repo: TemplateRepository,
    default_pool: Option<String>,
    ovf_defaults: OvfDefaults,
    host: Arc<dyn HostCapacity>,
    tools: BackendTools,
}

impl DeploymentPipeline {
    pub fn new(
        repo: TemplateRepository,
        default_pool: Option<String>,
        ovf_defaults: OvfDefaults,
        host: Arc<dyn HostCapacity>,
        tools: BackendTools,
    ) -> Self {
        Self {
            repo,
            default_pool,
            ovf_defaults,
            host,
            tools,
        }
    }

    pub fn repository(&self) -> &TemplateRepository {
        &self.repo
    }

    /// The configured default storage pool.
    pub fn default_pool(&self) -> Option<&str> {
        self.default_pool.as_deref()
    }

    fn require_pool(&self) -> Result<&str> {
        self.default_pool().ok_or(VirtError::NoStoragePool)
    }

    /// Family defaults for one local template.
    pub async fn template_info(&self, pool: &str, family: VmFamily, name: &str) -> Result<TemplateSettings> {
        let ovf = self.repo.load(pool, family, name).await?;
        Backend::new(family, &self.tools).template_settings(&ovf, &self.ovf_defaults.for_family(family))
    }

    /// Info maps of every template in the default pool, each tagged with
    /// `template_name`.
    pub async fn local_templates(&self, family: VmFamily) -> Result<Vec<TemplateSettings>> {
        let pool = self.require_pool()?;
        let mut templates = Vec::new();
        for name in self.repo.local_templates(pool, family).await? {
            let mut info = self.template_info(pool, family, &name).await?;
            info.set("template_name", name);
            templates.push(info);
        }
        Ok(templates)
    }

    /// Deploy a VM described by caller `params`.
    #[instrument(skip(self, hv, params), fields(uri = %hv.uri()))]
    pub async fn deploy(&self, hv: &dyn Hypervisor, params: &TemplateSettings) -> Result<()> {
        let pool = self.require_pool()?;

        let template = params.get_str("template_name").unwrap_or_default();
        if template.is_empty() {
            let shown = if params.contains("template_name") { template } else { "None".to_string() };
            warn!(template = %shown, "Refusing to deploy without a template");
            return Err(VirtError::NoTemplate(shown));
        }

        let vm_type = params.get_str("vm_type").unwrap_or_else(|| "None".to_string());
        let family = VmFamily::from_vm_type(&vm_type)?;
        let backend = Backend::new(family, &self.tools);

        let ovf = self.repo.load(pool, family, &template).await?;
        let mut settings = backend.template_settings(&ovf, &self.ovf_defaults.for_family(family))?;
        settings.overlay(params);

        let host = self.host.resources(self.repo.endpoint())?;
        debug!(?host, "Host capacity");
        let errors = backend.adjust_to_host(&mut settings, &host);
        if !errors.is_empty() {
            warn!(?errors, "Template does not fit the host");
            return Err(VirtError::ResourceAdjustment(errors));
        }

        info!(template = %template, family = %family, pool = %pool, "Deploying template");
        backend.provision(hv, &settings, &self.repo, pool).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::SimulatedHypervisor;
    use crate::shell::ScriptedRunner;
    use tempfile::TempDir;

    fn pipeline(endpoint: &Path, pool: Option<&str>, host: HostResources) -> DeploymentPipeline {
        DeploymentPipeline::new(
            TemplateRepository::new(endpoint),
            pool.map(str::to_string),
            OvfDefaults::default(),
            Arc::new(FixedHost(host)),
            BackendTools::new(Arc::new(ScriptedRunner::new()), endpoint.join("cache")),
        )
    }

    fn small_host() -> HostResources {
        HostResources {
            ram_gb: 2.0,
            cpu_count: 1,
            free_disk_gb: 100.0,
        }
    }

    #[tokio::test]
    async fn test_deploy_requires_pool() {
        let tmp = TempDir::new().unwrap();
        let hv = SimulatedHypervisor::default_node().unwrap();
        let err = pipeline(tmp.path(), None, small_host())
            .deploy(&hv, &TemplateSettings::from_pairs([("template_name", "centos")]))
            .await
            .unwrap_err();
        assert!(matches!(err, VirtError::NoStoragePool));
    }

    #[tokio::test]
    async fn test_deploy_without_template_touches_nothing() {
        let tmp = TempDir::new().unwrap();
        let hv = SimulatedHypervisor::default_node().unwrap();
        let p = pipeline(tmp.path(), Some("local"), small_host());

        let err = p
            .deploy(&hv, &TemplateSettings::from_pairs([("template_name", ""), ("vm_type", "kvm")]))
            .await
            .unwrap_err();
        assert!(matches!(err, VirtError::NoTemplate(ref t) if t.is_empty()));

        let err = p
            .deploy(&hv, &TemplateSettings::from_pairs([("vm_type", "kvm")]))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Cannot deploy because template is 'None'");

        assert!(hv.calls().is_empty());
    }

    #[tokio::test]
    async fn test_deploy_rejects_unknown_vm_type() {
        let tmp = TempDir::new().unwrap();
        let hv = SimulatedHypervisor::default_node().unwrap();
        let err = pipeline(tmp.path(), Some("local"), small_host())
            .deploy(&hv, &TemplateSettings::from_pairs([("template_name", "x"), ("vm_type", "lxc")]))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "VM type 'lxc' is not (yet) supported");
    }

    #[test]
    fn test_ovf_defaults_from_yaml() {
        let defaults: OvfDefaults = serde_yaml::from_str("kvm:\n  machine: q35\n").unwrap();
        let kvm = defaults.for_family(VmFamily::Kvm);
        assert_eq!(kvm.get("machine").map(String::as_str), Some("q35"));
        assert_eq!(kvm.get("virt_type").map(String::as_str), Some("hvm"));
        assert_eq!(defaults.for_family(VmFamily::OpenVz), openvz::default_settings());
    }

    #[test]
    fn test_system_host_reports_cpus() {
        let host = SystemHost.resources(Path::new("/")).unwrap();
        assert!(host.cpu_count >= 1);
        assert!(host.ram_gb > 0.0);
    }
}
