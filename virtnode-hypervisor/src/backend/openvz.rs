//! OpenVZ containers.
//!
//! The libvirt OpenVZ driver only covers enumeration and basic lifecycle.
//! Everything else (container properties, stop, deployment) goes through
//! `vzlist` and `vzctl`.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::deploy::HostResources;
use crate::error::{Result, VirtError};
use crate::probe::GuestProbe;
use crate::shell::CommandRunner;
use crate::template::{OvfDescriptor, TemplateRepository, TemplateSettings};
use crate::traits::Hypervisor;
use crate::types::VmFamily;

use super::fmt_number;

/// Where `vzctl create` looks for OS template archives.
pub const DEFAULT_TEMPLATE_CACHE: &str = "/vz/template/cache";

/// Lowest container id handed out by deployment.
pub const FIRST_CTID: u32 = 101;

/// Prints `missing` when the container tooling cannot run.
const TOOLING_GUARD: &str = "vzlist -H > /dev/null 2>&1; if [  $? -eq 1 ]; then echo missing; fi";

/// Built-in `ovf_defaults.openvz` entries.
pub fn default_settings() -> BTreeMap<String, String> {
    [
        ("vm_type", "openvz"),
        ("swap", "0.5"),
        ("nameserver", "8.8.8.8"),
        ("start_vm", "no"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// Settings for deploying `ovf` as a container.
pub fn template_settings(ovf: &OvfDescriptor, defaults: &BTreeMap<String, String>) -> Result<TemplateSettings> {
    if ovf.system_type.as_deref() != Some("openvz") {
        return Err(VirtError::Template(format!(
            "The chosen template '{}' cannot run on OpenVZ.",
            ovf.system_type.as_deref().unwrap_or_default()
        )));
    }

    let mut st = TemplateSettings::new();
    for (k, v) in defaults {
        st.set(k.clone(), v.clone());
    }

    let numeric = [
        ("memory_min", ovf.memory_gb.min),
        ("memory", ovf.memory_gb.normal),
        ("memory_max", ovf.memory_gb.max),
        ("vcpu_min", ovf.vcpu.min.map(f64::from)),
        ("vcpu", ovf.vcpu.normal.map(f64::from)),
        ("vcpu_max", ovf.vcpu.max.map(f64::from)),
        ("disk", ovf.disks.first().and_then(|d| d.capacity_gb)),
    ];
    for (key, value) in numeric {
        if let Some(value) = value {
            st.set(key, fmt_number(value));
        }
    }

    st.set("template_name", ovf.name.clone());
    st.set("ostemplate", ovf.name.clone());
    st.set_default("vm_type", VmFamily::OpenVz.as_str());

    Ok(st)
}

/// Bound the requested disk by free space on the storage endpoint.
pub(crate) fn adjust_disk(st: &mut TemplateSettings, host: &HostResources) -> Vec<String> {
    let mut errors = Vec::new();

    let disk_max = st.get_f64("disk_max").unwrap_or(f64::INFINITY).min(host.free_disk_gb);
    st.set("disk_max", fmt_number(disk_max));
    if let Some(disk) = st.get_f64("disk") {
        st.set("disk", fmt_number(disk.min(disk_max)));
    }

    if let Some(disk_min) = st.get_f64("disk_min") {
        if disk_min > disk_max {
            errors.push(format!(
                "Minimum required disk space {}GB exceeds available disk space {}GB",
                fmt_number(disk_min),
                fmt_number(disk_max)
            ));
        }
    }

    errors
}

/// Quote a value for `sh`.
fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r#"'\''"#))
}

fn is_yes(value: Option<String>) -> bool {
    matches!(value.as_deref(), Some("yes" | "true" | "1"))
}

/// Convert a `vzlist` page count to MiB. Unlimited reads as 0.
fn pages_to_mib(field: &str, raw: &str) -> Result<f64> {
    if raw == "unlimited" {
        return Ok(0.0);
    }
    let pages: u64 = raw
        .parse()
        .map_err(|_| VirtError::Probe(format!("vzlist {}: '{}' is not a number", field, raw)))?;
    if pages >= i64::MAX as u64 {
        return Ok(0.0);
    }
    Ok(pages as f64 * 4.0 / 1024.0)
}

/// OpenVZ family backend.
pub struct OpenVzBackend {
    runner: Arc<dyn CommandRunner>,
    probe: Arc<dyn GuestProbe>,
    template_cache: PathBuf,
}

impl OpenVzBackend {
    pub fn new(runner: Arc<dyn CommandRunner>, probe: Arc<dyn GuestProbe>, template_cache: PathBuf) -> Self {
        Self {
            runner,
            probe,
            template_cache,
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    async fn vzlist_field(&self, field: &str, ctid: &str) -> Result<String> {
        let out = self
            .runner
            .execute(&format!("vzlist -H -a -o {} {}", field, ctid))
            .await?;
        Ok(out.trim().to_string())
    }

    /// Running container ids, or none when the tooling is unusable.
    pub async fn running_ids(&self, hv: &dyn Hypervisor) -> Result<Vec<u32>> {
        if self.runner.execute(TOOLING_GUARD).await? == "missing" {
            warn!("vzlist is unavailable, reporting no running containers");
            return Ok(Vec::new());
        }
        Ok(hv.list_domain_ids().await?)
    }

    /// Container hostname, or the container id when none is set.
    pub async fn hostname(&self, ctid: &str) -> Result<String> {
        let hostname = self.vzlist_field("hostname", ctid).await?;
        if hostname.is_empty() || hostname == "-" {
            return Ok(ctid.to_string());
        }
        Ok(hostname)
    }

    pub async fn template_name(&self, ctid: &str) -> Result<String> {
        self.vzlist_field("ostemplate", ctid).await
    }

    pub async fn memory_mib(&self, ctid: &str) -> Result<f64> {
        pages_to_mib("physpages.l", &self.vzlist_field("physpages.l", ctid).await?)
    }

    pub async fn swap_mib(&self, ctid: &str) -> Result<f64> {
        pages_to_mib("swappages.l", &self.vzlist_field("swappages.l", ctid).await?)
    }

    /// Disk quota hard limit in MiB.
    pub async fn diskspace_mib(&self, ctid: &str) -> Result<f64> {
        let raw = self.vzlist_field("diskspace.h", ctid).await?;
        let kib: f64 = raw
            .parse()
            .map_err(|_| VirtError::Probe(format!("vzlist diskspace.h: '{}' is not a number", raw)))?;
        Ok(kib / 1024.0)
    }

    pub async fn uptime_secs(&self, ctid: &str) -> Result<f64> {
        self.probe.uptime_secs(ctid).await
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    #[instrument(skip(self))]
    pub async fn stop(&self, ctid: &str) -> Result<()> {
        info!(ctid = %ctid, "Stopping container");
        self.runner.execute(&format!("vzctl stop {}", ctid)).await?;
        Ok(())
    }

    // =========================================================================
    // Deployment
    // =========================================================================

    /// Next free container id.
    pub async fn next_ctid(&self) -> Result<u32> {
        let listing = match self.runner.execute("vzlist -H -a -o ctid").await {
            Ok(out) => out,
            // vzlist exits 1 when there are no containers
            Err(VirtError::Command { status: Some(1), .. }) => String::new(),
            Err(e) => return Err(e),
        };

        let highest = listing
            .lines()
            .filter_map(|l| l.trim().parse::<u32>().ok())
            .max();

        Ok(highest.map_or(FIRST_CTID, |id| (id + 1).max(FIRST_CTID)))
    }

    /// Copy the template archive into the `vzctl` template cache.
    async fn stage_template(&self, repo: &TemplateRepository, pool: &str, name: &str) -> Result<()> {
        let archive = format!("{}.tar.gz", name);
        let cached = self.template_cache.join(&archive);
        if tokio::fs::try_exists(&cached).await? {
            debug!(path = %cached.display(), "Template already cached");
            return Ok(());
        }

        let source = repo.unpacked_dir(pool, VmFamily::OpenVz).join(&archive);
        tokio::fs::create_dir_all(&self.template_cache).await?;
        tokio::fs::copy(&source, &cached).await.map_err(|e| {
            VirtError::Template(format!("cannot stage {}: {}", source.display(), e))
        })?;
        info!(source = %source.display(), target = %cached.display(), "Staged OpenVZ template");
        Ok(())
    }

    /// Create and configure a container. Returns its id.
    #[instrument(skip(self, st, repo))]
    pub async fn provision(&self, st: &TemplateSettings, repo: &TemplateRepository, pool: &str) -> Result<String> {
        let ostemplate = st.require_str("ostemplate")?;
        self.stage_template(repo, pool, &ostemplate).await?;

        let ctid = match st.get_u32("ctid") {
            Some(ctid) => ctid,
            None => self.next_ctid().await?,
        };

        self.runner
            .execute(&format!("vzctl create {} --ostemplate {}", ctid, quote(&ostemplate)))
            .await?;

        let mut set = format!("vzctl set {}", ctid);
        if let Some(hostname) = st.get_str("hostname").filter(|h| !h.is_empty()) {
            set.push_str(&format!(" --hostname {}", quote(&hostname)));
        }
        set.push_str(&format!(" --ram {}G", fmt_number(st.require_f64("memory")?)));
        if let Some(swap) = st.get_f64("swap") {
            set.push_str(&format!(" --swap {}G", fmt_number(swap)));
        }
        set.push_str(&format!(" --cpus {}", st.require_u32("vcpu")?));
        if let Some(disk) = st.get_f64("disk") {
            set.push_str(&format!(" --diskspace {}G", fmt_number(disk)));
        }
        if let Some(ip) = st.get_str("ip_address").filter(|ip| !ip.is_empty()) {
            set.push_str(&format!(" --ipadd {}", quote(&ip)));
        }
        if let Some(ns) = st.get_str("nameserver").filter(|ns| !ns.is_empty()) {
            set.push_str(&format!(" --nameserver {}", quote(&ns)));
        }
        set.push_str(" --save");
        self.runner.execute(&set).await?;

        if is_yes(st.get_str("start_vm")) {
            self.runner.execute(&format!("vzctl start {}", ctid)).await?;
        }

        info!(ctid = ctid, template = %ostemplate, "Created OpenVZ container");
        Ok(ctid.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::VzProbe;
    use crate::shell::ScriptedRunner;
    use crate::template::{Bounds, OvfDisk};
    use tempfile::TempDir;

    fn backend(runner: Arc<ScriptedRunner>, cache: PathBuf) -> OpenVzBackend {
        OpenVzBackend::new(runner.clone(), Arc::new(VzProbe::new(runner)), cache)
    }

    fn descriptor() -> OvfDescriptor {
        OvfDescriptor {
            name: "debian-7".to_string(),
            system_type: Some("openvz".to_string()),
            vcpu: Bounds { min: Some(1), normal: Some(1), max: None },
            memory_gb: Bounds { min: Some(0.25), normal: Some(0.5), max: None },
            networks: vec![],
            disks: vec![OvfDisk {
                disk_id: "vmdisk1".to_string(),
                href: Some("debian-7.tar.gz".to_string()),
                capacity_gb: Some(10.0),
                format: None,
            }],
            features: vec![],
        }
    }

    #[test]
    fn test_template_settings() {
        let st = template_settings(&descriptor(), &default_settings()).unwrap();
        assert_eq!(st.get_f64("memory"), Some(0.5));
        assert_eq!(st.get_u32("vcpu"), Some(1));
        assert_eq!(st.get_f64("disk"), Some(10.0));
        assert_eq!(st.get_str("ostemplate").as_deref(), Some("debian-7"));
        assert_eq!(st.get_str("vm_type").as_deref(), Some("openvz"));

        let mut kvm = descriptor();
        kvm.system_type = Some("kvm-x86_64".to_string());
        assert!(template_settings(&kvm, &default_settings()).is_err());
    }

    #[test]
    fn test_adjust_disk() {
        let host = HostResources {
            ram_gb: 8.0,
            cpu_count: 4,
            free_disk_gb: 5.0,
        };
        let mut st = TemplateSettings::from_pairs([("disk", "10"), ("disk_min", "8")]);
        let errors = adjust_disk(&mut st, &host);

        assert_eq!(st.get_f64("disk"), Some(5.0));
        assert_eq!(
            errors,
            vec!["Minimum required disk space 8GB exceeds available disk space 5GB".to_string()]
        );
    }

    #[test]
    fn test_pages_to_mib() {
        assert_eq!(pages_to_mib("physpages.l", "262144").unwrap(), 1024.0);
        assert_eq!(pages_to_mib("physpages.l", "unlimited").unwrap(), 0.0);
        assert_eq!(pages_to_mib("physpages.l", "9223372036854775807").unwrap(), 0.0);
        assert!(pages_to_mib("physpages.l", "lots").is_err());
    }

    #[test]
    fn test_quote() {
        assert_eq!(quote("web"), "'web'");
        assert_eq!(quote("it's"), r#"'it'\''s'"#);
    }

    #[tokio::test]
    async fn test_container_queries() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .respond("-o hostname 101", "web01")
                .respond("-o hostname 102", "-")
                .respond("-o ostemplate", "debian-7")
                .respond("-o physpages.l", "131072")
                .respond("-o diskspace.h", "10485760"),
        );
        let b = backend(runner, PathBuf::from("/unused"));

        assert_eq!(b.hostname("101").await.unwrap(), "web01");
        assert_eq!(b.hostname("102").await.unwrap(), "102");
        assert_eq!(b.template_name("101").await.unwrap(), "debian-7");
        assert_eq!(b.memory_mib("101").await.unwrap(), 512.0);
        assert_eq!(b.diskspace_mib("101").await.unwrap(), 10240.0);
    }

    #[tokio::test]
    async fn test_next_ctid() {
        let runner = Arc::new(ScriptedRunner::new().respond("vzlist -H -a -o ctid", "101\n  105\n102"));
        assert_eq!(backend(runner, PathBuf::new()).next_ctid().await.unwrap(), 106);

        let runner = Arc::new(ScriptedRunner::new().fail("vzlist -H -a -o ctid", 1, "Container(s) not found"));
        assert_eq!(backend(runner, PathBuf::new()).next_ctid().await.unwrap(), FIRST_CTID);
    }

    #[tokio::test]
    async fn test_provision_stages_and_creates() {
        let tmp = TempDir::new().unwrap();
        let repo = TemplateRepository::new(tmp.path().join("storage"));
        let unpacked = repo.unpacked_dir("local", VmFamily::OpenVz);
        std::fs::create_dir_all(&unpacked).unwrap();
        std::fs::write(unpacked.join("debian-7.tar.gz"), b"archive").unwrap();

        let runner = Arc::new(
            ScriptedRunner::new()
                .respond("vzlist -H -a -o ctid", "101")
                .respond("vzctl create", "")
                .respond("vzctl set", ""),
        );
        let cache = tmp.path().join("cache");
        let b = backend(runner.clone(), cache.clone());

        let mut st = template_settings(&descriptor(), &default_settings()).unwrap();
        st.set("hostname", "web01");
        st.set("ip_address", "10.0.0.5");

        let ctid = b.provision(&st, &repo, "local").await.unwrap();
        assert_eq!(ctid, "102");
        assert!(cache.join("debian-7.tar.gz").exists());
        assert_eq!(
            runner.executed(),
            vec![
                "vzlist -H -a -o ctid".to_string(),
                "vzctl create 102 --ostemplate 'debian-7'".to_string(),
                "vzctl set 102 --hostname 'web01' --ram 0.5G --swap 0.5G --cpus 1 --diskspace 10G \
                 --ipadd '10.0.0.5' --nameserver '8.8.8.8' --save"
                    .to_string(),
            ]
        );
    }
}
