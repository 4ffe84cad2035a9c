//! KVM (libvirt-native) deployment.
//!
//! Templates are unpacked OVF appliances. Deployment copies (or converts) the
//! template disks into the pool's image directory, renders a domain
//! definition and defines it through the open connection.

use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::error::{Result, VirtError};
use crate::shell::CommandRunner;
use crate::template::{OvfDescriptor, TemplateRepository, TemplateSettings};
use crate::traits::Hypervisor;
use crate::types::{DomainHandle, VmFamily};
use crate::xml::{DiskSpec, DomainSpec, DomainXmlBuilder, GraphicsSpec, NicSpec};

use super::fmt_number;

/// Emulator used when the configured one does not exist on the host.
pub const FALLBACK_EMULATOR: &str = "/usr/bin/kvm";

const SUPPORTED_ARCHES: [&str; 2] = ["x86_64", "i686"];

/// Built-in `ovf_defaults.kvm` entries.
pub fn default_settings() -> BTreeMap<String, String> {
    [
        ("domain_type", "kvm"),
        ("machine", "pc"),
        ("virt_type", "hvm"),
        ("boot_dev", "hd"),
        ("clock_offset", "utc"),
        ("on_poweroff", "destroy"),
        ("on_reboot", "restart"),
        ("on_crash", "restart"),
        ("emulator", FALLBACK_EMULATOR),
        ("mouse_bus", "ps2"),
        ("vm_type", "kvm"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// Device settings every KVM template starts from.
fn device_defaults() -> TemplateSettings {
    let mut st = TemplateSettings::new();
    st.set("serial", json!({"type": "pty", "target_port": 0}));
    st.set("console", json!({"type": "pty", "target_port": 0}));
    st.set(
        "graphics",
        json!({"type": "vnc", "port": -1, "autoport": "yes", "keymap": "us"}),
    );
    st.set("interfaces", json!([]));
    st.set("features", json!([]));
    st.set("disks", json!([]));
    st
}

/// Settings for deploying `ovf` on KVM.
pub fn template_settings(ovf: &OvfDescriptor, defaults: &BTreeMap<String, String>) -> Result<TemplateSettings> {
    let mut st = device_defaults();
    for (k, v) in defaults {
        st.set(k.clone(), v.clone());
    }

    let emulator = st.get_str("emulator").unwrap_or_default();
    if !Path::new(&emulator).exists() {
        st.set("emulator", FALLBACK_EMULATOR);
    }

    let system_type = ovf.system_type.as_deref().unwrap_or_default();
    let (kind, arch) = system_type.split_once('-').unwrap_or((system_type, ""));
    if kind != "kvm" {
        return Err(VirtError::Template(format!(
            "The chosen template '{}' cannot run on KVM hypervisor.",
            kind
        )));
    }
    if !SUPPORTED_ARCHES.contains(&arch) {
        return Err(VirtError::Template(format!(
            "Template architecture '{}' is not supported.",
            arch
        )));
    }
    st.set("arch", arch);

    let memory = [
        ("memory_min", ovf.memory_gb.min),
        ("memory", ovf.memory_gb.normal),
        ("memory_max", ovf.memory_gb.max),
    ];
    for (key, value) in memory {
        if let Some(gb) = value {
            st.set(key, fmt_number(gb));
        }
    }

    let vcpu = [
        ("vcpu_min", ovf.vcpu.min),
        ("vcpu", ovf.vcpu.normal),
        ("vcpu_max", ovf.vcpu.max),
    ];
    for (key, value) in vcpu {
        if let Some(count) = value {
            st.set(key, count.to_string());
        }
    }

    let interfaces: Vec<Value> = ovf
        .networks
        .iter()
        .map(|bridge| json!({"type": "bridge", "source_bridge": bridge}))
        .collect();
    st.set("interfaces", interfaces);

    let disks: Vec<Value> = ovf
        .disks
        .iter()
        .filter_map(|d| d.href.as_deref())
        .zip(b'a'..=b'z')
        .map(|(href, letter)| {
            json!({
                "template_name": href,
                "deploy_type": "file",
                "type": "file",
                "device": "disk",
                "source_file": href,
                "target_dev": format!("vd{}", letter as char),
                "target_bus": "virtio",
            })
        })
        .collect();
    st.set("disks", disks);

    st.set("features", ovf.features.clone());
    st.set("template_name", ovf.name.clone());
    st.set_default("vm_type", VmFamily::Kvm.as_str());

    Ok(st)
}

// =============================================================================
// TYPED VIEWS OF NESTED SETTINGS
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
struct TemplateDisk {
    template_name: String,
    deploy_type: String,
    #[serde(default = "default_device")]
    device: String,
    #[serde(default)]
    source_file: Option<String>,
    #[serde(default)]
    source_dev: Option<String>,
    target_dev: String,
    #[serde(default = "default_bus")]
    target_bus: String,
}

fn default_device() -> String {
    "disk".to_string()
}

fn default_bus() -> String {
    "virtio".to_string()
}

#[derive(Debug, Clone, Deserialize)]
struct TemplateInterface {
    source_bridge: String,
    #[serde(default)]
    mac_address: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct CharDevice {
    #[serde(rename = "type")]
    kind: String,
    target_port: u32,
}

#[derive(Debug, Clone, Deserialize)]
struct Graphics {
    #[serde(rename = "type")]
    kind: String,
    port: i32,
    autoport: String,
    keymap: String,
}

fn nested<T: serde::de::DeserializeOwned>(st: &TemplateSettings, key: &str) -> Result<T> {
    let value = st
        .get(key)
        .cloned()
        .ok_or_else(|| VirtError::Template(format!("setting '{}' is missing", key)))?;
    serde_json::from_value(value)
        .map_err(|e| VirtError::Template(format!("setting '{}' is malformed: {}", key, e)))
}

fn disks_of(st: &TemplateSettings) -> Result<Vec<TemplateDisk>> {
    nested(st, "disks")
}

fn source_dev(disk: &TemplateDisk) -> Result<&str> {
    disk.source_dev
        .as_deref()
        .ok_or_else(|| VirtError::Template(format!("disk '{}' has no source_dev", disk.target_dev)))
}

fn source_file(disk: &TemplateDisk) -> &str {
    disk.source_file.as_deref().unwrap_or(&disk.template_name)
}

/// Domain definition for merged deployment settings.
pub fn domain_spec(st: &TemplateSettings, images_dir: &Path) -> Result<DomainSpec> {
    let vm_type = st.get_str("vm_type").unwrap_or_else(|| VmFamily::Kvm.as_str().to_string());

    let name = match st.get_str("hostname") {
        Some(hostname) if !hostname.is_empty() => hostname,
        _ => st.require_str("template_name")?,
    };
    let uuid = st
        .get_str("uuid")
        .unwrap_or_else(|| uuid::Uuid::new_v4().hyphenated().to_string());

    let disks = disks_of(st)?
        .iter()
        .map(|disk| match disk.deploy_type.as_str() {
            "file" => Ok(DiskSpec::File {
                device: disk.device.clone(),
                source_file: images_dir
                    .join(format!("{}-{}", vm_type, source_file(disk)))
                    .to_string_lossy()
                    .into_owned(),
                target_dev: disk.target_dev.clone(),
                target_bus: disk.target_bus.clone(),
            }),
            "physical" | "lvm" => Ok(DiskSpec::Block {
                device: disk.device.clone(),
                source_dev: source_dev(disk)?.to_string(),
                target_dev: disk.target_dev.clone(),
                target_bus: disk.target_bus.clone(),
                uncached: disk.deploy_type == "physical",
            }),
            other => Err(VirtError::Template(format!("unknown disk deploy type '{}'", other))),
        })
        .collect::<Result<Vec<_>>>()?;

    let nics = nested::<Vec<TemplateInterface>>(st, "interfaces")?
        .into_iter()
        .map(|i| NicSpec {
            source_bridge: i.source_bridge,
            mac_address: i.mac_address,
        })
        .collect();

    let serial: CharDevice = nested(st, "serial")?;
    let console: CharDevice = nested(st, "console")?;
    let graphics: Graphics = nested(st, "graphics")?;

    Ok(DomainSpec {
        domain_type: st.require_str("domain_type")?,
        name,
        uuid,
        memory_kib: (st.require_f64("memory")? * 1024.0 * 1024.0) as u64,
        vcpu: st.require_u32("vcpu")?,
        arch: st.require_str("arch")?,
        machine: st.require_str("machine")?,
        virt_type: st.require_str("virt_type")?,
        boot_dev: st.require_str("boot_dev")?,
        features: nested(st, "features")?,
        clock_offset: st.require_str("clock_offset")?,
        on_poweroff: st.require_str("on_poweroff")?,
        on_reboot: st.require_str("on_reboot")?,
        on_crash: st.require_str("on_crash")?,
        emulator: st.require_str("emulator")?,
        disks,
        nics,
        serial_type: serial.kind,
        serial_port: serial.target_port,
        console_type: console.kind,
        console_port: console.target_port,
        mouse_bus: st.require_str("mouse_bus")?,
        graphics: GraphicsSpec {
            kind: graphics.kind,
            port: graphics.port,
            autoport: graphics.autoport,
            keymap: graphics.keymap,
        },
    })
}

// =============================================================================
// BACKEND
// =============================================================================

/// KVM family backend.
pub struct KvmBackend {
    runner: Arc<dyn CommandRunner>,
}

impl KvmBackend {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Copy file disks into the image directory; convert qcow2 templates
    /// onto block devices.
    #[instrument(skip(self, st, repo))]
    pub async fn prepare_file_system(
        &self,
        st: &TemplateSettings,
        repo: &TemplateRepository,
        pool: &str,
    ) -> Result<()> {
        let vm_type = st.get_str("vm_type").unwrap_or_else(|| VmFamily::Kvm.as_str().to_string());
        let images_dir = repo.images_dir(pool);
        let template_dir = repo.unpacked_dir(pool, VmFamily::Kvm);

        for disk in disks_of(st)? {
            let template_path = template_dir.join(&disk.template_name);
            match disk.deploy_type.as_str() {
                "file" => {
                    tokio::fs::create_dir_all(&images_dir).await?;
                    let target = images_dir.join(format!("{}-{}", vm_type, source_file(&disk)));
                    info!(
                        source = %template_path.display(),
                        target = %target.display(),
                        "Copying template disk"
                    );
                    tokio::fs::copy(&template_path, &target).await?;
                }
                "physical" | "lvm" => {
                    let target = source_dev(&disk)?;
                    info!(source = %template_path.display(), target = %target, "Converting template disk");
                    self.runner
                        .execute(&format!(
                            "qemu-img convert -f qcow2 -O raw {} {}",
                            template_path.display(),
                            target
                        ))
                        .await?;
                }
                other => {
                    return Err(VirtError::Template(format!("unknown disk deploy type '{}'", other)));
                }
            }
        }

        Ok(())
    }

    /// Prepare disks and define the domain.
    #[instrument(skip(self, hv, st, repo), fields(uri = %hv.uri()))]
    pub async fn provision(
        &self,
        hv: &dyn Hypervisor,
        st: &TemplateSettings,
        repo: &TemplateRepository,
        pool: &str,
    ) -> Result<DomainHandle> {
        self.prepare_file_system(st, repo, pool).await?;

        let spec = domain_spec(st, &repo.images_dir(pool))?;
        let xml = DomainXmlBuilder::new(&spec).build();
        debug!(xml = %xml, "Generated domain XML");

        let handle = hv.define_xml(&xml).await?;
        info!(name = %handle.name, uuid = %handle.uuid, "Defined KVM domain");
        Ok(handle)
    }
}
