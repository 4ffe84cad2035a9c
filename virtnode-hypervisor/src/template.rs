//! Templates: settings maps, OVF descriptors and the local repository.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};

use crate::error::{Result, VirtError};
use crate::types::VmFamily;
use crate::xml::XmlElement;

// =============================================================================
// TEMPLATE SETTINGS
// =============================================================================

/// Setting name to value map describing a VM to deploy.
///
/// Scalar settings are usually strings (as supplied on the command line or
/// in configuration) but numbers are accepted anywhere a number is read.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TemplateSettings(Map<String, Value>);

impl TemplateSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from string pairs, e.g. deploy parameters.
    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        let mut settings = Self::new();
        for (k, v) in pairs {
            settings.set(k, Value::String(v.into()));
        }
        settings
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Set `key` only if it is not present yet.
    pub fn set_default(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.entry(key.into()).or_insert_with(|| value.into());
    }

    /// A scalar setting rendered as a string.
    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.0.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        match self.0.get(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn get_u32(&self, key: &str) -> Option<u32> {
        match self.0.get(key)? {
            Value::Number(n) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// A required string setting.
    pub fn require_str(&self, key: &str) -> Result<String> {
        self.get_str(key)
            .ok_or_else(|| VirtError::Template(format!("setting '{}' is missing", key)))
    }

    /// A required numeric setting.
    pub fn require_f64(&self, key: &str) -> Result<f64> {
        self.get_f64(key)
            .ok_or_else(|| VirtError::Template(format!("setting '{}' is missing or not a number", key)))
    }

    /// A required integer setting.
    pub fn require_u32(&self, key: &str) -> Result<u32> {
        self.get_u32(key)
            .ok_or_else(|| VirtError::Template(format!("setting '{}' is missing or not an integer", key)))
    }

    /// Copy every entry of `other` over this map. `other` wins on conflict.
    pub fn overlay(&mut self, other: &TemplateSettings) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }

    /// Seed string defaults (from configuration) without overriding.
    pub fn apply_defaults(&mut self, defaults: &BTreeMap<String, String>) {
        for (k, v) in defaults {
            self.set_default(k.clone(), v.clone());
        }
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}

// =============================================================================
// OVF DESCRIPTORS
// =============================================================================

/// DMTF CIM resource types used in virtual hardware sections.
const RESOURCE_CPU: &str = "3";
const RESOURCE_MEMORY: &str = "4";
const RESOURCE_ETHERNET: &str = "10";

/// Min/normal/max allocation of one resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Bounds<T> {
    pub min: Option<T>,
    pub normal: Option<T>,
    pub max: Option<T>,
}

impl<T> Bounds<T> {
    fn set(&mut self, bound: &str, value: T) {
        let slot = match bound {
            "min" => &mut self.min,
            "max" => &mut self.max,
            _ => &mut self.normal,
        };
        if slot.is_none() {
            *slot = Some(value);
        }
    }
}

/// A disk referenced by an OVF descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OvfDisk {
    pub disk_id: String,
    /// File name of the image, resolved through the References section
    pub href: Option<String>,
    /// Capacity in GB, when the descriptor states it
    pub capacity_gb: Option<f64>,
    pub format: Option<String>,
}

/// The parts of an OVF descriptor needed to deploy a template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OvfDescriptor {
    /// Template name (the descriptor's file stem)
    pub name: String,
    /// `VirtualSystemType`, e.g. `kvm-x86_64` or `openvz`
    pub system_type: Option<String>,
    pub vcpu: Bounds<u32>,
    pub memory_gb: Bounds<f64>,
    /// Bridges the template's network adapters connect to
    pub networks: Vec<String>,
    pub disks: Vec<OvfDisk>,
    /// Hypervisor features from the OpenNode section
    pub features: Vec<String>,
}

impl OvfDescriptor {
    /// Load a descriptor from disk.
    pub async fn load(path: &Path) -> Result<Self> {
        let xml = tokio::fs::read_to_string(path).await.map_err(|e| {
            VirtError::Template(format!("cannot read {}: {}", path.display(), e))
        })?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self::parse(&name, &xml)
    }

    /// Parse descriptor XML.
    pub fn parse(name: &str, xml: &str) -> Result<Self> {
        let root = XmlElement::parse(xml)?;

        let system_type = root
            .descendants_local("VirtualSystemType")
            .first()
            .map(|e| e.text.trim().to_string());

        let mut vcpu: Bounds<u32> = Bounds::default();
        let mut memory_gb: Bounds<f64> = Bounds::default();
        let mut networks = Vec::new();

        for item in root.descendants_local("Item") {
            let bound = item.attr_local("bound").unwrap_or("normal");
            let resource_type = item.child_local("ResourceType").map(|e| e.text.trim());
            let quantity = item.child_local("VirtualQuantity").map(|e| e.text.trim());

            match (resource_type, quantity) {
                (Some(RESOURCE_CPU), Some(quantity)) => {
                    let count: u32 = quantity.parse().map_err(|_| {
                        VirtError::Template(format!("invalid vcpu quantity '{}'", quantity))
                    })?;
                    vcpu.set(bound, count);
                }
                (Some(RESOURCE_MEMORY), Some(quantity)) => {
                    let units = item
                        .child_local("AllocationUnits")
                        .map(|e| e.text.trim())
                        .unwrap_or("byte * 2^20");
                    let amount: f64 = quantity.parse().map_err(|_| {
                        VirtError::Template(format!("invalid memory quantity '{}'", quantity))
                    })?;
                    memory_gb.set(bound, amount * allocation_units_bytes(units)? / GIB);
                }
                (Some(RESOURCE_ETHERNET), _) => {
                    if let Some(connection) = item.child_local("Connection") {
                        if !connection.text.trim().is_empty() {
                            networks.push(connection.text.trim().to_string());
                        }
                    }
                }
                _ => {}
            }
        }

        if networks.is_empty() {
            networks = root
                .descendants_local("Network")
                .into_iter()
                .filter_map(|n| n.attr_local("name"))
                .map(str::to_string)
                .collect();
        }

        let files: BTreeMap<&str, &str> = root
            .descendants_local("File")
            .into_iter()
            .filter_map(|f| Some((f.attr_local("id")?, f.attr_local("href")?)))
            .collect();

        let mut disks = Vec::new();
        for disk in root.descendants_local("Disk") {
            let capacity_gb = match disk.attr_local("capacity") {
                Some(capacity) => {
                    let units = disk.attr_local("capacityAllocUnits").unwrap_or("byte");
                    let amount: f64 = capacity.parse().map_err(|_| {
                        VirtError::Template(format!("invalid disk capacity '{}'", capacity))
                    })?;
                    Some(amount * allocation_units_bytes(units)? / GIB)
                }
                None => None,
            };

            disks.push(OvfDisk {
                disk_id: disk.attr_local("diskId").unwrap_or_default().to_string(),
                href: disk
                    .attr_local("fileRef")
                    .and_then(|r| files.get(r))
                    .map(|h| h.to_string()),
                capacity_gb,
                format: disk.attr_local("format").map(str::to_string),
            });
        }

        let features = root
            .descendants_local("OpenNodeSection")
            .first()
            .and_then(|section| section.child_local("Features"))
            .map(|f| f.children.iter().map(|c| c.local_name().to_string()).collect())
            .unwrap_or_default();

        Ok(Self {
            name: name.to_string(),
            system_type,
            vcpu,
            memory_gb,
            networks,
            disks,
            features,
        })
    }
}

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Bytes per unit of a DMTF allocation unit string.
///
/// Accepts the programmatic form (`byte * 2^20`, `bit * 2^30`) and the
/// deprecated qualifier form (`MegaBytes`, `GigaBits`).
pub fn allocation_units_bytes(units: &str) -> Result<f64> {
    let incompatible = || VirtError::Template(format!("incompatible allocation units '{}'", units));
    let compact: String = units.chars().filter(|c| !c.is_whitespace()).collect();

    if compact.starts_with("byte") || compact.starts_with("bit") {
        let mut terms = compact.split('*');
        let base = match terms.next() {
            Some("byte") => 1.0,
            Some("bit") => 1.0 / 8.0,
            _ => return Err(incompatible()),
        };

        let mut factor = base;
        for term in terms {
            let value = match term.split_once('^') {
                Some((b, e)) => {
                    let b: f64 = b.parse().map_err(|_| incompatible())?;
                    let e: i32 = e.parse().map_err(|_| incompatible())?;
                    b.powi(e)
                }
                None => term.parse().map_err(|_| incompatible())?,
            };
            factor *= value;
        }
        return Ok(factor);
    }

    let scale = if compact.starts_with("Kilo") {
        1024.0
    } else if compact.starts_with("Mega") {
        1024.0 * 1024.0
    } else if compact.starts_with("Giga") {
        GIB
    } else {
        return Err(incompatible());
    };

    if compact.ends_with("Bytes") {
        Ok(scale)
    } else if compact.ends_with("Bits") {
        Ok(scale / 8.0)
    } else {
        Err(incompatible())
    }
}

// =============================================================================
// TEMPLATE REPOSITORY
// =============================================================================

/// Templates unpacked under `<endpoint>/<pool>/<family>/unpacked`.
#[derive(Debug, Clone)]
pub struct TemplateRepository {
    endpoint: PathBuf,
}

impl TemplateRepository {
    pub fn new(endpoint: impl Into<PathBuf>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }

    pub fn endpoint(&self) -> &Path {
        &self.endpoint
    }

    /// Root directory of a storage pool.
    pub fn pool_dir(&self, pool: &str) -> PathBuf {
        self.endpoint.join(pool)
    }

    pub fn unpacked_dir(&self, pool: &str, family: VmFamily) -> PathBuf {
        self.pool_dir(pool).join(family.as_str()).join("unpacked")
    }

    /// Directory deployed KVM disk images are copied into.
    pub fn images_dir(&self, pool: &str) -> PathBuf {
        self.pool_dir(pool).join("images")
    }

    pub fn descriptor_path(&self, pool: &str, family: VmFamily, name: &str) -> PathBuf {
        self.unpacked_dir(pool, family).join(format!("{}.ovf", name))
    }

    /// Names of the locally available templates, sorted.
    #[instrument(skip(self))]
    pub async fn local_templates(&self, pool: &str, family: VmFamily) -> Result<Vec<String>> {
        let dir = self.unpacked_dir(pool, family);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("ovf") {
                if let Some(stem) = path.file_stem() {
                    names.push(stem.to_string_lossy().into_owned());
                }
            }
        }
        names.sort();

        debug!(dir = %dir.display(), count = names.len(), "Listed local templates");
        Ok(names)
    }

    /// Load one template's descriptor.
    pub async fn load(&self, pool: &str, family: VmFamily, name: &str) -> Result<OvfDescriptor> {
        OvfDescriptor::load(&self.descriptor_path(pool, family, name)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const KVM_OVF: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Envelope xmlns="http://schemas.dmtf.org/ovf/envelope/1"
          xmlns:ovf="http://schemas.dmtf.org/ovf/envelope/1"
          xmlns:rasd="http://schemas.dmtf.org/wbem/wscim/1/cim-schema/2/CIM_ResourceAllocationSettingData"
          xmlns:vssd="http://schemas.dmtf.org/wbem/wscim/1/cim-schema/2/CIM_VirtualSystemSettingData"
          xmlns:opennodens="http://opennodecloud.com/schema/ovf/opennodens/1">
  <References>
    <File ovf:id="diskfile1" ovf:href="centos-disk1.img" ovf:size="1048576"/>
  </References>
  <DiskSection>
    <Info>KVM VM template disks</Info>
    <Disk ovf:diskId="vmdisk1.img" ovf:fileRef="diskfile1" ovf:capacity="10737418240" ovf:format="qcow2"/>
  </DiskSection>
  <NetworkSection>
    <Network ovf:name="vmbr0"/>
  </NetworkSection>
  <VirtualSystem ovf:id="centos">
    <VirtualHardwareSection>
      <System>
        <vssd:VirtualSystemType>kvm-x86_64</vssd:VirtualSystemType>
      </System>
      <Item ovf:bound="min">
        <rasd:ResourceType>3</rasd:ResourceType>
        <rasd:VirtualQuantity>1</rasd:VirtualQuantity>
      </Item>
      <Item>
        <rasd:ResourceType>3</rasd:ResourceType>
        <rasd:VirtualQuantity>2</rasd:VirtualQuantity>
      </Item>
      <Item ovf:bound="max">
        <rasd:ResourceType>3</rasd:ResourceType>
        <rasd:VirtualQuantity>8</rasd:VirtualQuantity>
      </Item>
      <Item ovf:bound="min">
        <rasd:AllocationUnits>MegaBytes</rasd:AllocationUnits>
        <rasd:ResourceType>4</rasd:ResourceType>
        <rasd:VirtualQuantity>512</rasd:VirtualQuantity>
      </Item>
      <Item>
        <rasd:AllocationUnits>byte * 2^30</rasd:AllocationUnits>
        <rasd:ResourceType>4</rasd:ResourceType>
        <rasd:VirtualQuantity>1</rasd:VirtualQuantity>
      </Item>
      <Item>
        <rasd:Connection>br-int</rasd:Connection>
        <rasd:ResourceType>10</rasd:ResourceType>
      </Item>
    </VirtualHardwareSection>
    <opennodens:OpenNodeSection ovf:required="false">
      <Info>OpenNode Section for template customization</Info>
      <Features><acpi/><apic/><pae/></Features>
    </opennodens:OpenNodeSection>
  </VirtualSystem>
</Envelope>"#;

    #[test]
    fn test_settings_overlay_caller_wins() {
        let mut settings = TemplateSettings::from_pairs([("memory", "1"), ("vcpu", "2")]);
        settings.overlay(&TemplateSettings::from_pairs([("memory", "4")]));

        assert_eq!(settings.get_f64("memory"), Some(4.0));
        assert_eq!(settings.get_u32("vcpu"), Some(2));
        assert!(settings.require_str("hostname").is_err());
    }

    #[test]
    fn test_settings_keep_insertion_order() {
        let mut settings =
            TemplateSettings::from_pairs([("vm_type", "openvz"), ("template_name", "debian-7"), ("hostname", "web")]);
        settings.overlay(&TemplateSettings::from_pairs([("template_name", "centos")]));

        assert_eq!(
            serde_json::to_string(&settings).unwrap(),
            r#"{"vm_type":"openvz","template_name":"centos","hostname":"web"}"#
        );
    }

    #[test]
    fn test_settings_defaults_do_not_override() {
        let mut settings = TemplateSettings::from_pairs([("memory", "1")]);
        let defaults: BTreeMap<String, String> =
            [("memory".to_string(), "8".to_string()), ("machine".to_string(), "pc".to_string())]
                .into_iter()
                .collect();
        settings.apply_defaults(&defaults);

        assert_eq!(settings.get_str("memory").as_deref(), Some("1"));
        assert_eq!(settings.get_str("machine").as_deref(), Some("pc"));
    }

    #[test]
    fn test_allocation_units() {
        assert_eq!(allocation_units_bytes("byte * 2^20").unwrap(), 1048576.0);
        assert_eq!(allocation_units_bytes("bit * 2^13").unwrap(), 1024.0);
        assert_eq!(allocation_units_bytes("MegaBytes").unwrap(), 1048576.0);
        assert_eq!(allocation_units_bytes("GigaBits").unwrap(), GIB / 8.0);
        assert!(allocation_units_bytes("TeraBytes").is_err());
        assert!(allocation_units_bytes("nibble * 2^4").is_err());
    }

    #[test]
    fn test_parse_ovf() {
        let ovf = OvfDescriptor::parse("centos", KVM_OVF).unwrap();

        assert_eq!(ovf.system_type.as_deref(), Some("kvm-x86_64"));
        assert_eq!(ovf.vcpu, Bounds { min: Some(1), normal: Some(2), max: Some(8) });
        assert_eq!(ovf.memory_gb.min, Some(0.5));
        assert_eq!(ovf.memory_gb.normal, Some(1.0));
        assert_eq!(ovf.memory_gb.max, None);
        assert_eq!(ovf.networks, vec!["br-int".to_string()]);
        assert_eq!(ovf.features, vec!["acpi", "apic", "pae"]);

        assert_eq!(ovf.disks.len(), 1);
        assert_eq!(ovf.disks[0].href.as_deref(), Some("centos-disk1.img"));
        assert_eq!(ovf.disks[0].capacity_gb, Some(10.0));
    }

    #[tokio::test]
    async fn test_repository_lists_and_loads() {
        let tmp = TempDir::new().unwrap();
        let repo = TemplateRepository::new(tmp.path());
        let dir = repo.unpacked_dir("local", VmFamily::Kvm);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("centos.ovf"), KVM_OVF).unwrap();
        std::fs::write(dir.join("centos-disk1.img"), b"").unwrap();
        std::fs::write(dir.join("alpine.ovf"), KVM_OVF).unwrap();

        assert_eq!(
            repo.local_templates("local", VmFamily::Kvm).await.unwrap(),
            vec!["alpine".to_string(), "centos".to_string()]
        );
        assert!(repo.local_templates("local", VmFamily::OpenVz).await.unwrap().is_empty());

        let ovf = repo.load("local", VmFamily::Kvm, "centos").await.unwrap();
        assert_eq!(ovf.name, "centos");
        assert!(repo.load("local", VmFamily::Kvm, "missing").await.is_err());
    }
}
