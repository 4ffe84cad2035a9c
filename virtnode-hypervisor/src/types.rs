//! Type definitions for VM records, driver results and metrics.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, VirtError};

// =============================================================================
// VM STATE
// =============================================================================

/// Coarse VM lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    Active,
    Suspended,
    Inactive,
}

impl VmState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VmState::Active => "active",
            VmState::Suspended => "suspended",
            VmState::Inactive => "inactive",
        }
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fine-grained state as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    NoState,
    Running,
    Blocked,
    Suspended,
    ShuttingDown,
    Shutoff,
    Crashed,
}

impl RunState {
    /// Map a raw driver state code. Returns `None` outside 0..=6.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(RunState::NoState),
            1 => Some(RunState::Running),
            2 => Some(RunState::Blocked),
            3 => Some(RunState::Suspended),
            4 => Some(RunState::ShuttingDown),
            5 => Some(RunState::Shutoff),
            6 => Some(RunState::Crashed),
            _ => None,
        }
    }

    /// Raw driver state code.
    pub fn code(&self) -> u32 {
        match self {
            RunState::NoState => 0,
            RunState::Running => 1,
            RunState::Blocked => 2,
            RunState::Suspended => 3,
            RunState::ShuttingDown => 4,
            RunState::Shutoff => 5,
            RunState::Crashed => 6,
        }
    }

    /// The coarse lifecycle bucket for this run-state.
    pub fn lifecycle(&self) -> VmState {
        match self {
            RunState::NoState | RunState::Running | RunState::Blocked => VmState::Active,
            RunState::Suspended => VmState::Suspended,
            RunState::ShuttingDown | RunState::Shutoff | RunState::Crashed => VmState::Inactive,
        }
    }
}

// =============================================================================
// VM RECORD
// =============================================================================

/// Console endpoint of a VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ConsoleDescriptor {
    /// VNC graphics console.
    Vnc { port: String },
    /// Serial console exposed as a host pty.
    Pty { pty: String },
    /// OpenVZ console, attached through `vzctl enter <cid>`.
    #[serde(rename = "openvz")]
    OpenVz { cid: String },
}

/// Network interface of a VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceDescriptor {
    pub mac: Option<String>,
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv4_address: Option<String>,
}

/// The canonical VM description handed to callers.
///
/// Built fresh on every enumeration and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmRecord {
    pub uuid: String,
    pub name: String,
    pub vm_type: String,
    pub vm_uri: String,
    pub state: VmState,
    pub run_state: RunState,
    /// Memory in MiB
    pub memory: f64,
    /// Swap in MiB
    pub swap: f64,
    pub vcpu: u32,
    /// Uptime in seconds, only set for active VMs
    pub uptime: Option<f64>,
    /// Mount point to size in MiB
    pub diskspace: BTreeMap<String, f64>,
    pub template: Option<String>,
    pub consoles: Vec<ConsoleDescriptor>,
    pub interfaces: Vec<InterfaceDescriptor>,
}

/// Usage sample for one running container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmMetrics {
    /// Fraction of non-idle CPU time since the previous sample (0.0 - 1.0)
    pub cpu_usage: f64,
    /// 1-minute load average
    pub load: f64,
    /// Used memory in MiB
    pub memory_usage: f64,
    /// Max of receive/transmit rate in bytes per second
    pub network_usage: f64,
    /// Used space on / in MiB
    pub diskspace_usage: f64,
}

// =============================================================================
// DRIVER RESULTS
// =============================================================================

/// A resolved domain reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainHandle {
    /// Numeric id, only set while the domain runs
    pub id: Option<u32>,
    /// Backend-local name (the container id for OpenVZ)
    pub name: String,
    pub uuid: Uuid,
}

impl DomainHandle {
    pub fn uuid_string(&self) -> String {
        self.uuid.hyphenated().to_string()
    }
}

/// Domain status as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainInfo {
    /// Raw state code (0..=6)
    pub state: u32,
    pub max_mem_kib: u64,
    pub memory_kib: u64,
    pub vcpus: u32,
    pub cpu_time_ns: u64,
}

/// Host information as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeInfo {
    pub memory_kib: u64,
    pub cpus: u32,
}

// =============================================================================
// BACKEND FAMILIES
// =============================================================================

/// Virtualization technology family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmFamily {
    /// libvirt-driven full virtualization (QEMU/KVM, Xen, test driver)
    Kvm,
    /// OpenVZ containers
    #[serde(rename = "openvz")]
    OpenVz,
}

impl VmFamily {
    /// Resolve a `vm_type` parameter. `qemu` is a synonym for `kvm`.
    pub fn from_vm_type(vm_type: &str) -> Result<Self> {
        match vm_type {
            "kvm" | "qemu" => Ok(VmFamily::Kvm),
            "openvz" => Ok(VmFamily::OpenVz),
            other => Err(VirtError::UnsupportedVmType(other.to_string())),
        }
    }

    /// Resolve the driver type reported by an open connection.
    pub fn from_driver_type(driver_type: &str) -> Self {
        if driver_type.eq_ignore_ascii_case("openvz") {
            VmFamily::OpenVz
        } else {
            VmFamily::Kvm
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VmFamily::Kvm => "kvm",
            VmFamily::OpenVz => "openvz",
        }
    }
}

impl fmt::Display for VmFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Human-friendly name of a well-known backend URI.
pub fn backend_hname(uri: &str) -> Option<&'static str> {
    match uri {
        "openvz:///system" => Some("openvz"),
        "qemu:///system" => Some("kvm"),
        "xen:///system" => Some("xen"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vm_family_synonyms() {
        assert_eq!(VmFamily::from_vm_type("kvm").unwrap(), VmFamily::Kvm);
        assert_eq!(VmFamily::from_vm_type("qemu").unwrap(), VmFamily::Kvm);
        assert_eq!(VmFamily::from_vm_type("openvz").unwrap(), VmFamily::OpenVz);
        assert!(matches!(
            VmFamily::from_vm_type("lxc"),
            Err(VirtError::UnsupportedVmType(t)) if t == "lxc"
        ));
        assert_eq!(VmFamily::from_driver_type("OpenVZ"), VmFamily::OpenVz);
        assert_eq!(VmFamily::from_driver_type("QEMU"), VmFamily::Kvm);
    }

    #[test]
    fn test_backend_hname() {
        assert_eq!(backend_hname("qemu:///system"), Some("kvm"));
        assert_eq!(backend_hname("openvz:///system"), Some("openvz"));
        assert_eq!(backend_hname("test:///default"), None);
    }

    #[test]
    fn test_console_serialization() {
        let vnc = serde_json::to_value(ConsoleDescriptor::Vnc { port: "5900".into() }).unwrap();
        assert_eq!(vnc, serde_json::json!({"type": "vnc", "port": "5900"}));

        let native = serde_json::to_value(ConsoleDescriptor::OpenVz { cid: "101".into() }).unwrap();
        assert_eq!(native, serde_json::json!({"type": "openvz", "cid": "101"}));
    }

    #[test]
    fn test_uuid_string_round_trip() {
        let bytes: [u8; 16] = [
            0x6f, 0x2c, 0x1d, 0x44, 0x2b, 0x6e, 0x4f, 0x83,
            0x9a, 0x0c, 0x51, 0x3e, 0x08, 0xd4, 0x77, 0xfe,
        ];
        let handle = DomainHandle {
            id: Some(1),
            name: "vm".to_string(),
            uuid: Uuid::from_bytes(bytes),
        };

        let rendered = handle.uuid_string();
        assert_eq!(rendered, "6f2c1d44-2b6e-4f83-9a0c-513e08d477fe");
        assert_eq!(Uuid::parse_str(&rendered).unwrap().as_bytes(), &bytes);
    }
}
