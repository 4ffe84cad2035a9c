//! Simulated hypervisor driver for `test://` URIs and tests.

use async_trait::async_trait;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::error::{FaultCode, FaultDomain, HypervisorFault, Result, VirtError};
use crate::traits::{FaultResult, Hypervisor};
use crate::types::{DomainHandle, DomainInfo, NodeInfo, RunState};
use crate::xml::XmlElement;

/// URI prefix of the simulation driver.
pub const SIMULATION_PREFIX: &str = "test://";

/// URI of the built-in simulation node.
pub const DEFAULT_SIMULATION_URI: &str = "test:///default";

const DEFAULT_DOMAIN_XML: &str = r#"<domain type='test'>
  <name>test</name>
  <uuid>6695eb01-f6a4-8304-79aa-97f2502e193f</uuid>
  <memory>8388608</memory>
  <currentMemory>2097152</currentMemory>
  <vcpu>2</vcpu>
  <os>
    <type arch='i686'>hvm</type>
    <boot dev='hd'/>
  </os>
  <devices>
    <interface type='network'>
      <mac address='aa:bb:cc:dd:ee:ff'/>
      <source network='default'/>
    </interface>
  </devices>
</domain>"#;

/// Simulated hypervisor driver.
///
/// Domains live in memory. Clones share the same node, so a test can keep a
/// handle to inspect state after the session that used it was dropped.
///
/// Behaviour knobs cover the quirks the manager has to cope with:
/// - drivers without a native reboot call
/// - shutdowns that take several status polls to complete
/// - transient faults raised by status queries
#[derive(Clone)]
pub struct SimulatedHypervisor {
    uri: String,
    driver_type: String,
    fault_domain: FaultDomain,
    state: Arc<RwLock<SimState>>,
}

struct SimState {
    domains: Vec<SimDomain>,
    next_id: u32,
    node: NodeInfo,
    reboot_supported: bool,
    shutdown_lag: u32,
    info_faults: Vec<HypervisorFault>,
    list_fault: Option<HypervisorFault>,
    calls: Vec<String>,
}

struct SimDomain {
    name: String,
    uuid: Uuid,
    id: Option<u32>,
    run_state: RunState,
    /// Status polls left before a pending shutdown completes
    shutdown_pending: Option<u32>,
    max_mem_kib: u64,
    memory_kib: u64,
    vcpus: u32,
    descriptor: XmlElement,
}

impl SimDomain {
    fn from_descriptor(mut descriptor: XmlElement) -> Result<Self> {
        descriptor.attributes.retain(|(k, _)| k != "state" && k != "id");

        let name = descriptor
            .child_text("name")
            .filter(|n| !n.is_empty())
            .ok_or_else(|| VirtError::XmlError("domain has no name".to_string()))?
            .to_string();

        let uuid = match descriptor.child_text("uuid") {
            Some(text) => Uuid::parse_str(text.trim())
                .map_err(|e| VirtError::XmlError(format!("invalid uuid '{}': {}", text, e)))?,
            None => {
                let uuid = Uuid::new_v4();
                descriptor
                    .children
                    .push(XmlElement::new("uuid").with_text(uuid.hyphenated().to_string()));
                uuid
            }
        };

        let max_mem_kib = descriptor.child("memory").map(memory_kib).unwrap_or(0);
        let memory_kib = descriptor
            .child("currentMemory")
            .map(memory_kib)
            .unwrap_or(max_mem_kib);
        let vcpus = descriptor
            .child_text("vcpu")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(1);

        Ok(Self {
            name,
            uuid,
            id: None,
            run_state: RunState::Shutoff,
            shutdown_pending: None,
            max_mem_kib,
            memory_kib,
            vcpus,
            descriptor,
        })
    }

    fn handle(&self) -> DomainHandle {
        DomainHandle {
            id: self.id,
            name: self.name.clone(),
            uuid: self.uuid,
        }
    }

    fn is_running(&self) -> bool {
        self.id.is_some()
    }

    fn power_off(&mut self) {
        self.id = None;
        self.run_state = RunState::Shutoff;
        self.shutdown_pending = None;
    }
}

/// Memory element value in KiB, honouring the libvirt `unit` attribute.
fn memory_kib(element: &XmlElement) -> u64 {
    let value: u64 = element.text.trim().parse().unwrap_or(0);
    match element.attr("unit").unwrap_or("KiB") {
        "b" | "bytes" => value / 1024,
        "MiB" | "M" => value * 1024,
        "GiB" | "G" => value * 1024 * 1024,
        _ => value,
    }
}

fn fault_domain_for(driver_type: &str) -> FaultDomain {
    match driver_type.to_ascii_lowercase().as_str() {
        "qemu" => FaultDomain::Qemu,
        "openvz" => FaultDomain::OpenVz,
        "test" => FaultDomain::Test,
        other => FaultDomain::Other(other.to_string()),
    }
}

impl SimulatedHypervisor {
    /// Create an empty simulated node.
    pub fn new(uri: impl Into<String>, driver_type: impl Into<String>) -> Self {
        let driver_type = driver_type.into();
        Self {
            uri: uri.into(),
            fault_domain: fault_domain_for(&driver_type),
            driver_type,
            state: Arc::new(RwLock::new(SimState {
                domains: Vec::new(),
                next_id: 1,
                node: NodeInfo {
                    memory_kib: 3 * 1024 * 1024,
                    cpus: 16,
                },
                reboot_supported: true,
                shutdown_lag: 0,
                info_faults: Vec::new(),
                list_fault: None,
                calls: Vec::new(),
            })),
        }
    }

    /// The built-in node served at `test:///default`: one running domain
    /// named `test`.
    pub fn default_node() -> Result<Self> {
        let sim = Self::new(DEFAULT_SIMULATION_URI, "Test");
        sim.add_domain(DEFAULT_DOMAIN_XML, true)?;
        Ok(sim)
    }

    /// Build a node from a fixture document.
    ///
    /// The fixture is a `<node>` element wrapping inline `<domain>`
    /// descriptors, optionally with `<memory>` (KiB) and `<cpu><active>`
    /// host information. Every domain starts running, as with the libvirt
    /// test driver.
    pub fn from_fixture(uri: impl Into<String>, xml: &str) -> Result<Self> {
        let root = XmlElement::parse(xml)?;
        let sim = Self::new(uri, "Test");

        {
            let mut state = sim.state.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(memory) = root.child("memory") {
                state.node.memory_kib = memory_kib(memory);
            }
            if let Some(cpus) = root
                .child("cpu")
                .and_then(|c| c.child_text("active"))
                .and_then(|v| v.trim().parse().ok())
            {
                state.node.cpus = cpus;
            }
        }

        for domain in root.children_named("domain") {
            sim.insert_domain(domain.clone(), true)?;
        }

        debug!(uri = %sim.uri, domains = root.children_named("domain").count(), "Loaded simulation fixture");
        Ok(sim)
    }

    /// Open a `test://` URI. `test:///default` is the built-in node; any other
    /// URI names a fixture file by its path.
    pub async fn open(uri: &str) -> Result<Self> {
        if uri == DEFAULT_SIMULATION_URI {
            return Self::default_node();
        }

        let path = uri.strip_prefix(SIMULATION_PREFIX).ok_or_else(|| {
            VirtError::ConnectionFailed(format!("{} is not a simulation URI", uri))
        })?;

        let xml = tokio::fs::read_to_string(path).await.map_err(|e| {
            VirtError::ConnectionFailed(format!("cannot read fixture {}: {}", path, e))
        })?;

        Self::from_fixture(uri, &xml)
    }

    /// Add a domain from its XML descriptor.
    pub fn add_domain(&self, xml: &str, running: bool) -> Result<DomainHandle> {
        self.insert_domain(XmlElement::parse(xml)?, running)
    }

    fn insert_domain(&self, descriptor: XmlElement, running: bool) -> Result<DomainHandle> {
        let mut domain = SimDomain::from_descriptor(descriptor)?;
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);

        if state.domains.iter().any(|d| d.name == domain.name || d.uuid == domain.uuid) {
            return Err(VirtError::InvalidConfig(format!(
                "domain '{}' already exists",
                domain.name
            )));
        }

        if running {
            domain.id = Some(state.next_id);
            domain.run_state = RunState::Running;
            state.next_id += 1;
        }

        let handle = domain.handle();
        state.domains.push(domain);
        Ok(handle)
    }

    /// Host information reported by `node_info`.
    pub fn set_node_info(&self, node: NodeInfo) {
        self.write_unpoisoned().node = node;
    }

    /// Whether `reboot` is implemented. When not, it fails with `NoSupport`.
    pub fn set_reboot_supported(&self, supported: bool) {
        self.write_unpoisoned().reboot_supported = supported;
    }

    /// Number of status polls a shutdown stays in `shutting_down`.
    pub fn set_shutdown_lag(&self, polls: u32) {
        self.write_unpoisoned().shutdown_lag = polls;
    }

    /// Make the next `domain_info` call fail with `fault`. Queued faults are
    /// raised in order, one per call.
    pub fn inject_info_fault(&self, fault: HypervisorFault) {
        self.write_unpoisoned().info_faults.push(fault);
    }

    /// Make every enumeration call fail with `fault` until cleared.
    pub fn inject_list_fault(&self, fault: Option<HypervisorFault>) {
        self.write_unpoisoned().list_fault = fault;
    }

    /// Mutating calls made so far, as `"<call>:<domain>"`.
    pub fn calls(&self) -> Vec<String> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .calls
            .clone()
    }

    fn write_unpoisoned(&self) -> RwLockWriteGuard<'_, SimState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn fault(&self, code: FaultCode, message: impl Into<String>) -> HypervisorFault {
        HypervisorFault::new(code, self.fault_domain.clone(), message)
    }

    fn read(&self) -> FaultResult<RwLockReadGuard<'_, SimState>> {
        self.state
            .read()
            .map_err(|_| self.fault(FaultCode::Other("internal".to_string()), "Lock poisoned"))
    }

    fn write(&self) -> FaultResult<RwLockWriteGuard<'_, SimState>> {
        self.state
            .write()
            .map_err(|_| self.fault(FaultCode::Other("internal".to_string()), "Lock poisoned"))
    }

    fn no_domain(&self, what: &str) -> HypervisorFault {
        self.fault(FaultCode::NoDomain, format!("Domain not found: {}", what))
    }

    /// Apply `op` to the domain behind `dom` and record the call.
    fn mutate<T>(
        &self,
        call: &str,
        dom: &DomainHandle,
        op: impl FnOnce(&mut SimDomain, &mut u32) -> FaultResult<T>,
    ) -> FaultResult<T> {
        let mut state = self.write()?;
        state.calls.push(format!("{}:{}", call, dom.name));

        let SimState { domains, next_id, .. } = &mut *state;
        let domain = domains
            .iter_mut()
            .find(|d| d.uuid == dom.uuid)
            .ok_or_else(|| self.no_domain(&dom.name))?;
        op(domain, next_id)
    }
}

#[async_trait]
impl Hypervisor for SimulatedHypervisor {
    fn uri(&self) -> &str {
        &self.uri
    }

    async fn driver_type(&self) -> FaultResult<String> {
        Ok(self.driver_type.clone())
    }

    async fn node_info(&self) -> FaultResult<NodeInfo> {
        Ok(self.read()?.node)
    }

    async fn list_domain_ids(&self) -> FaultResult<Vec<u32>> {
        let state = self.read()?;
        if let Some(fault) = &state.list_fault {
            return Err(fault.clone());
        }
        Ok(state.domains.iter().filter_map(|d| d.id).collect())
    }

    async fn list_defined_domains(&self) -> FaultResult<Vec<String>> {
        let state = self.read()?;
        if let Some(fault) = &state.list_fault {
            return Err(fault.clone());
        }
        Ok(state
            .domains
            .iter()
            .filter(|d| !d.is_running())
            .map(|d| d.name.clone())
            .collect())
    }

    async fn lookup_by_id(&self, id: u32) -> FaultResult<DomainHandle> {
        let state = self.read()?;
        state
            .domains
            .iter()
            .find(|d| d.id == Some(id))
            .map(SimDomain::handle)
            .ok_or_else(|| self.no_domain(&id.to_string()))
    }

    async fn lookup_by_name(&self, name: &str) -> FaultResult<DomainHandle> {
        let state = self.read()?;
        state
            .domains
            .iter()
            .find(|d| d.name == name)
            .map(SimDomain::handle)
            .ok_or_else(|| self.no_domain(name))
    }

    async fn lookup_by_uuid(&self, uuid: &str) -> FaultResult<DomainHandle> {
        let parsed = Uuid::parse_str(uuid)
            .map_err(|_| self.no_domain(uuid))?;
        let state = self.read()?;
        state
            .domains
            .iter()
            .find(|d| d.uuid == parsed)
            .map(SimDomain::handle)
            .ok_or_else(|| self.no_domain(uuid))
    }

    async fn domain_info(&self, dom: &DomainHandle) -> FaultResult<DomainInfo> {
        let mut state = self.write()?;

        if !state.info_faults.is_empty() {
            let fault = state.info_faults.remove(0);
            debug!(domain = %dom.name, "Raising injected status fault");
            return Err(fault);
        }

        let domain = state
            .domains
            .iter_mut()
            .find(|d| d.uuid == dom.uuid)
            .ok_or_else(|| self.no_domain(&dom.name))?;

        if let Some(remaining) = domain.shutdown_pending {
            if remaining == 0 {
                domain.power_off();
            } else {
                domain.shutdown_pending = Some(remaining - 1);
            }
        }

        Ok(DomainInfo {
            state: domain.run_state.code(),
            max_mem_kib: domain.max_mem_kib,
            memory_kib: domain.memory_kib,
            vcpus: domain.vcpus,
            cpu_time_ns: 0,
        })
    }

    async fn xml_desc(&self, dom: &DomainHandle) -> FaultResult<String> {
        let state = self.read()?;
        let domain = state
            .domains
            .iter()
            .find(|d| d.uuid == dom.uuid)
            .ok_or_else(|| self.no_domain(&dom.name))?;

        let mut descriptor = domain.descriptor.clone();
        if let Some(id) = domain.id {
            descriptor.set_attr("id", id.to_string());
        }

        descriptor
            .to_xml_string()
            .map_err(|e| self.fault(FaultCode::Other("xml".to_string()), e.to_string()))
    }

    #[instrument(skip(self, dom), fields(vm_id = %dom.name))]
    async fn create(&self, dom: &DomainHandle) -> FaultResult<()> {
        let invalid = self.fault(FaultCode::OperationInvalid, "domain is already running");
        self.mutate("create", dom, |domain, next_id| {
            if domain.is_running() {
                return Err(invalid);
            }
            domain.id = Some(*next_id);
            domain.run_state = RunState::Running;
            *next_id += 1;
            Ok(())
        })?;
        info!("Simulated domain started");
        Ok(())
    }

    #[instrument(skip(self, dom), fields(vm_id = %dom.name))]
    async fn shutdown(&self, dom: &DomainHandle) -> FaultResult<()> {
        let lag = self.read()?.shutdown_lag;
        let invalid = self.fault(FaultCode::OperationInvalid, "domain is not running");
        self.mutate("shutdown", dom, |domain, _| {
            if !domain.is_running() {
                return Err(invalid);
            }
            if lag == 0 {
                domain.power_off();
            } else {
                domain.run_state = RunState::ShuttingDown;
                domain.shutdown_pending = Some(lag);
            }
            Ok(())
        })?;
        info!(lag, "Simulated domain shutdown requested");
        Ok(())
    }

    #[instrument(skip(self, dom), fields(vm_id = %dom.name))]
    async fn destroy(&self, dom: &DomainHandle) -> FaultResult<()> {
        let invalid = self.fault(FaultCode::OperationInvalid, "domain is not running");
        self.mutate("destroy", dom, |domain, _| {
            if !domain.is_running() {
                return Err(invalid);
            }
            domain.power_off();
            Ok(())
        })?;
        info!("Simulated domain destroyed");
        Ok(())
    }

    #[instrument(skip(self, dom), fields(vm_id = %dom.name))]
    async fn reboot(&self, dom: &DomainHandle) -> FaultResult<()> {
        let supported = self.read()?.reboot_supported;
        let no_support = self.fault(FaultCode::NoSupport, "this function is not supported by the connection driver: virDomainReboot");
        let invalid = self.fault(FaultCode::OperationInvalid, "domain is not running");
        self.mutate("reboot", dom, |domain, _| {
            if !supported {
                return Err(no_support);
            }
            if !domain.is_running() {
                return Err(invalid);
            }
            domain.run_state = RunState::Running;
            Ok(())
        })?;
        info!("Simulated domain rebooted");
        Ok(())
    }

    #[instrument(skip(self, dom), fields(vm_id = %dom.name))]
    async fn suspend(&self, dom: &DomainHandle) -> FaultResult<()> {
        let invalid = self.fault(FaultCode::OperationInvalid, "domain is not running");
        self.mutate("suspend", dom, |domain, _| {
            if domain.run_state != RunState::Running {
                return Err(invalid);
            }
            domain.run_state = RunState::Suspended;
            Ok(())
        })?;
        info!("Simulated domain suspended");
        Ok(())
    }

    #[instrument(skip(self, dom), fields(vm_id = %dom.name))]
    async fn resume(&self, dom: &DomainHandle) -> FaultResult<()> {
        let invalid = self.fault(FaultCode::OperationInvalid, "domain is not paused");
        self.mutate("resume", dom, |domain, _| {
            if domain.run_state != RunState::Suspended {
                return Err(invalid);
            }
            domain.run_state = RunState::Running;
            Ok(())
        })?;
        info!("Simulated domain resumed");
        Ok(())
    }

    #[instrument(skip(self, dom), fields(vm_id = %dom.name))]
    async fn undefine(&self, dom: &DomainHandle) -> FaultResult<()> {
        let mut state = self.write()?;
        state.calls.push(format!("undefine:{}", dom.name));

        let index = state
            .domains
            .iter()
            .position(|d| d.uuid == dom.uuid)
            .ok_or_else(|| self.no_domain(&dom.name))?;

        if state.domains[index].is_running() {
            return Err(self.fault(
                FaultCode::OperationInvalid,
                "cannot undefine a running domain",
            ));
        }

        state.domains.remove(index);
        info!("Simulated domain undefined");
        Ok(())
    }

    #[instrument(skip(self, xml))]
    async fn define_xml(&self, xml: &str) -> FaultResult<DomainHandle> {
        let descriptor = XmlElement::parse(xml)
            .map_err(|e| self.fault(FaultCode::Other("xml".to_string()), e.to_string()))?;
        let domain = SimDomain::from_descriptor(descriptor)
            .map_err(|e| self.fault(FaultCode::Other("xml".to_string()), e.to_string()))?;

        let mut state = self.write()?;
        state.calls.push(format!("define_xml:{}", domain.name));

        if let Some(existing) = state.domains.iter_mut().find(|d| d.name == domain.name) {
            if existing.uuid != domain.uuid {
                return Err(self.fault(
                    FaultCode::OperationFailed,
                    format!("domain '{}' already exists with uuid {}", domain.name, existing.uuid),
                ));
            }
            existing.descriptor = domain.descriptor;
            existing.max_mem_kib = domain.max_mem_kib;
            existing.memory_kib = domain.memory_kib;
            existing.vcpus = domain.vcpus;
            return Ok(existing.handle());
        }

        let handle = domain.handle();
        state.domains.push(domain);
        info!(vm_name = %handle.name, "Simulated domain defined");
        Ok(handle)
    }
}
