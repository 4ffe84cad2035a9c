//! Libvirt driver implementation.

use async_trait::async_trait;
use tracing::{debug, info, instrument};
use uuid::Uuid;
use virt::connect::Connect;
use virt::domain::Domain;
use virt::error::{ErrorDomain, ErrorNumber};

use crate::error::{FaultCode, FaultDomain, HypervisorFault, Result, VirtError};
use crate::traits::{FaultResult, Hypervisor};
use crate::types::{DomainHandle, DomainInfo, NodeInfo};

/// Libvirt hypervisor driver.
///
/// Serves any URI libvirt understands, e.g.:
/// - `qemu:///system` - System-wide QEMU/KVM
/// - `openvz:///system` - OpenVZ containers
/// - `xen:///system` - Xen
pub struct LibvirtHypervisor {
    uri: String,
    connection: Connect,
}

impl LibvirtHypervisor {
    /// Open a connection to the specified URI.
    pub async fn connect(uri: &str) -> Result<Self> {
        info!(uri = %uri, "Connecting to libvirt");

        let connection = Connect::open(Some(uri))
            .map_err(|e| VirtError::ConnectionFailed(e.to_string()))?;

        info!("Connected to libvirt");

        Ok(Self {
            uri: uri.to_string(),
            connection,
        })
    }

    /// Resolve a handle back to a libvirt domain.
    fn get_domain(&self, dom: &DomainHandle) -> FaultResult<Domain> {
        Domain::lookup_by_uuid_string(&self.connection, &dom.uuid_string()).map_err(fault)
    }

    fn handle(domain: &Domain) -> FaultResult<DomainHandle> {
        let name = domain.get_name().map_err(fault)?;
        let uuid_string = domain.get_uuid_string().map_err(fault)?;
        let uuid = Uuid::parse_str(&uuid_string).map_err(|e| {
            HypervisorFault::new(
                FaultCode::Other("uuid".to_string()),
                FaultDomain::Other("virtnode".to_string()),
                format!("driver returned invalid uuid '{}': {}", uuid_string, e),
            )
        })?;

        Ok(DomainHandle {
            id: domain.get_id(),
            name,
            uuid,
        })
    }
}

/// Convert a libvirt error into a driver fault, keeping its code and origin.
fn fault(e: virt::error::Error) -> HypervisorFault {
    HypervisorFault::new(fault_code(e.code()), fault_domain(e.domain()), e.message())
}

fn fault_code(code: ErrorNumber) -> FaultCode {
    match code {
        ErrorNumber::NoSupport => FaultCode::NoSupport,
        ErrorNumber::OperationFailed => FaultCode::OperationFailed,
        ErrorNumber::OperationInvalid => FaultCode::OperationInvalid,
        ErrorNumber::NoDomain => FaultCode::NoDomain,
        other => FaultCode::Other(format!("{:?}", other)),
    }
}

fn fault_domain(domain: ErrorDomain) -> FaultDomain {
    match domain {
        ErrorDomain::Qemu => FaultDomain::Qemu,
        ErrorDomain::OpenVz => FaultDomain::OpenVz,
        ErrorDomain::Test => FaultDomain::Test,
        other => FaultDomain::Other(format!("{:?}", other).to_ascii_lowercase()),
    }
}

#[async_trait]
impl Hypervisor for LibvirtHypervisor {
    fn uri(&self) -> &str {
        &self.uri
    }

    async fn driver_type(&self) -> FaultResult<String> {
        self.connection.get_type().map_err(fault)
    }

    async fn node_info(&self) -> FaultResult<NodeInfo> {
        let info = self.connection.get_node_info().map_err(fault)?;
        Ok(NodeInfo {
            memory_kib: info.memory,
            cpus: info.cpus,
        })
    }

    #[instrument(skip(self))]
    async fn list_domain_ids(&self) -> FaultResult<Vec<u32>> {
        let ids = self.connection.list_domains().map_err(fault)?;
        debug!(count = ids.len(), "Listed running domains");
        Ok(ids)
    }

    #[instrument(skip(self))]
    async fn list_defined_domains(&self) -> FaultResult<Vec<String>> {
        let names = self.connection.list_defined_domains().map_err(fault)?;
        debug!(count = names.len(), "Listed defined domains");
        Ok(names)
    }

    async fn lookup_by_id(&self, id: u32) -> FaultResult<DomainHandle> {
        let domain = Domain::lookup_by_id(&self.connection, id).map_err(fault)?;
        Self::handle(&domain)
    }

    async fn lookup_by_name(&self, name: &str) -> FaultResult<DomainHandle> {
        let domain = Domain::lookup_by_name(&self.connection, name).map_err(fault)?;
        Self::handle(&domain)
    }

    async fn lookup_by_uuid(&self, uuid: &str) -> FaultResult<DomainHandle> {
        let domain = Domain::lookup_by_uuid_string(&self.connection, uuid).map_err(fault)?;
        Self::handle(&domain)
    }

    async fn domain_info(&self, dom: &DomainHandle) -> FaultResult<DomainInfo> {
        let info = self.get_domain(dom)?.get_info().map_err(fault)?;
        Ok(DomainInfo {
            state: info.state,
            max_mem_kib: info.max_mem,
            memory_kib: info.memory,
            vcpus: info.nr_virt_cpu,
            cpu_time_ns: info.cpu_time,
        })
    }

    async fn xml_desc(&self, dom: &DomainHandle) -> FaultResult<String> {
        self.get_domain(dom)?.get_xml_desc(0).map_err(fault)
    }

    #[instrument(skip(self, dom), fields(vm_id = %dom.uuid))]
    async fn create(&self, dom: &DomainHandle) -> FaultResult<()> {
        info!("Starting domain");
        self.get_domain(dom)?.create().map_err(fault)?;
        info!("Domain started");
        Ok(())
    }

    #[instrument(skip(self, dom), fields(vm_id = %dom.uuid))]
    async fn shutdown(&self, dom: &DomainHandle) -> FaultResult<()> {
        info!("Requesting domain shutdown");
        self.get_domain(dom)?.shutdown().map_err(fault)?;
        Ok(())
    }

    #[instrument(skip(self, dom), fields(vm_id = %dom.uuid))]
    async fn destroy(&self, dom: &DomainHandle) -> FaultResult<()> {
        info!("Destroying domain");
        self.get_domain(dom)?.destroy().map_err(fault)?;
        info!("Domain destroyed");
        Ok(())
    }

    #[instrument(skip(self, dom), fields(vm_id = %dom.uuid))]
    async fn reboot(&self, dom: &DomainHandle) -> FaultResult<()> {
        info!("Rebooting domain");
        self.get_domain(dom)?.reboot(0).map_err(fault)?;
        Ok(())
    }

    #[instrument(skip(self, dom), fields(vm_id = %dom.uuid))]
    async fn suspend(&self, dom: &DomainHandle) -> FaultResult<()> {
        info!("Suspending domain");
        self.get_domain(dom)?.suspend().map_err(fault)?;
        Ok(())
    }

    #[instrument(skip(self, dom), fields(vm_id = %dom.uuid))]
    async fn resume(&self, dom: &DomainHandle) -> FaultResult<()> {
        info!("Resuming domain");
        self.get_domain(dom)?.resume().map_err(fault)?;
        Ok(())
    }

    #[instrument(skip(self, dom), fields(vm_id = %dom.uuid))]
    async fn undefine(&self, dom: &DomainHandle) -> FaultResult<()> {
        info!("Undefining domain");
        self.get_domain(dom)?.undefine().map_err(fault)?;
        Ok(())
    }

    #[instrument(skip(self, xml))]
    async fn define_xml(&self, xml: &str) -> FaultResult<DomainHandle> {
        debug!(xml = %xml, "Defining domain");
        let domain = Domain::define_xml(&self.connection, xml).map_err(fault)?;
        let handle = Self::handle(&domain)?;
        info!(vm_name = %handle.name, "Domain defined");
        Ok(handle)
    }
}
