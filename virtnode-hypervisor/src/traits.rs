//! Core hypervisor driver trait.

use async_trait::async_trait;

use crate::error::HypervisorFault;
use crate::types::{DomainHandle, DomainInfo, NodeInfo};

/// Result of a raw driver call.
pub type FaultResult<T> = std::result::Result<T, HypervisorFault>;

/// The driver seam the VM manager is built on.
///
/// This mirrors the subset of the libvirt connection/domain API the manager
/// needs. Implementations are the libvirt driver (behind the `libvirt`
/// feature) and the in-process simulation driver used for `test://` URIs.
/// Every call surfaces driver failures as an opaque [`HypervisorFault`].
#[async_trait]
pub trait Hypervisor: Send + Sync {
    // =========================================================================
    // Connection
    // =========================================================================

    /// The URI this connection was opened with.
    fn uri(&self) -> &str;

    /// Driver type as reported by the hypervisor (e.g. "QEMU", "OpenVZ", "Test").
    async fn driver_type(&self) -> FaultResult<String>;

    /// Host memory and CPU count.
    async fn node_info(&self) -> FaultResult<NodeInfo>;

    // =========================================================================
    // Enumeration & Lookup
    // =========================================================================

    /// Numeric ids of running domains, in driver order.
    async fn list_domain_ids(&self) -> FaultResult<Vec<u32>>;

    /// Names of defined but inactive domains, in driver order.
    async fn list_defined_domains(&self) -> FaultResult<Vec<String>>;

    async fn lookup_by_id(&self, id: u32) -> FaultResult<DomainHandle>;

    async fn lookup_by_name(&self, name: &str) -> FaultResult<DomainHandle>;

    async fn lookup_by_uuid(&self, uuid: &str) -> FaultResult<DomainHandle>;

    // =========================================================================
    // Domain Status
    // =========================================================================

    async fn domain_info(&self, dom: &DomainHandle) -> FaultResult<DomainInfo>;

    /// The domain's XML descriptor.
    async fn xml_desc(&self, dom: &DomainHandle) -> FaultResult<String>;

    // =========================================================================
    // Domain Lifecycle
    // =========================================================================

    /// Boot a defined domain.
    async fn create(&self, dom: &DomainHandle) -> FaultResult<()>;

    /// Request a graceful shutdown. Returns once the request is accepted.
    async fn shutdown(&self, dom: &DomainHandle) -> FaultResult<()>;

    /// Power off immediately.
    async fn destroy(&self, dom: &DomainHandle) -> FaultResult<()>;

    async fn reboot(&self, dom: &DomainHandle) -> FaultResult<()>;

    async fn suspend(&self, dom: &DomainHandle) -> FaultResult<()>;

    async fn resume(&self, dom: &DomainHandle) -> FaultResult<()>;

    /// Remove the domain definition.
    async fn undefine(&self, dom: &DomainHandle) -> FaultResult<()>;

    /// Define a persistent domain from XML.
    async fn define_xml(&self, xml: &str) -> FaultResult<DomainHandle>;
}
