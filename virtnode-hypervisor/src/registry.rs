//! VM enumeration and rendering.

use tracing::{debug, instrument, warn};

use crate::backend::Backend;
use crate::connection::Session;
use crate::error::{Result, VirtError};
use crate::introspect::DomainDescriptor;
use crate::state::normalize;
use crate::types::{ConsoleDescriptor, DomainHandle, InterfaceDescriptor, VmRecord};

/// Enumerate all VMs: running ones first, then defined-but-stopped ones.
///
/// On OpenVZ, a driver that cannot enumerate (typically because no
/// container exists yet) yields an empty list.
#[instrument(skip(session), fields(uri = %session.uri()))]
pub async fn list(session: &Session) -> Result<Vec<VmRecord>> {
    match list_all(session).await {
        Err(VirtError::Backend(fault)) if matches!(session.backend(), Backend::OpenVz(_)) => {
            warn!(%fault, "OpenVZ enumeration failed, reporting no containers");
            Ok(Vec::new())
        }
        other => other,
    }
}

async fn list_all(session: &Session) -> Result<Vec<VmRecord>> {
    let hv = session.hv();

    let mut records = Vec::new();
    for id in session.backend().running_ids(hv).await? {
        let dom = hv.lookup_by_id(id).await?;
        records.push(render(session, &dom).await?);
    }
    for name in hv.list_defined_domains().await? {
        let dom = hv.lookup_by_name(&name).await?;
        records.push(render(session, &dom).await?);
    }

    debug!(count = records.len(), "Enumerated VMs");
    Ok(records)
}

/// Defined names followed by running ids.
pub async fn list_vm_ids(session: &Session) -> Result<Vec<String>> {
    let hv = session.hv();
    let mut ids = hv.list_defined_domains().await?;
    ids.extend(hv.list_domain_ids().await?.into_iter().map(|id| id.to_string()));
    Ok(ids)
}

/// Render a single VM by UUID.
pub async fn info(session: &Session, uuid: &str) -> Result<VmRecord> {
    let dom = session.hv().lookup_by_uuid(uuid).await?;
    render(session, &dom).await
}

async fn descriptor(session: &Session, uuid: &str) -> Result<(DomainHandle, DomainDescriptor)> {
    let dom = session.hv().lookup_by_uuid(uuid).await?;
    let descriptor = DomainDescriptor::parse(&session.hv().xml_desc(&dom).await?)?;
    Ok((dom, descriptor))
}

/// VNC console of one VM.
pub async fn console_vnc(session: &Session, uuid: &str) -> Result<Option<ConsoleDescriptor>> {
    let (_, descriptor) = descriptor(session, uuid).await?;
    Ok(descriptor.vnc_console())
}

/// Serial (or OpenVZ native) console of one VM.
pub async fn console_pty(session: &Session, uuid: &str) -> Result<Option<ConsoleDescriptor>> {
    let (dom, descriptor) = descriptor(session, uuid).await?;
    Ok(descriptor.pty_console(session.backend().native_console_id(&dom)))
}

pub async fn interfaces(session: &Session, uuid: &str) -> Result<Vec<InterfaceDescriptor>> {
    let (_, descriptor) = descriptor(session, uuid).await?;
    Ok(descriptor.interfaces())
}

/// Build the record for one domain.
pub async fn render(session: &Session, dom: &DomainHandle) -> Result<VmRecord> {
    let hv = session.hv();
    let backend = session.backend();

    let info = hv.domain_info(dom).await?;
    let (state, run_state) = normalize(info.state);
    let descriptor = DomainDescriptor::parse(&hv.xml_desc(dom).await?)?;

    Ok(VmRecord {
        uuid: dom.uuid_string(),
        name: backend.display_name(dom).await?,
        vm_type: session.vm_type(),
        vm_uri: session.uri().to_string(),
        state,
        run_state,
        memory: backend.memory_mib(dom).await?,
        swap: backend.swap_mib(dom).await?,
        vcpu: info.vcpus,
        uptime: backend.uptime_secs(dom, state).await?,
        diskspace: backend.diskspace(dom).await?,
        template: backend.template_name(dom).await?,
        consoles: descriptor.consoles(backend.native_console_id(dom)),
        interfaces: descriptor.interfaces(),
    })
}
