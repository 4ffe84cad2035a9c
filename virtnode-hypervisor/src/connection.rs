//! Backend connections and sessions.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::backend::{Backend, BackendTools};
use crate::error::{Result, VirtError};
use crate::mock::{SimulatedHypervisor, DEFAULT_SIMULATION_URI, SIMULATION_PREFIX};
use crate::state::normalize;
use crate::traits::Hypervisor;
use crate::types::VmFamily;
use crate::xml::XmlElement;

/// Whether `uri` selects the simulation driver.
pub fn is_simulation_uri(uri: &str) -> bool {
    uri.starts_with(SIMULATION_PREFIX)
}

/// Whether `uri` is a simulation URI backed by a fixture file.
pub fn is_fixture_uri(uri: &str) -> bool {
    is_simulation_uri(uri) && uri != DEFAULT_SIMULATION_URI
}

/// Opens hypervisor drivers by URI.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, uri: &str) -> Result<Box<dyn Hypervisor>>;
}

/// Simulation URIs open the in-process driver; everything else goes to
/// libvirt.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultConnector;

#[async_trait]
impl Connector for DefaultConnector {
    async fn open(&self, uri: &str) -> Result<Box<dyn Hypervisor>> {
        if is_simulation_uri(uri) {
            return Ok(Box::new(SimulatedHypervisor::open(uri).await?));
        }

        open_libvirt(uri).await
    }
}

/// A simulated node serves every URI it is asked for. Sessions share the
/// node, so state carries over between them.
#[async_trait]
impl Connector for SimulatedHypervisor {
    async fn open(&self, _uri: &str) -> Result<Box<dyn Hypervisor>> {
        Ok(Box::new(self.clone()))
    }
}

#[cfg(feature = "libvirt")]
async fn open_libvirt(uri: &str) -> Result<Box<dyn Hypervisor>> {
    Ok(Box::new(crate::libvirt::LibvirtHypervisor::connect(uri).await?))
}

#[cfg(not(feature = "libvirt"))]
async fn open_libvirt(uri: &str) -> Result<Box<dyn Hypervisor>> {
    Err(VirtError::ConnectionFailed(format!(
        "{}: built without libvirt support",
        uri
    )))
}

/// Opens sessions, enforcing the backend allow-list.
#[derive(Clone)]
pub struct BackendConnection {
    allow_list: Vec<String>,
    connector: Arc<dyn Connector>,
    tools: BackendTools,
}

impl BackendConnection {
    pub fn new(allow_list: Vec<String>, connector: Arc<dyn Connector>, tools: BackendTools) -> Self {
        Self {
            allow_list,
            connector,
            tools,
        }
    }

    pub fn allow_list(&self) -> &[String] {
        &self.allow_list
    }

    pub fn set_allow_list(&mut self, backends: Vec<String>) {
        self.allow_list = backends;
    }

    /// Open a session on `uri`.
    #[instrument(skip(self))]
    pub async fn connect(&self, uri: &str) -> Result<Session> {
        if !self.allow_list.is_empty()
            && !self.allow_list.iter().any(|b| b == uri)
            && !is_simulation_uri(uri)
        {
            return Err(VirtError::UnsupportedBackend(uri.to_string()));
        }

        let hypervisor = self.connector.open(uri).await?;
        let driver_type = hypervisor.driver_type().await?;
        let backend = Backend::new(VmFamily::from_driver_type(&driver_type), &self.tools);

        let session = Session {
            uri: uri.to_string(),
            driver_type,
            hypervisor,
            backend,
        };

        if is_fixture_uri(uri) {
            session.apply_fixture_states().await?;
        }

        debug!(uri = %uri, driver = %session.driver_type, "Session opened");
        Ok(session)
    }
}

/// An open connection to one backend.
pub struct Session {
    uri: String,
    driver_type: String,
    hypervisor: Box<dyn Hypervisor>,
    backend: Backend,
}

impl Session {
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Driver type as reported by the hypervisor, e.g. `QEMU` or `OpenVZ`.
    pub fn driver_type(&self) -> &str {
        &self.driver_type
    }

    /// Lower-cased driver type, used as `vm_type` on records.
    pub fn vm_type(&self) -> String {
        self.driver_type.to_lowercase()
    }

    pub fn hv(&self) -> &dyn Hypervisor {
        self.hypervisor.as_ref()
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn family(&self) -> VmFamily {
        self.backend.family()
    }

    pub fn is_fixture(&self) -> bool {
        is_fixture_uri(&self.uri)
    }

    /// Shut down every fixture domain marked `state="inactive"`.
    async fn apply_fixture_states(&self) -> Result<()> {
        let Some(path) = self.uri.strip_prefix(SIMULATION_PREFIX) else {
            return Ok(());
        };
        let xml = tokio::fs::read_to_string(path).await?;
        let root = XmlElement::parse(&xml)?;

        for domain in root.descendants("domain") {
            if domain.attr("state") != Some("inactive") {
                continue;
            }
            let Some(name) = domain.child_text("name") else {
                continue;
            };
            let dom = self.hv().lookup_by_name(name.trim()).await?;
            self.hv().shutdown(&dom).await?;
            debug!(name = %dom.name, "Fixture domain marked inactive");
        }

        Ok(())
    }

    /// Write every domain's descriptor, tagged with its `state`, into a
    /// `<node>` document at `path`.
    #[instrument(skip(self, path), fields(uri = %self.uri))]
    pub async fn write_snapshot(&self, path: &Path) -> Result<()> {
        let hv = self.hv();
        let mut handles = Vec::new();
        for id in hv.list_domain_ids().await? {
            handles.push(hv.lookup_by_id(id).await?);
        }
        for name in hv.list_defined_domains().await? {
            handles.push(hv.lookup_by_name(&name).await?);
        }

        let mut node = XmlElement::new("node");
        for dom in &handles {
            let mut descriptor = XmlElement::parse(&hv.xml_desc(dom).await?)?;
            let (state, _) = normalize(hv.domain_info(dom).await?.state);
            descriptor.set_attr("state", state.as_str());
            node.children.push(descriptor);
        }

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, node.to_document()?).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666)).await {
                warn!(path = %path.display(), error = %e, "Failed to relax snapshot permissions");
            }
        }

        info!(path = %path.display(), domains = handles.len(), "Wrote simulation snapshot");
        Ok(())
    }
}
