//! # virtnode Hypervisor
//!
//! VM lifecycle management over two kinds of backend:
//! - **libvirt** drivers: KVM/QEMU, Xen and the `test://` simulation driver
//! - **OpenVZ** containers, driven through libvirt plus `vzctl`/`vzlist`
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │              VirtManager                │
//! │  (list, deploy, reboot, metrics, ...)   │
//! └─────────────────────┬───────────────────┘
//!                       │ one Session per call
//!         ┌─────────────┴─────────────┐
//!         ▼                           ▼
//! ┌───────────────────┐     ┌───────────────────┐
//! │  Hypervisor trait │     │  Backend (family) │
//! │ libvirt / simul.  │     │   KVM  │  OpenVZ  │
//! └───────────────────┘     └───────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use virtnode_hypervisor::{ManagerOptions, VirtManager};
//!
//! #[tokio::main]
//! async fn main() {
//!     let manager = VirtManager::new(ManagerOptions::default());
//!
//!     for vm in manager.list("test:///default").await.unwrap() {
//!         println!("{} {}", vm.name, vm.state);
//!     }
//! }
//! ```

pub mod error;
pub mod traits;
pub mod types;
pub mod state;
pub mod xml;
pub mod introspect;
pub mod mock;
pub mod libvirt;
pub mod shell;
pub mod probe;
pub mod counters;
pub mod template;
pub mod backend;
pub mod deploy;
pub mod metrics;
pub mod connection;
pub mod registry;
pub mod lifecycle;
pub mod manager;

pub use error::{FaultCode, FaultDomain, HypervisorFault, Result, VirtError};
pub use traits::{FaultResult, Hypervisor};
pub use types::*;
pub use mock::SimulatedHypervisor;
pub use shell::{CommandRunner, ScriptedRunner, ShellRunner};
pub use probe::{GuestProbe, VzProbe};
pub use counters::{CounterSample, CounterStore, FileCounterStore, MemoryCounterStore};
pub use template::{OvfDescriptor, TemplateRepository, TemplateSettings};
pub use backend::{Backend, BackendTools};
pub use deploy::{DeploymentPipeline, FixedHost, HostCapacity, HostResources, OvfDefaults, SystemHost};
pub use connection::{BackendConnection, Connector, DefaultConnector, Session};
pub use lifecycle::RebootOptions;
pub use manager::{ManagerOptions, VirtManager, VirtManagerBuilder};
