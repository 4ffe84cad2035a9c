//! VM lifecycle operations.
//!
//! Every operation resolves the VM by UUID on the given session and
//! dispatches to the driver, except where a backend needs special handling
//! (OpenVZ shutdown, reboot on drivers without native reboot).

use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::connection::Session;
use crate::error::{Result, VirtError};
use crate::types::{DomainHandle, RunState};

/// Default status poll interval of the reboot fallback.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Controls the shutdown-then-start fallback of [`reboot`].
#[derive(Debug, Clone)]
pub struct RebootOptions {
    pub poll_interval: Duration,
    /// Give up waiting for shutoff after this long. `None` waits forever.
    pub deadline: Option<Duration>,
    pub cancel: CancellationToken,
}

impl Default for RebootOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }
}

impl RebootOptions {
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

async fn lookup(session: &Session, uuid: &str) -> Result<DomainHandle> {
    Ok(session.hv().lookup_by_uuid(uuid).await?)
}

#[instrument(skip(session), fields(vm_id = %uuid))]
pub async fn start(session: &Session, uuid: &str) -> Result<()> {
    let dom = lookup(session, uuid).await?;
    session.hv().create(&dom).await?;
    info!(name = %dom.name, "VM started");
    Ok(())
}

/// Graceful shutdown.
#[instrument(skip(session), fields(vm_id = %uuid))]
pub async fn shutdown(session: &Session, uuid: &str) -> Result<()> {
    let dom = lookup(session, uuid).await?;
    session.backend().shutdown(session.hv(), &dom).await?;
    info!(name = %dom.name, "VM shutdown requested");
    Ok(())
}

/// Hard power-off.
#[instrument(skip(session), fields(vm_id = %uuid))]
pub async fn destroy(session: &Session, uuid: &str) -> Result<()> {
    let dom = lookup(session, uuid).await?;
    session.hv().destroy(&dom).await?;
    info!(name = %dom.name, "VM destroyed");
    Ok(())
}

#[instrument(skip(session), fields(vm_id = %uuid))]
pub async fn suspend(session: &Session, uuid: &str) -> Result<()> {
    let dom = lookup(session, uuid).await?;
    session.hv().suspend(&dom).await?;
    info!(name = %dom.name, "VM suspended");
    Ok(())
}

#[instrument(skip(session), fields(vm_id = %uuid))]
pub async fn resume(session: &Session, uuid: &str) -> Result<()> {
    let dom = lookup(session, uuid).await?;
    session.hv().resume(&dom).await?;
    info!(name = %dom.name, "VM resumed");
    Ok(())
}

/// Remove the VM definition. Disk images are left alone.
#[instrument(skip(session), fields(vm_id = %uuid))]
pub async fn undeploy(session: &Session, uuid: &str) -> Result<()> {
    let dom = lookup(session, uuid).await?;
    session.hv().undefine(&dom).await?;
    info!(name = %dom.name, "VM undeployed");
    Ok(())
}

/// Reboot, falling back to shutdown + start on drivers without a native
/// reboot.
#[instrument(skip(session, options), fields(vm_id = %uuid))]
pub async fn reboot(session: &Session, uuid: &str, options: &RebootOptions) -> Result<()> {
    let dom = lookup(session, uuid).await?;

    match session.hv().reboot(&dom).await {
        Ok(()) => {
            info!(name = %dom.name, "VM rebooted");
            return Ok(());
        }
        Err(fault) if fault.is_no_support() => {
            debug!(name = %dom.name, "Native reboot unsupported, cycling power");
        }
        Err(fault) => return Err(fault.into()),
    }

    session.backend().shutdown(session.hv(), &dom).await?;
    wait_for_shutoff(session, &dom, options).await?;
    session.hv().create(&dom).await?;

    info!(name = %dom.name, "VM rebooted by power cycle");
    Ok(())
}

/// Poll until the domain reports shutoff.
///
/// The QEMU driver raises `OperationFailed` while a guest is going down;
/// those faults are skipped. Any other fault ends the wait.
async fn wait_for_shutoff(session: &Session, dom: &DomainHandle, options: &RebootOptions) -> Result<()> {
    let started = Instant::now();
    let mut polls: u32 = 0;

    loop {
        polls += 1;
        match session.hv().domain_info(dom).await {
            Ok(info) if info.state == RunState::Shutoff.code() => {
                debug!(polls, "Domain reached shutoff");
                return Ok(());
            }
            Ok(_) => {}
            Err(fault) if fault.is_transient_status_fault() => {
                warn!(%fault, "Transient status fault while waiting for shutoff");
            }
            Err(fault) => return Err(fault.into()),
        }

        if let Some(deadline) = options.deadline {
            if started.elapsed() >= deadline {
                return Err(VirtError::Timeout(format!(
                    "{} did not shut off within {:?}",
                    dom.name, deadline
                )));
            }
        }

        tokio::select! {
            _ = options.cancel.cancelled() => {
                return Err(VirtError::Cancelled(format!("reboot of {}", dom.name)));
            }
            _ = tokio::time::sleep(options.poll_interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendTools;
    use crate::connection::BackendConnection;
    use crate::error::{FaultCode, FaultDomain, HypervisorFault};
    use crate::mock::SimulatedHypervisor;
    use crate::shell::ScriptedRunner;
    use crate::traits::Hypervisor;
    use std::sync::Arc;

    const TEST_UUID: &str = "6695eb01-f6a4-8304-79aa-97f2502e193f";

    async fn session_on(sim: &SimulatedHypervisor) -> Session {
        BackendConnection::new(
            Vec::new(),
            Arc::new(sim.clone()),
            BackendTools::new(Arc::new(ScriptedRunner::new()), "/unused"),
        )
        .connect("test:///default")
        .await
        .unwrap()
    }

    fn transient() -> HypervisorFault {
        HypervisorFault::new(FaultCode::OperationFailed, FaultDomain::Qemu, "cannot acquire state change lock")
    }

    #[tokio::test]
    async fn test_direct_operations() {
        let sim = SimulatedHypervisor::default_node().unwrap();
        let session = session_on(&sim).await;

        suspend(&session, TEST_UUID).await.unwrap();
        resume(&session, TEST_UUID).await.unwrap();
        shutdown(&session, TEST_UUID).await.unwrap();
        start(&session, TEST_UUID).await.unwrap();
        destroy(&session, TEST_UUID).await.unwrap();
        undeploy(&session, TEST_UUID).await.unwrap();

        assert_eq!(
            sim.calls(),
            vec![
                "suspend:test",
                "resume:test",
                "shutdown:test",
                "create:test",
                "destroy:test",
                "undefine:test",
            ]
        );
        assert!(start(&session, TEST_UUID).await.is_err());
    }

    #[tokio::test]
    async fn test_native_reboot() {
        let sim = SimulatedHypervisor::default_node().unwrap();
        let session = session_on(&sim).await;

        reboot(&session, TEST_UUID, &RebootOptions::default()).await.unwrap();
        assert_eq!(sim.calls(), vec!["reboot:test"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reboot_fallback_tolerates_transient_faults() {
        let sim = SimulatedHypervisor::default_node().unwrap();
        sim.set_reboot_supported(false);
        sim.set_shutdown_lag(2);
        sim.inject_info_fault(transient());
        sim.inject_info_fault(transient());
        let session = session_on(&sim).await;

        reboot(&session, TEST_UUID, &RebootOptions::default()).await.unwrap();

        assert_eq!(sim.calls(), vec!["reboot:test", "shutdown:test", "create:test"]);
        let dom = sim.lookup_by_uuid(TEST_UUID).await.unwrap();
        assert_eq!(sim.domain_info(&dom).await.unwrap().state, RunState::Running.code());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reboot_fallback_other_fault_aborts() {
        let sim = SimulatedHypervisor::default_node().unwrap();
        sim.set_reboot_supported(false);
        sim.set_shutdown_lag(5);
        sim.inject_info_fault(HypervisorFault::new(FaultCode::NoDomain, FaultDomain::Qemu, "gone"));
        let session = session_on(&sim).await;

        let err = reboot(&session, TEST_UUID, &RebootOptions::default()).await.unwrap_err();
        assert!(matches!(err, VirtError::Backend(ref f) if f.code == FaultCode::NoDomain));
        assert_eq!(sim.calls(), vec!["reboot:test", "shutdown:test"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reboot_fallback_deadline() {
        let sim = SimulatedHypervisor::default_node().unwrap();
        sim.set_reboot_supported(false);
        sim.set_shutdown_lag(1000);
        let session = session_on(&sim).await;

        let options = RebootOptions::default().with_deadline(Duration::from_secs(5));
        let err = reboot(&session, TEST_UUID, &options).await.unwrap_err();
        assert!(matches!(err, VirtError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_reboot_fallback_cancelled() {
        let sim = SimulatedHypervisor::default_node().unwrap();
        sim.set_reboot_supported(false);
        sim.set_shutdown_lag(1000);
        let session = session_on(&sim).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let options = RebootOptions::default().with_cancel(cancel);

        let err = reboot(&session, TEST_UUID, &options).await.unwrap_err();
        assert!(matches!(err, VirtError::Cancelled(_)));
        assert_eq!(sim.calls(), vec!["reboot:test", "shutdown:test"]);
    }
}
