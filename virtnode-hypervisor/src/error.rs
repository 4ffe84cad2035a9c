//! Error types for the virtualization abstraction layer.

use thiserror::Error;

/// Error code reported by a hypervisor driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultCode {
    /// The driver does not implement the requested call.
    NoSupport,
    /// The driver attempted the call and it failed.
    OperationFailed,
    /// The call is not valid in the domain's current state.
    OperationInvalid,
    /// No domain matched the lookup.
    NoDomain,
    /// Any other driver-specific code.
    Other(String),
}

/// Driver sub-system that raised a fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultDomain {
    Qemu,
    OpenVz,
    Test,
    Other(String),
}

/// An opaque failure raised by the underlying virtualization driver.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} ({domain:?}/{code:?})")]
pub struct HypervisorFault {
    pub code: FaultCode,
    pub domain: FaultDomain,
    pub message: String,
}

impl HypervisorFault {
    pub fn new(code: FaultCode, domain: FaultDomain, message: impl Into<String>) -> Self {
        Self {
            code,
            domain,
            message: message.into(),
        }
    }

    /// The driver reported that the call is not implemented.
    pub fn is_no_support(&self) -> bool {
        self.code == FaultCode::NoSupport
    }

    /// QEMU occasionally fails status queries while a guest is going down
    /// (see https://bugzilla.redhat.com/show_bug.cgi?id=519667). Those faults
    /// are safe to retry.
    pub fn is_transient_status_fault(&self) -> bool {
        self.code == FaultCode::OperationFailed && self.domain == FaultDomain::Qemu
    }
}

/// Errors that can occur during VM management operations.
#[derive(Error, Debug)]
pub enum VirtError {
    /// The backend URI is not in the configured allow-list.
    #[error("unsupported backend {0}")]
    UnsupportedBackend(String),

    /// Failed to open a connection to the hypervisor.
    #[error("Failed to connect to hypervisor: {0}")]
    ConnectionFailed(String),

    /// No default storage pool is configured.
    #[error("Storage pool not defined")]
    NoStoragePool,

    /// Deployment was requested without a template.
    #[error("Cannot deploy because template is '{0}'")]
    NoTemplate(String),

    /// The requested VM type has no backend.
    #[error("VM type '{0}' is not (yet) supported")]
    UnsupportedVmType(String),

    /// Template requirements do not fit the host.
    #[error("got errors {0:?}")]
    ResourceAdjustment(Vec<String>),

    /// Fault raised by the virtualization driver.
    #[error("Backend fault: {0}")]
    Backend(#[from] HypervisorFault),

    /// VM was not found.
    #[error("VM not found: {0}")]
    VmNotFound(String),

    /// A shell command exited with a non-zero status.
    #[error("Failed to execute command '{command}'. Status: '{status:?}'. Output: '{output}'")]
    Command {
        command: String,
        status: Option<i32>,
        output: String,
    },

    /// Template descriptor could not be used.
    #[error("Template error: {0}")]
    Template(String),

    /// XML generation/parsing error.
    #[error("XML error: {0}")]
    XmlError(String),

    /// Guest probe output did not have the expected shape.
    #[error("Failed to parse probe output: {0}")]
    Probe(String),

    /// The operation was cancelled by the caller.
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// The operation exceeded the caller's deadline.
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Filesystem or process I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<quick_xml::Error> for VirtError {
    fn from(e: quick_xml::Error) -> Self {
        VirtError::XmlError(e.to_string())
    }
}

impl From<serde_json::Error> for VirtError {
    fn from(e: serde_json::Error) -> Self {
        VirtError::Internal(format!("JSON error: {}", e))
    }
}

/// Result type alias for VM management operations.
pub type Result<T> = std::result::Result<T, VirtError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_status_fault() {
        let fault = HypervisorFault::new(FaultCode::OperationFailed, FaultDomain::Qemu, "monitor busy");
        assert!(fault.is_transient_status_fault());
        assert!(!fault.is_no_support());

        let other = HypervisorFault::new(FaultCode::OperationFailed, FaultDomain::Test, "boom");
        assert!(!other.is_transient_status_fault());
    }

    #[test]
    fn test_resource_adjustment_message_lists_errors() {
        let err = VirtError::ResourceAdjustment(vec!["too much memory".to_string()]);
        assert!(err.to_string().contains("too much memory"));
    }
}
