//! Libvirt hypervisor driver.
//!
//! Requires the `libvirt` feature and a system libvirt installation.

#[cfg(feature = "libvirt")]
mod backend;

#[cfg(feature = "libvirt")]
pub use backend::LibvirtHypervisor;

/// Check if the libvirt driver is compiled in.
pub fn is_available() -> bool {
    cfg!(feature = "libvirt")
}
