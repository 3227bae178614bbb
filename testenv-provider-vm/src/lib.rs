//! Hypervisor-backed testenv provider.
//!
//! Materializes SSH key pairs, libvirt networks and VMs on the host:
//! COW disk overlays, cloud-init media, domain definitions, DHCP/ARP IP
//! resolution and SSH readiness. All hypervisor access goes through the
//! [`hypervisor::Hypervisor`] seam so the logic is testable without a
//! host.

pub mod cloudinit;
pub mod domain;
pub mod host;
pub mod hypervisor;
pub mod keys;
pub mod network;
pub mod provider;
pub mod readiness;

pub use provider::VmProvider;
