//! Native Virtualization.framework backend for macOS.
//!
//! Builds a `VZVirtualMachineConfiguration` from a [`vmrun_core::HardwareRequest`]
//! and drives it through Apple's Virtualization.framework directly (no vfkit
//! subprocess involved).

mod backend;
mod capabilities;
mod delegate;
mod handle;
mod vm;

pub use backend::NativeVirtualizationBackend;
pub use capabilities::probe_host_capabilities;
