//! SAFETY: `VZVirtualMachine` is not thread-safe and must only be accessed
//! from the main thread. This module uses `apple_main::on_main` to ensure
//! every VM operation happens on the main queue.
//!
//! Wires [`crate::vm::create_vm`]/`start_vm`/`restore_vm_state` together
//! behind the [`HypervisorBackend`] trait (§4.6, §4.8) — the seam the
//! Lifecycle Controller drives to start, resume, and obtain a handle for a
//! VM.

use crate::capabilities::{probe_host_capabilities, virtualization_supported};
use crate::handle::NativeVmHandle;
use crate::vm::{create_vm, restore_vm_state, start_vm};
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use vmrun_core::{
    BackendVmHandle, Error, HardwareRequest, HostCapabilities, HypervisorBackend, Result,
};

/// Bounded wait for the framework's `startWithCompletionHandler:` callback;
/// a VM that hasn't started within this window is treated as a failure
/// rather than hanging the Lifecycle Controller forever.
const START_TIMEOUT: Duration = Duration::from_secs(30);

pub struct NativeVirtualizationBackend {
    capabilities: HostCapabilities,
}

impl NativeVirtualizationBackend {
    pub fn new() -> Self {
        Self {
            capabilities: probe_host_capabilities(),
        }
    }
}

impl Default for NativeVirtualizationBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HypervisorBackend for NativeVirtualizationBackend {
    fn name(&self) -> &'static str {
        "native-virtualization"
    }

    fn capabilities(&self) -> &HostCapabilities {
        &self.capabilities
    }

    fn is_available(&self) -> bool {
        virtualization_supported()
    }

    async fn start(
        &self,
        request: &HardwareRequest,
        recovery: bool,
        resume_state: Option<&Path>,
    ) -> Result<Box<dyn BackendVmHandle>> {
        let (stop_tx, stop_rx) = std::sync::mpsc::sync_channel(1);

        let owned_request = request.clone();
        let built = apple_main::on_main(move || create_vm(&owned_request, stop_tx)).await?;

        if let Some(state_path) = resume_state {
            let state_path = state_path.to_path_buf();
            let vm_addr = built.vm_addr;
            let (restore_tx, restore_rx) = tokio::sync::oneshot::channel();
            apple_main::on_main(move || restore_vm_state(vm_addr, &state_path, restore_tx)).await;

            match restore_rx.await {
                Ok(Ok(())) => {}
                Ok(Err(msg)) => {
                    return Err(Error::VmConfigurationError(format!(
                        "failed to restore VM state: {msg}"
                    )));
                }
                Err(_) => {
                    return Err(Error::VmConfigurationError(
                        "restore-state result channel disconnected".to_string(),
                    ));
                }
            }
        }

        let vm_addr = built.vm_addr;
        let (start_tx, start_rx) = tokio::sync::oneshot::channel();
        apple_main::on_main(move || start_vm(vm_addr, recovery, start_tx)).await;

        match tokio::time::timeout(START_TIMEOUT, start_rx).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => {
                return Err(Error::VmConfigurationError(format!("VM start failed: {e}")));
            }
            Ok(Err(_)) => {
                return Err(Error::VmConfigurationError(
                    "VM start channel closed".to_string(),
                ));
            }
            Err(_) => {
                return Err(Error::VmConfigurationError("VM start timed out".to_string()));
            }
        }

        Ok(Box::new(NativeVmHandle::new(
            built.vm_addr,
            built.delegate_addr,
            None,
            None,
            stop_rx,
            built.allocated_pty_path,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_returns_correct_name() {
        let backend = NativeVirtualizationBackend::new();
        assert_eq!(backend.name(), "native-virtualization");
    }

    #[test]
    fn capabilities_only_advertise_raw_disk_format() {
        let backend = NativeVirtualizationBackend::new();
        assert!(backend
            .capabilities()
            .supports_disk_format(vmrun_core::DiskFormatTag::Raw));
        assert!(!backend
            .capabilities()
            .supports_disk_format(vmrun_core::DiskFormatTag::Qcow2));
    }

    #[test]
    fn default_creates_same_as_new() {
        let backend1 = NativeVirtualizationBackend::new();
        let backend2 = NativeVirtualizationBackend::default();
        assert_eq!(
            backend1.capabilities().network_block_device,
            backend2.capabilities().network_block_device
        );
    }
}
