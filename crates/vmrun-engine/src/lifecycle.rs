//! The Lifecycle Controller: the core state machine driving a VM from a
//! bare VM Directory through to termination (§4.8). Owns the lock dance,
//! network/device assembly, signal and control-socket event multiplexing,
//! and the suspend/stop/request-stop transitions.

use crate::device_assembly::{self, ImageCloner};
use crate::error::{Error, Result};
use crate::network_selector::{self, NetworkResolution};
use crate::run_options::RunOptions;
use crate::{chrome_bridge, control_socket};
use nix::sys::signal::{sigprocmask, SigSet, SigmaskHow, Signal};
use std::os::fd::AsRawFd;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use vmrun_core::{
    BackendVmHandle, HomeLock, HostCapabilities, HypervisorBackend, LifecycleEvent,
    LifecycleState, StorageIndex, VmDirectory, VmLock,
};

/// Bounded timeout for telemetry flush on an uncaught error (§4.8).
const TELEMETRY_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Releases the staging copy of a saved-state blob (§5 scoped-release
/// discipline) once the backend is done consuming it, on every exit path.
struct RestoringStateGuard {
    path: std::path::PathBuf,
}

impl Drop for RestoringStateGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Fixed port the remote-display endpoint is published on. A future
/// revision may let the backend negotiate an ephemeral port instead.
const DEFAULT_REMOTE_DISPLAY_PORT: u16 = 5900;

pub struct LifecycleController {
    backend: Arc<dyn HypervisorBackend>,
    capabilities: HostCapabilities,
}

impl LifecycleController {
    pub fn new(backend: Arc<dyn HypervisorBackend>, capabilities: HostCapabilities) -> Self {
        Self {
            backend,
            capabilities,
        }
    }

    /// Drives one VM run to completion and returns the process exit code
    /// the CLI adapter should use (§6): 0 on a clean exit, 2 for the
    /// informational bridge-listing path, otherwise an error the caller
    /// turns into exit code 1.
    pub async fn run(
        &self,
        home: &Path,
        opts: RunOptions,
        cloner: &dyn ImageCloner,
        interactive: bool,
    ) -> Result<i32> {
        network_selector::validate_options(&opts, &self.capabilities)?;

        let vm_dir = VmDirectory::open(home, &opts.name).map_err(Error::Core)?;
        let mut config = vm_dir.load_config().map_err(Error::Core)?;

        if !self.capabilities.supports_disk_format(config.disk_format) {
            return Err(Error::Core(vmrun_core::Error::VmConfigurationError(
                format!(
                    "disk format {:?} is not supported on this host",
                    config.disk_format
                ),
            )));
        }

        let resolution = network_selector::resolve_network(&opts);
        let plan = match resolution {
            NetworkResolution::ListBridgeInterfaces => {
                for iface in network_selector::list_bridge_interfaces()? {
                    println!("{iface}");
                }
                return Ok(2);
            }
            NetworkResolution::Plan(plan) => plan,
        };

        tracing::debug!(state = ?LifecycleState::Configured, vm = %opts.name);

        let home_lock = HomeLock::acquire(home).map_err(Error::Core)?;
        let index = StorageIndex::new(home);
        if let Some(peer) = index
            .find_running_peer_with_mac(config.mac_address, vm_dir.name())
            .map_err(Error::Core)?
        {
            tracing::warn!(
                peer = peer.name(),
                mac = %config.mac_address,
                "MAC address collides with a running peer, regenerating"
            );
            config.mac_address = vmrun_core::MacAddress::generate();
            vm_dir.save_config(&config).map_err(Error::Core)?;
        }

        let vm_lock = match VmLock::try_acquire(&vm_dir) {
            Ok(lock) => lock,
            Err(e) => {
                home_lock.release().map_err(Error::Core)?;
                return Err(Error::Core(e));
            }
        };
        home_lock.release().map_err(Error::Core)?;

        tracing::debug!(state = ?LifecycleState::Locked, vm = vm_dir.name());

        let result = self
            .run_locked(home, &vm_dir, config, opts, plan, cloner, interactive)
            .await;

        if let Err(release_err) = vm_lock.release() {
            tracing::warn!(error = %release_err, "failed to release VM lock on exit");
        }

        result
    }

    async fn run_locked(
        &self,
        home: &Path,
        vm_dir: &VmDirectory,
        config: vmrun_core::VmConfigDocument,
        opts: RunOptions,
        plan: vmrun_core::NetworkPlan,
        cloner: &dyn ImageCloner,
        interactive: bool,
    ) -> Result<i32> {
        let (resume_state_path, _restoring_state_guard) =
            if vm_dir.suspended() && config.supports_save_restore() {
                println!("restoring VM state…");
                let path = vm_dir.take_saved_state().map_err(Error::Core)?;
                let guard = RestoringStateGuard { path: path.clone() };
                (Some(path), Some(guard))
            } else {
                (None, None)
            };

        let filter_helper =
            network_selector::spawn_filter_helper_if_needed(&plan, config.mac_address, interactive)
                .await?;
        let network_guest_fd = filter_helper.as_ref().map(|(_, fd)| fd.as_raw_fd());

        let disk_plans = opts
            .disks
            .iter()
            .map(|s| vmrun_core::parse_disk_spec(s))
            .collect::<vmrun_core::Result<Vec<_>>>()
            .map_err(Error::Core)?;
        let dir_share_plans = opts
            .dirs
            .iter()
            .map(|s| vmrun_core::parse_dirshare_spec(s))
            .collect::<vmrun_core::Result<Vec<_>>>()
            .map_err(Error::Core)?;

        let assembled = device_assembly::assemble(
            &config,
            vm_dir,
            &opts,
            &self.capabilities,
            disk_plans,
            dir_share_plans,
            plan.clone(),
            network_guest_fd,
            cloner,
        )?;

        tracing::debug!(state = ?LifecycleState::Starting, vm = vm_dir.name());

        // §4.8: signals are masked before the tokio listeners are installed
        // (so a signal delivered mid-registration doesn't fall through to
        // the default terminate disposition), then unblocked once the
        // listeners own the disposition.
        let mut mask = SigSet::empty();
        mask.add(Signal::SIGUSR1);
        mask.add(Signal::SIGUSR2);
        sigprocmask(SigmaskHow::SIG_BLOCK, Some(&mask), None).map_err(|e| {
            Error::Io(std::io::Error::from(e))
        })?;

        let mut sigint = signal(SignalKind::interrupt()).map_err(Error::Io)?;
        let mut sigusr1 = signal(SignalKind::user_defined1()).map_err(Error::Io)?;
        let mut sigusr2 = signal(SignalKind::user_defined2()).map_err(Error::Io)?;

        sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(&mask), None)
            .map_err(|e| Error::Io(std::io::Error::from(e)))?;

        let handle = match self
            .backend
            .start(&assembled.request, opts.recovery, resume_state_path.as_deref())
            .await
        {
            Ok(handle) => handle,
            Err(vmrun_core::Error::VirtualMachineLimitExceeded { .. }) => {
                let index = StorageIndex::new(home);
                let running_peers = index.running_peer_names(vm_dir.name());
                return Err(Error::Core(vmrun_core::Error::VirtualMachineLimitExceeded {
                    running_peers,
                }));
            }
            Err(e) => return Err(Error::Core(e)),
        };

        if let Some(pty_path) = handle.allocated_pty_path() {
            tracing::info!(path = %pty_path.display(), "serial console PTY allocated");
            println!("serial: {}", pty_path.display());
        }

        tracing::debug!(state = ?LifecycleState::Running, vm = vm_dir.name());

        if opts.display_mode() == crate::run_options::DisplayMode::RemoteDisplay {
            let url = chrome_bridge::derive_remote_display_url(DEFAULT_REMOTE_DISPLAY_PORT, &plan);
            chrome_bridge::present_remote_display_url(&url, interactive);
        }

        let (event_tx, mut event_rx) = mpsc::channel::<LifecycleEvent>(8);

        let control_socket_task = {
            let path = vm_dir.control_socket_path();
            let tx = event_tx.clone();
            tokio::spawn(async move {
                if let Err(e) = control_socket::serve(&path, tx).await {
                    tracing::warn!(error = %e, "control socket server exited");
                }
            })
        };

        let exit_code = self
            .drive_running(
                handle.as_ref(),
                &mut sigint,
                &mut sigusr1,
                &mut sigusr2,
                &mut event_rx,
                opts.suspendable,
                vm_dir,
            )
            .await;

        control_socket_task.abort();
        if let Some((process, _fd)) = filter_helper {
            let _ = process.terminate();
        }

        exit_code
    }

    async fn drive_running(
        &self,
        handle: &dyn BackendVmHandle,
        sigint: &mut tokio::signal::unix::Signal,
        sigusr1: &mut tokio::signal::unix::Signal,
        sigusr2: &mut tokio::signal::unix::Signal,
        events: &mut mpsc::Receiver<LifecycleEvent>,
        suspendable: bool,
        vm_dir: &VmDirectory,
    ) -> Result<i32> {
        loop {
            let event = tokio::select! {
                _ = sigint.recv() => LifecycleEvent::Stop,
                _ = sigusr1.recv() => LifecycleEvent::Suspend,
                _ = sigusr2.recv() => LifecycleEvent::RequestGuestStop,
                Some(event) = events.recv() => event,
                result = handle.wait() => {
                    return result.map_err(Error::Core);
                }
            };

            match event {
                LifecycleEvent::Stop => {
                    return self.stop_and_wait(handle).await;
                }
                LifecycleEvent::Suspend if suspendable => {
                    return self.suspend_and_exit(handle, vm_dir).await;
                }
                LifecycleEvent::Suspend => {
                    tracing::warn!("suspend requested but this VM is not suspendable; stopping instead");
                    return self.stop_and_wait(handle).await;
                }
                LifecycleEvent::RequestGuestStop => {
                    if let Err(e) = handle.request_guest_stop().await {
                        tracing::warn!(error = %e, "guest-stop request failed");
                    }
                }
            }
        }
    }

    async fn stop_and_wait(&self, handle: &dyn BackendVmHandle) -> Result<i32> {
        tracing::debug!(state = ?LifecycleState::Stopping);
        if let Err(e) = handle.kill().await {
            tracing::warn!(error = %e, "kill failed during stop");
        }
        let code = handle.wait().await.map_err(Error::Core)?;
        Ok(code)
    }

    async fn suspend_and_exit(&self, handle: &dyn BackendVmHandle, vm_dir: &VmDirectory) -> Result<i32> {
        tracing::debug!(state = ?LifecycleState::SnapshottingForSuspend);
        handle
            .pause()
            .await
            .map_err(|e| Error::SuspendFailed(e.to_string()))?;
        handle
            .save_state(&vm_dir.state_path())
            .await
            .map_err(|e| Error::SuspendFailed(e.to_string()))?;
        Ok(0)
    }
}

/// Reports an uncaught error to the telemetry collaborator and flushes it
/// with a bounded timeout before the process writes the error and exits
/// with code 1 (§4.8). The telemetry collaborator itself is an external,
/// best-effort concern: failure or timeout here never changes the exit
/// path, it only bounds how long the process waits for it.
pub async fn flush_telemetry_on_error<F>(flush: F)
where
    F: std::future::Future<Output = ()>,
{
    if tokio::time::timeout(TELEMETRY_FLUSH_TIMEOUT, flush)
        .await
        .is_err()
    {
        tracing::warn!("telemetry flush timed out before process exit");
    }
}

/// Converts a chrome-bridge window-close event into the lifecycle event it
/// drives, for callers that wire native windowing above this crate.
pub fn window_closed_event(suspendable: bool) -> LifecycleEvent {
    chrome_bridge::window_closed_event(suspendable)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_closed_delegates_to_chrome_bridge() {
        assert_eq!(window_closed_event(true), LifecycleEvent::Suspend);
        assert_eq!(window_closed_event(false), LifecycleEvent::Stop);
    }
}
