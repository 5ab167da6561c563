//! Subprocess wiring for the isolating userspace packet filter helper
//! (§4.5, §6). The helper's own packet processing is an external
//! collaborator; this module only spawns it, passes it the VM's MAC and the
//! extra arguments derived from `--net-softnet-*`/`--net-host`, and hands
//! back the host end of the data-plane socket pair.

use crate::error::{NetError, Result};
use crate::socketpair::SocketPairDevice;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::Stdio;
use tokio::process::{Child, Command};

/// Well-known file descriptor the helper expects its end of the data-plane
/// socket pair on (§6).
pub const HELPER_SOCKET_FD: RawFd = 3;

/// Arguments passed to the filter helper subprocess.
#[derive(Debug, Clone)]
pub struct FilterHelperArgs {
    pub mac_address: String,
    pub extra_args: Vec<String>,
}

/// A spawned filter helper, owning its child process and the host end of its
/// data-plane socket. Dropping this does not kill the child; callers are
/// responsible for the scoped-release discipline in §5 (SIGTERM on engine
/// exit).
pub struct FilterHelperProcess {
    child: Child,
    host_device: SocketPairDevice,
}

impl FilterHelperProcess {
    /// Locates `binary_name` on `PATH`, spawns it with `args`, and wires a
    /// socketpair between host and guest: the guest fd is handed to Device
    /// Assembly for the virtio network device attachment, the host end is
    /// kept here for the userspace side.
    ///
    /// On interactive sessions the caller may want a setuid/setgid bit on
    /// the helper binary before spawning (§4.5); that privilege-escalation
    /// step is a host-specific, best-effort concern left to the caller
    /// (`ensure_setuid_bit`) rather than done unconditionally here.
    pub async fn spawn(binary_name: &str, args: &FilterHelperArgs) -> Result<(Self, OwnedFd)> {
        let binary_path = which::which(binary_name)
            .map_err(|_| NetError::HelperNotFound(binary_name.to_string()))?;

        let (host_device, guest_fd) = SocketPairDevice::new().map_err(NetError::Io)?;

        let mut command = Command::new(binary_path);
        command
            .arg("--mac")
            .arg(&args.mac_address)
            .args(&args.extra_args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        // SAFETY: dup2'ing the host-side fd of an already-created socketpair
        // into the child's fd table before exec; the fd is valid for the
        // lifetime of this closure and `pre_exec` runs in the forked child
        // before any other code executes.
        let helper_fd = host_device.as_raw_fd();
        unsafe {
            command.pre_exec(move || {
                if helper_fd != HELPER_SOCKET_FD {
                    nix::unistd::dup2(helper_fd, HELPER_SOCKET_FD)
                        .map_err(std::io::Error::from)?;
                }
                Ok(())
            });
        }

        let child = command.spawn().map_err(NetError::Io)?;

        Ok((
            Self {
                child,
                host_device,
            },
            guest_fd,
        ))
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Sends `SIGTERM` to the helper, per §5's scoped-release discipline on
    /// engine exit.
    pub fn terminate(&self) -> Result<()> {
        if let Some(pid) = self.child.id() {
            let pid = nix::unistd::Pid::from_raw(pid as i32);
            let _ = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM);
        }
        Ok(())
    }

    pub async fn wait(&mut self) -> Result<std::process::ExitStatus> {
        self.child.wait().await.map_err(NetError::Io)
    }

    pub fn host_device_mut(&mut self) -> &mut SocketPairDevice {
        &mut self.host_device
    }
}

/// Best-effort: sets the setuid bit on the helper binary so it can bind
/// privileged resources without running the whole engine as root. Failure
/// here is swallowed per §7's "best-effort auxiliary operation" rule — the
/// helper may simply run unprivileged.
#[cfg(unix)]
pub fn ensure_setuid_bit(binary_path: &std::path::Path) {
    use std::os::unix::fs::PermissionsExt;

    let Ok(metadata) = std::fs::metadata(binary_path) else {
        return;
    };
    let mut perms = metadata.permissions();
    let mode = perms.mode();
    if mode & 0o4000 == 0 {
        perms.set_mode(mode | 0o4000);
        let _ = std::fs::set_permissions(binary_path, perms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawn_fails_fast_when_binary_is_not_on_path() {
        let args = FilterHelperArgs {
            mac_address: "02:00:00:00:00:01".to_string(),
            extra_args: vec![],
        };
        let err = FilterHelperProcess::spawn("definitely-not-a-real-binary", &args)
            .await
            .unwrap_err();
        assert!(matches!(err, NetError::HelperNotFound(_)));
    }
}
