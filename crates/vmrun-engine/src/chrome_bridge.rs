//! The three mutually exclusive display modes and the conversions between
//! the windowing world and the Lifecycle Controller's event model (§4.7).
//!
//! Native window management is platform-specific and lives above this
//! crate (the CLI adapter, or a future GUI host); this module only owns
//! the parts of the Chrome Bridge contract that are platform-independent:
//! the window-closed → lifecycle-event conversion, and remote-display URL
//! derivation/presentation.

use vmrun_core::{LifecycleEvent, NetworkPlan};

/// Converts a native-UI window-close event into the lifecycle event it
/// drives (§4.8): suspend if the VM supports it, else a plain stop.
pub fn window_closed_event(suspendable: bool) -> LifecycleEvent {
    if suspendable {
        LifecycleEvent::Suspend
    } else {
        LifecycleEvent::Stop
    }
}

/// Derives the URL at which the remote-display (integrated screen-sharing)
/// endpoint is reachable. For bridged networking the host component is
/// rewritten to the wildcard address so the URL is reachable from outside
/// the machine the engine runs on; for every other network mode, the VM's
/// display is only reachable via localhost.
pub fn derive_remote_display_url(port: u16, network: &NetworkPlan) -> String {
    let host = match network {
        NetworkPlan::Bridged(_) => "0.0.0.0",
        _ => "127.0.0.1",
    };
    format!("vnc://{host}:{port}")
}

/// Presents the remote-display URL: opens it with the platform's default
/// handler on an interactive session, otherwise prints it so a
/// non-interactive caller (CI, a script) can pick it up from stdout.
pub fn present_remote_display_url(url: &str, interactive: bool) {
    if interactive && open_locally(url).is_ok() {
        return;
    }
    println!("{url}");
}

#[cfg(unix)]
fn open_locally(url: &str) -> std::io::Result<()> {
    let status = std::process::Command::new("open").arg(url).status()?;
    if status.success() {
        Ok(())
    } else {
        Err(std::io::Error::other("'open' exited with a failure status"))
    }
}

#[cfg(not(unix))]
fn open_locally(_url: &str) -> std::io::Result<()> {
    Err(std::io::Error::other("no local opener available"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_closed_suspends_when_suspendable() {
        assert_eq!(window_closed_event(true), LifecycleEvent::Suspend);
    }

    #[test]
    fn window_closed_stops_when_not_suspendable() {
        assert_eq!(window_closed_event(false), LifecycleEvent::Stop);
    }

    #[test]
    fn bridged_network_rewrites_host_to_wildcard() {
        let url = derive_remote_display_url(5900, &NetworkPlan::Bridged(vec!["en0".to_string()]));
        assert_eq!(url, "vnc://0.0.0.0:5900");
    }

    #[test]
    fn shared_nat_keeps_localhost() {
        let url = derive_remote_display_url(5900, &NetworkPlan::SharedNat);
        assert_eq!(url, "vnc://127.0.0.1:5900");
    }
}
