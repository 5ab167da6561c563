//! Chooses exactly one networking mode, validates the mutual-exclusion laws
//! the CLI adapter does not itself enforce, and — for the two modes that
//! need one — spawns the filter helper subprocess (§4.5).

use crate::error::{Error, Result};
use crate::run_options::{DisplayMode, RunOptions};
use std::os::fd::OwnedFd;
use vmrun_core::{HostCapabilities, MacAddress, NetworkPlan};
use vmrun_net::{FilterHelperArgs, FilterHelperProcess};

/// Name of the filter helper binary, looked up on `PATH` (§6).
const FILTER_HELPER_BINARY: &str = "vmrun-softnet";

/// Outcome of resolving `--net-*` flags: either a concrete plan to hand to
/// Device Assembly, or a request to print the host's bridgeable interfaces
/// and exit informationally (§4.5, scenario 5 in §8).
pub enum NetworkResolution {
    Plan(NetworkPlan),
    ListBridgeInterfaces,
}

/// Runs the full mutual-exclusion validation pass described in §4.5,
/// covering both networking and the unrelated display/nested flags that
/// share the same "fail fast with InvalidOptions" pass in the source
/// spec. Must run before any resource is acquired (§7).
pub fn validate_options(opts: &RunOptions, capabilities: &HostCapabilities) -> Result<()> {
    let net_variant_count = [
        !opts.net_bridged.is_empty(),
        opts.net_softnet
            || !opts.net_softnet_allow.is_empty()
            || !opts.net_softnet_expose.is_empty(),
        opts.net_host,
    ]
    .into_iter()
    .filter(|set| *set)
    .count();
    if net_variant_count > 1 {
        return Err(Error::InvalidOptions(
            "--net-bridged, --net-softnet and --net-host are mutually exclusive".to_string(),
        ));
    }

    if opts.graphics && opts.no_graphics {
        return Err(Error::InvalidOptions(
            "--graphics and --no-graphics are mutually exclusive".to_string(),
        ));
    }

    if opts.captures_system_keys && opts.display_mode() != DisplayMode::NativeUi {
        return Err(Error::InvalidOptions(
            "--captures-system-keys requires the native UI (not --no-graphics, --vnc or --vnc-experimental)"
                .to_string(),
        ));
    }

    if opts.nested && !capabilities.nested_virtualization {
        return Err(Error::Unsupported(
            "nested virtualization is not supported on this host".to_string(),
        ));
    }

    Ok(())
}

/// Resolves the networking mode implied by `--net-*` flags. Assumes
/// [`validate_options`] has already run.
pub fn resolve_network(opts: &RunOptions) -> NetworkResolution {
    if opts.wants_bridge_listing() {
        return NetworkResolution::ListBridgeInterfaces;
    }

    if !opts.net_bridged.is_empty() {
        return NetworkResolution::Plan(NetworkPlan::Bridged(opts.net_bridged.clone()));
    }

    if opts.net_host {
        return NetworkResolution::Plan(NetworkPlan::HostOnly(build_extra_args(opts)));
    }

    // Specifying any filter-subsystem sub-option implies isolated_filter
    // even without the bare `--net-softnet` flag (§4.5).
    if opts.net_softnet || !opts.net_softnet_allow.is_empty() || !opts.net_softnet_expose.is_empty()
    {
        return NetworkResolution::Plan(NetworkPlan::IsolatedFilter(build_extra_args(opts)));
    }

    NetworkResolution::Plan(NetworkPlan::SharedNat)
}

fn build_extra_args(opts: &RunOptions) -> Vec<String> {
    let mut args = Vec::new();
    for cidr in &opts.net_softnet_allow {
        args.push("--allow".to_string());
        args.push(cidr.clone());
    }
    for expose in &opts.net_softnet_expose {
        args.push("--expose".to_string());
        args.push(expose.clone());
    }
    args
}

/// Enumerates the host's bridgeable network interfaces for `--net-bridged
/// list` (§4.5). Uses `nix::ifaddrs` as the lowest-overhead way to list
/// interface names without shelling out.
pub fn list_bridge_interfaces() -> Result<Vec<String>> {
    use std::collections::BTreeSet;

    let addrs = nix::ifaddrs::getifaddrs().map_err(|e| Error::Io(std::io::Error::from(e)))?;
    let mut names: BTreeSet<String> = BTreeSet::new();
    for addr in addrs {
        if addr.interface_name != "lo0" {
            names.insert(addr.interface_name);
        }
    }
    Ok(names.into_iter().collect())
}

/// For `isolated_filter` and `host_only`, spawns the filter helper
/// subprocess and returns the guest-side fd to attach to the network device
/// plus the process handle for lifecycle ownership (§4.5, §5). On
/// interactive sessions, sets up the helper binary's privilege-escalation
/// bit before spawning (§4.5).
pub async fn spawn_filter_helper_if_needed(
    plan: &NetworkPlan,
    mac: MacAddress,
    interactive: bool,
) -> Result<Option<(FilterHelperProcess, OwnedFd)>> {
    if !plan.needs_filter_helper() {
        return Ok(None);
    }

    let extra_args = match plan {
        NetworkPlan::IsolatedFilter(args) | NetworkPlan::HostOnly(args) => args.clone(),
        _ => unreachable!("needs_filter_helper implies IsolatedFilter or HostOnly"),
    };

    if interactive {
        if let Ok(binary_path) = which::which(FILTER_HELPER_BINARY) {
            vmrun_net::ensure_setuid_bit(&binary_path);
        }
    }

    let args = FilterHelperArgs {
        mac_address: mac.to_string(),
        extra_args,
    };

    let (process, guest_fd) = FilterHelperProcess::spawn(FILTER_HELPER_BINARY, &args).await?;
    Ok(Some((process, guest_fd)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> RunOptions {
        RunOptions {
            name: "foo".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn default_plan_is_shared_nat() {
        let resolution = resolve_network(&opts());
        assert!(matches!(
            resolution,
            NetworkResolution::Plan(NetworkPlan::SharedNat)
        ));
    }

    #[test]
    fn bridged_list_is_informational() {
        let mut o = opts();
        o.net_bridged = vec!["list".to_string()];
        assert!(matches!(
            resolve_network(&o),
            NetworkResolution::ListBridgeInterfaces
        ));
    }

    #[test]
    fn softnet_allow_without_bare_flag_still_implies_isolated_filter() {
        let mut o = opts();
        o.net_softnet_allow = vec!["10.0.0.0/8".to_string()];
        assert!(matches!(
            resolve_network(&o),
            NetworkResolution::Plan(NetworkPlan::IsolatedFilter(_))
        ));
    }

    #[test]
    fn bridged_and_softnet_together_is_invalid() {
        let mut o = opts();
        o.net_bridged = vec!["en0".to_string()];
        o.net_softnet = true;
        let err = validate_options(&o, &HostCapabilities::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidOptions(_)));
    }

    #[test]
    fn bridged_and_host_together_is_invalid() {
        let mut o = opts();
        o.net_bridged = vec!["en0".to_string()];
        o.net_host = true;
        let err = validate_options(&o, &HostCapabilities::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidOptions(_)));
    }

    #[test]
    fn graphics_and_no_graphics_together_is_invalid() {
        let mut o = opts();
        o.graphics = true;
        o.no_graphics = true;
        let err = validate_options(&o, &HostCapabilities::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidOptions(_)));
    }

    #[test]
    fn captures_system_keys_with_vnc_is_invalid() {
        let mut o = opts();
        o.captures_system_keys = true;
        o.vnc = true;
        let err = validate_options(&o, &HostCapabilities::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidOptions(_)));
    }

    #[test]
    fn captures_system_keys_with_no_graphics_is_invalid() {
        let mut o = opts();
        o.captures_system_keys = true;
        o.no_graphics = true;
        let err = validate_options(&o, &HostCapabilities::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidOptions(_)));
    }

    #[test]
    fn captures_system_keys_with_native_ui_is_valid() {
        let mut o = opts();
        o.captures_system_keys = true;
        assert!(validate_options(&o, &HostCapabilities::default()).is_ok());
    }

    #[test]
    fn nested_without_capability_is_unsupported() {
        let mut o = opts();
        o.nested = true;
        let caps = HostCapabilities {
            nested_virtualization: false,
            ..HostCapabilities::default()
        };
        let err = validate_options(&o, &caps).unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
    }

    #[test]
    fn nested_with_capability_is_valid() {
        let mut o = opts();
        o.nested = true;
        let caps = HostCapabilities {
            nested_virtualization: true,
            ..HostCapabilities::default()
        };
        assert!(validate_options(&o, &caps).is_ok());
    }
}
