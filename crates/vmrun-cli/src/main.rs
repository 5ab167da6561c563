//! Thin argv-to-`RunOptions` adapter (§2.1, §6). Does only syntactic
//! parsing — types, repeatability, defaults — and leaves mutual-exclusion
//! validation to the engine's Network Selector and Device Assembly.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use vmrun_core::HypervisorBackend;
use vmrun_engine::{flush_telemetry_on_error, LifecycleController, NullImageCloner, RunOptions};

/// Run a virtual machine.
#[derive(Parser)]
#[command(name = "vmrun")]
#[command(about = "Runs a virtual machine on Apple's Virtualization.framework")]
#[command(version)]
struct Cli {
    /// Name of the VM directory under the VM home.
    name: String,

    /// Disable graphics; run headless.
    #[arg(long)]
    no_graphics: bool,

    /// Force the native graphical window.
    #[arg(long)]
    graphics: bool,

    /// Allocate a serial console on a fresh pseudo-terminal.
    #[arg(long)]
    serial: bool,

    /// Attach the serial console to an existing path instead of allocating one.
    #[arg(long)]
    serial_path: Option<PathBuf>,

    /// Disable the virtual sound device.
    #[arg(long)]
    no_audio: bool,

    /// Boot into recovery mode (macOS guests only).
    #[arg(long)]
    recovery: bool,

    /// Expose the display over VNC instead of the native window.
    #[arg(long)]
    vnc: bool,

    /// Expose the display over the experimental VNC server.
    #[arg(long)]
    vnc_experimental: bool,

    /// Additional disk to attach; repeatable. See the disk spec grammar.
    #[arg(long = "disk")]
    disks: Vec<String>,

    /// Share Rosetta translation into a Linux guest under the given mount tag.
    #[arg(long)]
    rosetta: Option<String>,

    /// Directory to share with the guest; repeatable. See the dir share spec grammar.
    #[arg(long = "dir")]
    dirs: Vec<String>,

    /// Enable nested virtualization in the guest.
    #[arg(long)]
    nested: bool,

    /// Bridge to a host network interface, or "list" to enumerate candidates; repeatable.
    #[arg(long = "net-bridged")]
    net_bridged: Vec<String>,

    /// Route guest traffic through the isolating filter helper subprocess.
    #[arg(long)]
    net_softnet: bool,

    /// CIDRs the filter helper allows outbound traffic to (requires `--net-softnet`).
    #[arg(long, value_delimiter = ',')]
    net_softnet_allow: Vec<String>,

    /// Port specs the filter helper exposes inbound to the guest (requires `--net-softnet`).
    #[arg(long, value_delimiter = ',')]
    net_softnet_expose: Vec<String>,

    /// Attach to the host's network namespace directly.
    #[arg(long)]
    net_host: bool,

    /// Options applied to the root disk attachment (sync/caching mode).
    #[arg(long)]
    root_disk_opts: Option<String>,

    /// Allow this VM to be suspended to disk (macOS guests on Mac platform only).
    #[arg(long)]
    suspendable: bool,

    /// Let the guest capture system keyboard shortcuts.
    #[arg(long)]
    captures_system_keys: bool,

    /// Disable the virtual trackpad (macOS guests only).
    #[arg(long)]
    no_trackpad: bool,
}

impl From<Cli> for RunOptions {
    fn from(cli: Cli) -> Self {
        RunOptions {
            name: cli.name,
            no_graphics: cli.no_graphics,
            graphics: cli.graphics,
            serial: cli.serial,
            serial_path: cli.serial_path,
            no_audio: cli.no_audio,
            recovery: cli.recovery,
            vnc: cli.vnc,
            vnc_experimental: cli.vnc_experimental,
            disks: cli.disks,
            rosetta: cli.rosetta,
            dirs: cli.dirs,
            nested: cli.nested,
            net_bridged: cli.net_bridged,
            net_softnet: cli.net_softnet,
            net_softnet_allow: cli.net_softnet_allow,
            net_softnet_expose: cli.net_softnet_expose,
            net_host: cli.net_host,
            root_disk_opts: cli.root_disk_opts,
            suspendable: cli.suspendable,
            captures_system_keys: cli.captures_system_keys,
            no_trackpad: cli.no_trackpad,
        }
    }
}

#[apple_main::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let interactive = std::io::IsTerminal::is_terminal(&std::io::stdout());
    let opts = RunOptions::from(cli);

    let home = vmrun_core::resolve_vm_home();
    let backend = Arc::new(vmrun_vz::NativeVirtualizationBackend::new());
    let capabilities = backend.capabilities().clone();
    let controller = LifecycleController::new(backend, capabilities);

    match controller.run(&home, opts, &NullImageCloner, interactive).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            // §7: report to telemetry and flush with a bounded timeout before
            // the error is written and the process exits. The telemetry
            // transport itself is an external collaborator (§1); there is
            // none wired up here, so the flush future is a no-op, but the
            // bounded wait still runs on every uncaught error.
            flush_telemetry_on_error(async {}).await;
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}
