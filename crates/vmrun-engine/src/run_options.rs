//! The un-validated option record the CLI adapter builds from argv (§2.1,
//! §6). Purely syntactic: types, repeatability and defaults only — no
//! mutual-exclusion validation. That happens in [`crate::network_selector`]
//! and [`crate::device_assembly`].

use std::path::PathBuf;

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub name: String,

    pub no_graphics: bool,
    pub graphics: bool,
    pub serial: bool,
    pub serial_path: Option<PathBuf>,
    pub no_audio: bool,
    pub recovery: bool,
    pub vnc: bool,
    pub vnc_experimental: bool,

    pub disks: Vec<String>,
    pub rosetta: Option<String>,
    pub dirs: Vec<String>,
    pub nested: bool,

    pub net_bridged: Vec<String>,
    pub net_softnet: bool,
    pub net_softnet_allow: Vec<String>,
    pub net_softnet_expose: Vec<String>,
    pub net_host: bool,

    pub root_disk_opts: Option<String>,
    pub suspendable: bool,
    pub captures_system_keys: bool,
    pub no_trackpad: bool,
}

/// The three mutually exclusive display modes (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayMode {
    NativeUi,
    RemoteDisplay,
    Headless,
}

impl RunOptions {
    /// Resolves the display mode implied by `--graphics`/`--no-graphics`/
    /// `--vnc`/`--vnc-experimental`. Mutual exclusion of `graphics` and
    /// `no_graphics` is enforced separately, before this is called.
    pub fn display_mode(&self) -> DisplayMode {
        if self.vnc || self.vnc_experimental {
            DisplayMode::RemoteDisplay
        } else if self.no_graphics {
            DisplayMode::Headless
        } else {
            DisplayMode::NativeUi
        }
    }

    /// Whether any `--net-bridged` value requests the informational
    /// interface listing rather than naming an interface to bridge to
    /// (§4.5).
    pub fn wants_bridge_listing(&self) -> bool {
        self.net_bridged.iter().any(|v| v == "list")
    }
}
