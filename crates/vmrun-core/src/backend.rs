use crate::capabilities::HostCapabilities;
use crate::config::VmConfigDocument;
use crate::error::Result;
use crate::spec::{DirectorySharePlan, DiskAttachmentPlan, NetworkPlan};
use async_trait::async_trait;
use std::os::fd::RawFd;
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncWrite};

/// Where the VM's serial console attaches.
#[derive(Debug, Clone)]
pub enum SerialPlan {
    /// Allocate a fresh pseudo-terminal; its path is reported once assigned.
    AllocatePty,
    /// Attach to a path the caller already provisioned.
    ExternalPath(PathBuf),
    Disabled,
}

/// The fully resolved inputs Device Assembly consumes to build a hardware
/// configuration. Everything here has already passed validation.
#[derive(Debug, Clone)]
pub struct HardwareRequest {
    pub config: VmConfigDocument,
    pub root_disk: DiskAttachmentPlan,
    pub disks: Vec<DiskAttachmentPlan>,
    pub dir_shares: Vec<DirectorySharePlan>,
    pub network: NetworkPlan,
    /// Guest-side fd of the filter helper's socket pair, present only when
    /// `network.needs_filter_helper()`.
    pub network_guest_fd: Option<RawFd>,
    pub serial: SerialPlan,
    pub rosetta_tag: Option<String>,
    pub nested: bool,
    pub audio_enabled: bool,
    pub trackpad_enabled: bool,
    pub root_disk_options: Option<String>,
}

pub type ConsoleStream = Box<dyn ConsoleIo + Send>;

pub trait ConsoleIo: AsyncRead + AsyncWrite + Unpin {}
impl<T: AsyncRead + AsyncWrite + Unpin> ConsoleIo for T {}

/// A running (or just-stopped) VM instance as seen by the Lifecycle
/// Controller. Implemented once per platform backend.
#[async_trait]
pub trait BackendVmHandle: Send + Sync {
    async fn is_running(&self) -> bool;
    /// Awaits the VM's natural exit. Resolves once whether it exits on its
    /// own (guest shutdown) or via `shutdown`/`kill`.
    async fn wait(&self) -> Result<i32>;
    /// Graceful ACPI-like stop request to the guest (SIGUSR2 / request-stop).
    async fn request_guest_stop(&self) -> Result<()>;
    /// Forceful stop (SIGINT path exhausted its graceful budget).
    async fn kill(&self) -> Result<()>;
    /// Pauses the VM in preparation for a state snapshot. Required before
    /// `save_state`.
    async fn pause(&self) -> Result<()>;
    /// Serializes the (paused) VM's live state to `path`.
    async fn save_state(&self, path: &std::path::Path) -> Result<()>;
    async fn console_stream(&self) -> Result<Option<ConsoleStream>>;
    /// Path of the pseudo-terminal allocated for the serial console, if any.
    fn allocated_pty_path(&self) -> Option<PathBuf>;
}

#[async_trait]
pub trait HypervisorBackend: Send + Sync {
    fn name(&self) -> &'static str;
    fn capabilities(&self) -> &HostCapabilities;
    fn is_available(&self) -> bool;
    /// Starts a VM fresh. `resume_state` is `Some(path)` when restoring from
    /// a previously saved snapshot (§4.8).
    async fn start(
        &self,
        request: &HardwareRequest,
        recovery: bool,
        resume_state: Option<&std::path::Path>,
    ) -> Result<Box<dyn BackendVmHandle>>;
}
