pub mod async_fd;
pub mod backend;
pub mod capabilities;
pub mod config;
pub mod error;
pub mod home;
pub mod lifecycle;
pub mod lock;
pub mod spec;
pub mod storage_index;
pub mod types;
pub mod vmdir;

pub use async_fd::{AsyncOwnedFd, AsyncPipe};
pub use backend::{
    BackendVmHandle, ConsoleIo, ConsoleStream, HardwareRequest, HypervisorBackend, SerialPlan,
};
pub use capabilities::HostCapabilities;
pub use config::{DiskFormatTag, DisplayGeometry, PlatformKind, VmConfigDocument};
pub use error::{Error, Result};
pub use home::resolve_vm_home;
pub use lifecycle::{LifecycleEvent, LifecycleState};
pub use lock::{DiskImageLock, HomeLock, VmLock};
pub use spec::{
    parse_disk_spec, parse_dirshare_spec, validate_share_plans, CachingMode, DirectorySharePlan,
    DiskAttachmentPlan, DiskLocation, NetworkPlan, ShareSource, SyncMode, DEFAULT_MOUNT_TAG,
};
pub use storage_index::StorageIndex;
pub use types::{GuestOs, MacAddress};
pub use vmdir::VmDirectory;
