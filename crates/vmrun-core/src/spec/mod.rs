mod disk;
mod network;
mod share;

pub use disk::{parse_disk_spec, CachingMode, DiskAttachmentPlan, DiskLocation, SyncMode};
pub use network::NetworkPlan;
pub use share::{
    parse_dirshare_spec, validate_share_plans, DirectorySharePlan, ShareSource, DEFAULT_MOUNT_TAG,
};
