//! Pure(-ish) assembly of the complete hardware configuration from a VM's
//! configuration document, the parsed disk/dir-share specs, and the
//! resolved network plan (§4.6). The only side effect this component
//! performs itself is cloning a remote-image-ref disk through the
//! [`ImageCloner`] seam; everything else is just building a
//! [`HardwareRequest`] value for the backend to consume.

use crate::error::{Error, Result};
use crate::run_options::RunOptions;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use vmrun_core::{
    CachingMode, DirectorySharePlan, DiskAttachmentPlan, DiskImageLock, DiskLocation,
    HardwareRequest, HostCapabilities, NetworkPlan, SerialPlan, SyncMode, VmConfigDocument,
    VmDirectory,
};

/// The external collaborator that materializes a `remote-image-ref` disk
/// spec into a local image file (§4.1, §4.6). The registry client and image
/// builder/cloner both live outside this engine's scope (§1); this trait is
/// the seam the CLI wires a real implementation into.
pub trait ImageCloner: Send + Sync {
    /// Clones `reference` into a fresh temporary directory and returns the
    /// path to the cloned disk image. The caller (Device Assembly) owns the
    /// returned directory and unlinks it on any subsequent error or on
    /// normal process exit.
    fn clone_to_temp(&self, reference: &str) -> Result<PathBuf>;
}

/// Stand-in used when no registry/cloning collaborator is wired up (e.g. a
/// build without OCI support). Any attempt to attach a `remote-image-ref`
/// disk fails fast rather than silently no-opping.
pub struct NullImageCloner;

impl ImageCloner for NullImageCloner {
    fn clone_to_temp(&self, reference: &str) -> Result<PathBuf> {
        Err(Error::Unsupported(format!(
            "remote image references require the image subsystem, which is not configured (tried to resolve '{reference}')"
        )))
    }
}

/// A cloned remote-image-ref disk's temporary directory, unlinked on drop
/// per §5/§8's "on any error after clone, the temporary clone directory is
/// unlinked" resource-lifetime property.
pub struct ClonedDiskGuard {
    dir: PathBuf,
}

impl Drop for ClonedDiskGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

/// Everything Device Assembly produced: the request to hand the backend,
/// plus the scoped resources (cloned-disk guards, filter helper) that must
/// outlive the VM and be released on every exit path (§5, §9).
pub struct AssembledDevices {
    pub request: HardwareRequest,
    pub cloned_disk_guards: Vec<ClonedDiskGuard>,
    pub disk_image_locks: Vec<DiskImageLock>,
}

/// Builds the complete hardware configuration. Disks are resolved in
/// argument order; the root disk (built from `root_disk_options` against the
/// VM directory's root disk image) always comes first.
pub fn assemble(
    config: &VmConfigDocument,
    vm_dir: &VmDirectory,
    opts: &RunOptions,
    capabilities: &HostCapabilities,
    disk_plans: Vec<DiskAttachmentPlan>,
    dir_share_plans: Vec<DirectorySharePlan>,
    network: NetworkPlan,
    network_guest_fd: Option<RawFd>,
    cloner: &dyn ImageCloner,
) -> Result<AssembledDevices> {
    if opts.suspendable && !config.supports_save_restore() {
        return Err(Error::Unsupported(
            "--suspendable requires a macOS guest on the Mac platform class".to_string(),
        ));
    }

    let root_disk = DiskAttachmentPlan {
        location: DiskLocation::Image(vm_dir.root_disk_path()),
        read_only: false,
        sync_mode: parse_root_disk_sync(opts.root_disk_opts.as_deref()),
        caching_mode: parse_root_disk_caching(opts.root_disk_opts.as_deref()),
    };

    let mut resolved_disks = Vec::with_capacity(disk_plans.len());
    let mut cloned_disk_guards = Vec::new();
    let mut disk_image_locks = Vec::new();
    for plan in disk_plans {
        resolved_disks.push(resolve_disk(
            plan,
            capabilities,
            cloner,
            &mut cloned_disk_guards,
            &mut disk_image_locks,
        )?);
    }

    vmrun_core::validate_share_plans(&dir_share_plans).map_err(Error::Core)?;
    if !dir_share_plans.is_empty() && !capabilities.directory_sharing {
        return Err(Error::Unsupported(
            "directory sharing is not supported on this host".to_string(),
        ));
    }

    let serial = if let Some(path) = &opts.serial_path {
        SerialPlan::ExternalPath(path.clone())
    } else if opts.serial {
        SerialPlan::AllocatePty
    } else {
        SerialPlan::Disabled
    };

    let rosetta_tag = if config.guest_os == vmrun_core::GuestOs::Linux {
        opts.rosetta
            .clone()
            .filter(|_| capabilities.rosetta_translation)
    } else {
        None
    };

    let trackpad_enabled =
        config.guest_os == vmrun_core::GuestOs::Macos && !opts.no_trackpad;

    let request = HardwareRequest {
        config: config.clone(),
        root_disk,
        disks: resolved_disks,
        dir_shares: dir_share_plans,
        network,
        network_guest_fd,
        serial,
        rosetta_tag,
        nested: opts.nested,
        audio_enabled: !opts.no_audio,
        trackpad_enabled,
        root_disk_options: opts.root_disk_opts.clone(),
    };

    Ok(AssembledDevices {
        request,
        cloned_disk_guards,
        disk_image_locks,
    })
}

fn resolve_disk(
    plan: DiskAttachmentPlan,
    capabilities: &HostCapabilities,
    cloner: &dyn ImageCloner,
    guards: &mut Vec<ClonedDiskGuard>,
    locks: &mut Vec<DiskImageLock>,
) -> Result<DiskAttachmentPlan> {
    match &plan.location {
        DiskLocation::BlockDevice(path) if !capabilities.block_device_attach => {
            let _ = path;
            Err(Error::Unsupported(
                "attaching block devices is not supported on this host".to_string(),
            ))
        }
        DiskLocation::BlockDevice(path) => {
            open_block_device(path)?;
            Ok(plan)
        }
        DiskLocation::NetworkBlockDevice(_) if !capabilities.network_block_device => {
            Err(Error::Unsupported(
                "network block devices are not supported on this host".to_string(),
            ))
        }
        DiskLocation::RemoteImageRef(reference) => {
            let cloned_path = cloner.clone_to_temp(reference)?;
            let guard_dir = cloned_path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| cloned_path.clone());
            guards.push(ClonedDiskGuard { dir: guard_dir });
            if !plan.read_only {
                locks.push(DiskImageLock::try_acquire(&cloned_path).map_err(Error::Core)?);
            }
            Ok(DiskAttachmentPlan {
                location: DiskLocation::Image(cloned_path),
                ..plan
            })
        }
        // A writable local image attachment must not collide with another
        // VM (or another writable attachment) already holding it open; a
        // read-only attach never takes this lock (§3, §8 scenario 4).
        DiskLocation::Image(path) if !plan.read_only => {
            locks.push(DiskImageLock::try_acquire(path).map_err(Error::Core)?);
            Ok(plan)
        }
        _ => Ok(plan),
    }
}

/// Opens a block-device attachment to surface the concrete failure cause
/// (§7 `FailedToOpenBlockDevice`): the platform-reported `EBUSY`/`EACCES`
/// distinction, or a generic cause otherwise.
fn open_block_device(path: &Path) -> Result<()> {
    match std::fs::OpenOptions::new().read(true).write(true).open(path) {
        Ok(_file) => Ok(()),
        Err(e) => {
            let cause = match e.raw_os_error() {
                Some(code) if code == nix::errno::Errno::EBUSY as i32 => "EBUSY".to_string(),
                Some(code) if code == nix::errno::Errno::EACCES as i32 => "EACCES".to_string(),
                _ => e.to_string(),
            };
            Err(Error::Core(vmrun_core::Error::FailedToOpenBlockDevice {
                path: path.display().to_string(),
                cause,
            }))
        }
    }
}

fn parse_root_disk_sync(opts: Option<&str>) -> SyncMode {
    opts.and_then(|s| s.split(',').find_map(|tok| tok.strip_prefix("sync=")))
        .and_then(sync_mode_from_str)
        .unwrap_or_default()
}

fn parse_root_disk_caching(opts: Option<&str>) -> CachingMode {
    opts.and_then(|s| s.split(',').find_map(|tok| tok.strip_prefix("caching=")))
        .and_then(caching_mode_from_str)
        .unwrap_or_default()
}

fn sync_mode_from_str(value: &str) -> Option<SyncMode> {
    match value {
        "none" => Some(SyncMode::None),
        "fsync" => Some(SyncMode::Fsync),
        "full" => Some(SyncMode::Full),
        _ => None,
    }
}

fn caching_mode_from_str(value: &str) -> Option<CachingMode> {
    match value {
        "automatic" => Some(CachingMode::Automatic),
        "cached" => Some(CachingMode::Cached),
        "uncached" => Some(CachingMode::Uncached),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmrun_core::{DisplayGeometry, GuestOs, MacAddress, PlatformKind};

    fn config(guest_os: GuestOs, platform: PlatformKind) -> VmConfigDocument {
        VmConfigDocument {
            cpu_count: 2,
            memory_bytes: 1024,
            display: DisplayGeometry::default(),
            mac_address: MacAddress::generate(),
            guest_os,
            disk_format: vmrun_core::DiskFormatTag::Raw,
            hardware_model: vec![],
            platform,
            ecid: None,
        }
    }

    fn vm_dir() -> (tempfile::TempDir, VmDirectory) {
        let home = tempfile::tempdir().unwrap();
        let root = home.path().join("foo");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("config.json"), "{}").unwrap();
        let dir = VmDirectory::open(home.path(), "foo").unwrap();
        (home, dir)
    }

    #[test]
    fn suspendable_on_linux_guest_is_unsupported() {
        let (_home, dir) = vm_dir();
        let cfg = config(GuestOs::Linux, PlatformKind::Generic);
        let mut opts = RunOptions {
            name: "foo".to_string(),
            ..Default::default()
        };
        opts.suspendable = true;

        let err = assemble(
            &cfg,
            &dir,
            &opts,
            &HostCapabilities::default(),
            vec![],
            vec![],
            NetworkPlan::SharedNat,
            None,
            &NullImageCloner,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
    }

    #[test]
    fn trackpad_enabled_only_for_macos_guest() {
        let (_home, dir) = vm_dir();
        let linux_cfg = config(GuestOs::Linux, PlatformKind::Generic);
        let opts = RunOptions {
            name: "foo".to_string(),
            ..Default::default()
        };

        let assembled = assemble(
            &linux_cfg,
            &dir,
            &opts,
            &HostCapabilities::default(),
            vec![],
            vec![],
            NetworkPlan::SharedNat,
            None,
            &NullImageCloner,
        )
        .unwrap();
        assert!(!assembled.request.trackpad_enabled);
    }

    #[test]
    fn root_disk_defaults_to_full_sync_and_automatic_caching() {
        let (_home, dir) = vm_dir();
        let cfg = config(GuestOs::Linux, PlatformKind::Generic);
        let opts = RunOptions {
            name: "foo".to_string(),
            ..Default::default()
        };

        let assembled = assemble(
            &cfg,
            &dir,
            &opts,
            &HostCapabilities::default(),
            vec![],
            vec![],
            NetworkPlan::SharedNat,
            None,
            &NullImageCloner,
        )
        .unwrap();
        assert_eq!(assembled.request.root_disk.sync_mode, SyncMode::Full);
        assert_eq!(
            assembled.request.root_disk.caching_mode,
            CachingMode::Automatic
        );
    }

    #[test]
    fn remote_image_ref_without_cloner_support_fails() {
        let (_home, dir) = vm_dir();
        let cfg = config(GuestOs::Linux, PlatformKind::Generic);
        let opts = RunOptions {
            name: "foo".to_string(),
            ..Default::default()
        };
        let disk = DiskAttachmentPlan {
            location: DiskLocation::RemoteImageRef("ghcr.io/org/img:tag".to_string()),
            read_only: false,
            sync_mode: SyncMode::default(),
            caching_mode: CachingMode::default(),
        };

        let err = assemble(
            &cfg,
            &dir,
            &opts,
            &HostCapabilities::default(),
            vec![disk],
            vec![],
            NetworkPlan::SharedNat,
            None,
            &NullImageCloner,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
    }

    #[test]
    fn unnamed_shares_sharing_a_tag_is_rejected() {
        let (_home, dir) = vm_dir();
        let cfg = config(GuestOs::Linux, PlatformKind::Generic);
        let opts = RunOptions {
            name: "foo".to_string(),
            ..Default::default()
        };
        let a = vmrun_core::parse_dirshare_spec("/a:tag=shared").unwrap();
        let b = vmrun_core::parse_dirshare_spec("/b:tag=shared").unwrap();

        let err = assemble(
            &cfg,
            &dir,
            &opts,
            &HostCapabilities::default(),
            vec![],
            vec![a, b],
            NetworkPlan::SharedNat,
            None,
            &NullImageCloner,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Core(vmrun_core::Error::InvalidSpec { .. })));
    }

    #[test]
    fn read_only_extra_disk_does_not_take_a_write_lock() {
        let (_home, dir) = vm_dir();
        let cfg = config(GuestOs::Linux, PlatformKind::Generic);
        let opts = RunOptions {
            name: "foo".to_string(),
            ..Default::default()
        };
        let extra_path = _home.path().join("extra.img");
        std::fs::write(&extra_path, b"").unwrap();
        let extra = vmrun_core::parse_disk_spec(&format!("{}:ro", extra_path.display())).unwrap();

        let assembled = assemble(
            &cfg,
            &dir,
            &opts,
            &HostCapabilities::default(),
            vec![extra],
            vec![],
            NetworkPlan::SharedNat,
            None,
            &NullImageCloner,
        )
        .unwrap();
        assert!(assembled.disk_image_locks.is_empty());

        // A second writable attempt on the same path must still succeed,
        // proving the read-only attach above never locked it.
        vmrun_core::DiskImageLock::try_acquire(&extra_path).unwrap();
    }

    #[test]
    fn writable_extra_disk_already_locked_elsewhere_is_rejected() {
        let (_home, dir) = vm_dir();
        let cfg = config(GuestOs::Linux, PlatformKind::Generic);
        let opts = RunOptions {
            name: "foo".to_string(),
            ..Default::default()
        };
        let extra_path = _home.path().join("extra.img");
        std::fs::write(&extra_path, b"").unwrap();
        let extra = vmrun_core::parse_disk_spec(&extra_path.display().to_string()).unwrap();

        let _held = vmrun_core::DiskImageLock::try_acquire(&extra_path).unwrap();

        let err = assemble(
            &cfg,
            &dir,
            &opts,
            &HostCapabilities::default(),
            vec![extra],
            vec![],
            NetworkPlan::SharedNat,
            None,
            &NullImageCloner,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            Error::Core(vmrun_core::Error::DiskAlreadyInUse(_))
        ));
    }
}
