//! Builds a `VZVirtualMachineConfiguration` from a [`vmrun_core::HardwareRequest`]
//! and starts the resulting `VZVirtualMachine`.

use crate::delegate::{StopSender, VmStateDelegate};
use block2::RcBlock;
use nix::pty::{OpenptyResult, openpty};
use objc2::rc::Retained;
use objc2::runtime::ProtocolObject;
use objc2::{AnyThread, MainThreadMarker};
use objc2_foundation::{NSArray, NSData, NSDictionary, NSError, NSString, NSURL};
use objc2_virtualization::{
    VZBridgedNetworkInterface, VZDirectorySharingDeviceConfiguration,
    VZDiskImageCachingMode, VZDiskImageStorageDeviceAttachment, VZDiskImageSynchronizationMode,
    VZEFIBootLoader, VZEFIVariableStore, VZEFIVariableStoreInitializationOptions,
    VZFileHandleNetworkDeviceAttachment, VZFileHandleSerialPortAttachment,
    VZGenericPlatformConfiguration, VZLinuxRosettaDirectoryShare, VZMacAuxiliaryStorage,
    VZMacAuxiliaryStorageInitializationOptions, VZMacHardwareModel, VZMacKeyboardConfiguration,
    VZMacMachineIdentifier, VZMacOSBootLoader, VZMacPlatformConfiguration,
    VZMacTrackpadConfiguration, VZMultipleDirectoryShare, VZNATNetworkDeviceAttachment,
    VZPlatformConfiguration, VZSharedDirectory,
    VZSingleDirectoryShare, VZStorageDeviceConfiguration, VZUSBKeyboardConfiguration,
    VZVirtioBlockDeviceConfiguration, VZVirtioConsoleDeviceSerialPortConfiguration,
    VZVirtioFileSystemDeviceConfiguration, VZVirtioNetworkDeviceConfiguration,
    VZVirtioSoundDeviceConfiguration, VZVirtioSoundDeviceInputStreamConfiguration,
    VZVirtioSoundDeviceOutputStreamConfiguration, VZVirtualMachine, VZVirtualMachineConfiguration,
};
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use vmrun_core::{
    CachingMode, DiskAttachmentPlan, DiskLocation, GuestOs, HardwareRequest, NetworkPlan,
    PlatformKind, SerialPlan, SyncMode,
};

pub struct BuiltVm {
    pub vm_addr: usize,
    pub delegate_addr: usize,
    /// Path of the pty slave allocated for the serial console, if
    /// `SerialPlan::AllocatePty` was requested. Interacting with the console
    /// happens by opening this path directly (`screen`/`tmux`), not through
    /// `BackendVmHandle::console_stream`.
    pub allocated_pty_path: Option<PathBuf>,
}

fn url_for(path: &Path) -> Retained<NSURL> {
    let path_str = path.to_string_lossy();
    NSURL::fileURLWithPath(&NSString::from_str(&path_str))
}

fn vm_error(context: &str, e: impl std::fmt::Display) -> vmrun_core::Error {
    vmrun_core::Error::VmConfigurationError(format!("{context}: {e}"))
}

/// Derives `nvram.bin`'s path from the root disk's, which is always
/// `vmrun_core::vmdir::ROOT_DISK_FILE_NAME` sitting next to it.
fn nvram_path(request: &HardwareRequest) -> PathBuf {
    match &request.root_disk.location {
        DiskLocation::Image(path) => path.with_file_name(vmrun_core::vmdir::NVRAM_FILE_NAME),
        other => unreachable!("root disk location is always Image, got {other:?}"),
    }
}

fn build_boot_loader_and_platform(
    request: &HardwareRequest,
) -> vmrun_core::Result<(Retained<objc2_virtualization::VZBootLoader>, Retained<VZPlatformConfiguration>)>
{
    let config = &request.config;
    match config.platform {
        PlatformKind::Mac => {
            let hw_model_data = NSData::with_bytes(&config.hardware_model);
            let hardware_model =
                unsafe { VZMacHardwareModel::alloc().initWithDataRepresentation(&hw_model_data) }
                    .ok_or_else(|| {
                        vm_error("hardware model", "invalid VZMacHardwareModel bytes")
                    })?;

            let ecid_bytes = config
                .ecid
                .as_ref()
                .ok_or_else(|| vm_error("machine identifier", "macOS guest is missing an ecid"))?;
            let ecid_data = NSData::with_bytes(ecid_bytes);
            let machine_identifier = unsafe {
                VZMacMachineIdentifier::alloc().initWithDataRepresentation(&ecid_data)
            }
            .ok_or_else(|| vm_error("machine identifier", "invalid VZMacMachineIdentifier bytes"))?;

            let aux_url = url_for(&nvram_path(request));
            let auxiliary_storage = if nvram_path(request).is_file() {
                unsafe { VZMacAuxiliaryStorage::alloc().initWithURL(&aux_url) }
            } else {
                unsafe {
                    VZMacAuxiliaryStorage::initCreatingStorageAtURL_hardwareModel_options_error(
                        VZMacAuxiliaryStorage::alloc(),
                        &aux_url,
                        &hardware_model,
                        VZMacAuxiliaryStorageInitializationOptions::empty(),
                    )
                }
                .map_err(|e| vm_error("creating NVRAM store", e))?
            };

            let platform = VZMacPlatformConfiguration::new();
            platform.setHardwareModel(&hardware_model);
            platform.setAuxiliaryStorage(Some(&auxiliary_storage));
            platform.setMachineIdentifier(&machine_identifier);

            let boot_loader = VZMacOSBootLoader::new();
            Ok((
                Retained::into_super(boot_loader),
                Retained::into_super(platform),
            ))
        }
        PlatformKind::Generic => {
            let store_url = url_for(&nvram_path(request));
            let variable_store = if nvram_path(request).is_file() {
                unsafe { VZEFIVariableStore::alloc().initWithURL(&store_url) }
            } else {
                unsafe {
                    VZEFIVariableStore::initCreatingVariableStoreAtURL_options_error(
                        VZEFIVariableStore::alloc(),
                        &store_url,
                        VZEFIVariableStoreInitializationOptions::empty(),
                    )
                }
                .map_err(|e| vm_error("creating EFI variable store", e))?
            };

            let boot_loader = VZEFIBootLoader::new();
            boot_loader.setVariableStore(Some(&variable_store));

            let platform = VZGenericPlatformConfiguration::new();
            if request.nested {
                platform.setNestedVirtualizationEnabled(true);
            }

            Ok((
                Retained::into_super(boot_loader),
                Retained::into_super(platform),
            ))
        }
    }
}

fn disk_attachment(
    plan: &DiskAttachmentPlan,
) -> vmrun_core::Result<Retained<VZDiskImageStorageDeviceAttachment>> {
    let path = match &plan.location {
        DiskLocation::Image(path) | DiskLocation::BlockDevice(path) => path,
        other => {
            return Err(vm_error(
                "disk attachment",
                format!("{other:?} cannot reach the Virtualization.framework backend"),
            ));
        }
    };
    let url = url_for(path);

    let caching_mode = match plan.caching_mode {
        CachingMode::Automatic => VZDiskImageCachingMode::Automatic,
        CachingMode::Cached => VZDiskImageCachingMode::Cached,
        CachingMode::Uncached => VZDiskImageCachingMode::Uncached,
        CachingMode::Unspecified => VZDiskImageCachingMode::Automatic,
    };
    let sync_mode = match plan.sync_mode {
        SyncMode::Full => VZDiskImageSynchronizationMode::Full,
        SyncMode::Fsync => VZDiskImageSynchronizationMode::Fsync,
        SyncMode::None => VZDiskImageSynchronizationMode::None,
    };

    unsafe {
        VZDiskImageStorageDeviceAttachment::initWithURL_readOnly_cachingMode_synchronizationMode_error(
            VZDiskImageStorageDeviceAttachment::alloc(),
            &url,
            plan.read_only,
            caching_mode,
            sync_mode,
        )
    }
    .map_err(|e| vm_error("disk attachment", e))
}

fn network_device(
    network: &NetworkPlan,
    guest_fd: Option<RawFd>,
    mac: &vmrun_core::MacAddress,
) -> vmrun_core::Result<Retained<VZVirtioNetworkDeviceConfiguration>> {
    let attachment: Retained<objc2_virtualization::VZNetworkDeviceAttachment> = match network {
        NetworkPlan::SharedNat => Retained::into_super(VZNATNetworkDeviceAttachment::new()),
        NetworkPlan::Bridged(interfaces) => {
            let wanted = interfaces
                .first()
                .ok_or_else(|| vm_error("bridged network", "no interface named"))?;
            let available = unsafe { VZBridgedNetworkInterface::networkInterfaces() };
            let matched = available
                .iter()
                .find(|iface| iface.identifier().to_string() == *wanted)
                .ok_or_else(|| {
                    vm_error(
                        "bridged network",
                        format!("host interface '{wanted}' is not bridgeable"),
                    )
                })?;
            Retained::into_super(
                objc2_virtualization::VZBridgedNetworkDeviceAttachment::initWithInterface(
                    objc2_virtualization::VZBridgedNetworkDeviceAttachment::alloc(),
                    &matched,
                ),
            )
        }
        NetworkPlan::IsolatedFilter(_) | NetworkPlan::HostOnly(_) => {
            let fd = guest_fd.ok_or_else(|| {
                vm_error(
                    "filter-helper network",
                    "missing guest-side socketpair fd",
                )
            })?;
            let handle = unsafe {
                objc2_foundation::NSFileHandle::initWithFileDescriptor(
                    objc2_foundation::NSFileHandle::alloc(),
                    fd,
                )
            };
            Retained::into_super(VZFileHandleNetworkDeviceAttachment::initWithFileHandle(
                VZFileHandleNetworkDeviceAttachment::alloc(),
                &handle,
            ))
        }
    };

    let config = VZVirtioNetworkDeviceConfiguration::new();
    config.setAttachment(Some(&attachment));
    let vz_mac = unsafe {
        objc2_virtualization::VZMACAddress::initWithString(
            objc2_virtualization::VZMACAddress::alloc(),
            &NSString::from_str(&mac.to_string()),
        )
    }
    .ok_or_else(|| vm_error("network device", "invalid MAC address string"))?;
    config.setMACAddress(&vz_mac);
    Ok(config)
}

/// Opens `path` read-write and wraps the resulting fd in an `NSFileHandle`
/// used for both the framework's read and write ends.
fn file_handle_attachment(
    path: &Path,
) -> vmrun_core::Result<Retained<VZFileHandleSerialPortAttachment>> {
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(vmrun_core::Error::Io)?;
    let fd = std::os::fd::IntoRawFd::into_raw_fd(file);
    let handle = unsafe {
        objc2_foundation::NSFileHandle::initWithFileDescriptor(
            objc2_foundation::NSFileHandle::alloc(),
            fd,
        )
    };
    Ok(unsafe {
        VZFileHandleSerialPortAttachment::initWithFileHandleForReading_fileHandleForWriting(
            VZFileHandleSerialPortAttachment::alloc(),
            Some(&handle),
            Some(&handle),
        )
    })
}

fn serial_port(
    plan: &SerialPlan,
) -> vmrun_core::Result<(
    Option<Retained<VZVirtioConsoleDeviceSerialPortConfiguration>>,
    Option<PathBuf>,
)> {
    let (attachment, pty_path) = match plan {
        SerialPlan::Disabled => return Ok((None, None)),
        SerialPlan::AllocatePty => {
            let OpenptyResult { master, slave } =
                openpty(None, None).map_err(|e| vm_error("pty allocation", e))?;
            let slave_path = nix::unistd::ttyname(&slave).map_err(|e| vm_error("pty allocation", e))?;
            drop(slave);

            // `NSFileHandle` takes ownership of the fd once constructed; the
            // master end is the framework's side of the pty from here on.
            let master_fd = std::os::fd::IntoRawFd::into_raw_fd(master);
            let handle = unsafe {
                objc2_foundation::NSFileHandle::initWithFileDescriptor(
                    objc2_foundation::NSFileHandle::alloc(),
                    master_fd,
                )
            };
            let attachment = unsafe {
                VZFileHandleSerialPortAttachment::initWithFileHandleForReading_fileHandleForWriting(
                    VZFileHandleSerialPortAttachment::alloc(),
                    Some(&handle),
                    Some(&handle),
                )
            };
            (attachment, Some(slave_path))
        }
        SerialPlan::ExternalPath(path) => (file_handle_attachment(path)?, None),
    };

    let config = VZVirtioConsoleDeviceSerialPortConfiguration::new();
    config.setAttachment(Some(&attachment));
    Ok((Some(config), pty_path))
}

fn directory_sharing_devices(
    request: &HardwareRequest,
) -> vmrun_core::Result<Vec<Retained<VZDirectorySharingDeviceConfiguration>>> {
    use std::collections::BTreeMap;

    let mut by_tag: BTreeMap<String, Vec<&vmrun_core::DirectorySharePlan>> = BTreeMap::new();
    for plan in &request.dir_shares {
        let tag = plan
            .mount_tag
            .clone()
            .unwrap_or_else(|| vmrun_core::DEFAULT_MOUNT_TAG.to_string());
        by_tag.entry(tag).or_default().push(plan);
    }

    let mut devices = Vec::with_capacity(by_tag.len());
    for (tag, plans) in by_tag {
        let fs_config = VZVirtioFileSystemDeviceConfiguration::initWithTag(
            VZVirtioFileSystemDeviceConfiguration::alloc(),
            &NSString::from_str(&tag),
        )
        .map_err(|e| vm_error("directory share tag", e))?;

        let shared_dirs: Vec<(String, Retained<VZSharedDirectory>)> = plans
            .iter()
            .map(|plan| {
                let path = match &plan.source {
                    vmrun_core::ShareSource::LocalPath(path) => PathBuf::from(path),
                    vmrun_core::ShareSource::RemoteArchiveUrl(url) => {
                        return Err(vmrun_core::Error::Unsupported(format!(
                            "remote archive directory shares require a fetch/extract step this backend does not perform (tried to resolve '{url}')"
                        )));
                    }
                };
                let url = url_for(&path);
                let dir = unsafe {
                    VZSharedDirectory::initWithURL_readOnly(
                        VZSharedDirectory::alloc(),
                        &url,
                        plan.read_only,
                    )
                };
                Ok((plan.name.clone().unwrap_or_default(), dir))
            })
            .collect::<vmrun_core::Result<_>>()?;

        let share: Retained<objc2_virtualization::VZDirectoryShare> = if shared_dirs.len() == 1 {
            Retained::into_super(VZSingleDirectoryShare::initWithDirectory(
                VZSingleDirectoryShare::alloc(),
                &shared_dirs[0].1,
            ))
        } else {
            let keys: Vec<Retained<NSString>> =
                shared_dirs.iter().map(|(name, _)| NSString::from_str(name)).collect();
            let values: Vec<&VZSharedDirectory> =
                shared_dirs.iter().map(|(_, dir)| dir.as_ref()).collect();
            let dict = NSDictionary::from_slices(
                &keys.iter().map(|k| k.as_ref()).collect::<Vec<_>>(),
                &values,
            );
            Retained::into_super(VZMultipleDirectoryShare::initWithDirectories(
                VZMultipleDirectoryShare::alloc(),
                &dict,
            ))
        };
        fs_config.setShare(Some(&share));
        devices.push(Retained::into_super(fs_config));
    }

    if let Some(rosetta_tag) = &request.rosetta_tag {
        let rosetta_share = unsafe { VZLinuxRosettaDirectoryShare::initWithError(VZLinuxRosettaDirectoryShare::alloc()) }
            .map_err(|e| vm_error("rosetta share", e))?;
        let fs_config = VZVirtioFileSystemDeviceConfiguration::initWithTag(
            VZVirtioFileSystemDeviceConfiguration::alloc(),
            &NSString::from_str(rosetta_tag),
        )
        .map_err(|e| vm_error("rosetta tag", e))?;
        fs_config.setShare(Some(&Retained::into_super(rosetta_share)));
        devices.push(Retained::into_super(fs_config));
    }

    Ok(devices)
}

fn audio_device() -> Retained<VZVirtioSoundDeviceConfiguration> {
    let sound = VZVirtioSoundDeviceConfiguration::new();
    let input = Retained::into_super(VZVirtioSoundDeviceInputStreamConfiguration::new());
    let output = Retained::into_super(VZVirtioSoundDeviceOutputStreamConfiguration::new());
    sound.setStreams(&NSArray::from_retained_slice(&[input, output]));
    sound
}

pub fn create_vm(request: &HardwareRequest, stop_sender: StopSender) -> vmrun_core::Result<BuiltVm> {
    // SAFETY: every objc2-virtualization call below follows the framework's
    // documented contract (non-null `alloc` targets, `error:` out-params
    // checked immediately, ownership of any fd handed to `NSFileHandle`
    // transferred exactly once). The resulting `VZVirtualMachine` is
    // converted to a raw pointer via `Retained::into_raw`; the caller
    // (`NativeVmHandle`) reclaims it on drop via `Retained::from_raw`.
    let vm_config = VZVirtualMachineConfiguration::new();

    let (boot_loader, platform) = build_boot_loader_and_platform(request)?;
    vm_config.setBootLoader(Some(&boot_loader));
    vm_config.setPlatform(Some(&platform));

    vm_config.setCPUCount(request.config.cpu_count as usize);
    vm_config.setMemorySize(request.config.memory_bytes);

    let mut all_disks: Vec<&DiskAttachmentPlan> = vec![&request.root_disk];
    all_disks.extend(request.disks.iter());
    let mut block_configs: Vec<Retained<VZStorageDeviceConfiguration>> =
        Vec::with_capacity(all_disks.len());
    for disk in all_disks {
        let attachment = disk_attachment(disk)?;
        let block_config = VZVirtioBlockDeviceConfiguration::initWithAttachment(
            VZVirtioBlockDeviceConfiguration::alloc(),
            &attachment,
        );
        block_configs.push(Retained::into_super(block_config));
    }
    vm_config.setStorageDevices(&NSArray::from_retained_slice(&block_configs));

    let net_config = network_device(
        &request.network,
        request.network_guest_fd,
        &request.config.mac_address,
    )?;
    vm_config.setNetworkDevices(&NSArray::from_retained_slice(&[Retained::into_super(
        net_config,
    )]));

    let (serial_config, allocated_pty_path) = serial_port(&request.serial)?;
    if let Some(serial_config) = serial_config {
        vm_config.setSerialPorts(&NSArray::from_retained_slice(&[Retained::into_super(
            serial_config,
        )]));
    }

    let dir_sharing_devices = directory_sharing_devices(request)?;
    if !dir_sharing_devices.is_empty() {
        vm_config.setDirectorySharingDevices(&NSArray::from_retained_slice(&dir_sharing_devices));
    }

    if request.audio_enabled {
        let audio_devices: Vec<Retained<objc2_virtualization::VZAudioDeviceConfiguration>> =
            vec![Retained::into_super(audio_device())];
        vm_config.setAudioDevices(&NSArray::from_retained_slice(&audio_devices));
    }

    let keyboard: Retained<objc2_virtualization::VZKeyboardConfiguration> =
        if request.config.guest_os == GuestOs::Macos {
            Retained::into_super(VZMacKeyboardConfiguration::new())
        } else {
            Retained::into_super(VZUSBKeyboardConfiguration::new())
        };
    vm_config.setKeyboards(&NSArray::from_retained_slice(&[keyboard]));

    if request.trackpad_enabled {
        let trackpad: Retained<objc2_virtualization::VZPointingDeviceConfiguration> =
            Retained::into_super(VZMacTrackpadConfiguration::new());
        vm_config.setPointingDevices(&NSArray::from_retained_slice(&[trackpad]));
    }

    vm_config
        .validateWithError()
        .map_err(|e| vm_error("VM configuration validation", e))?;

    let vm = VZVirtualMachine::initWithConfiguration(VZVirtualMachine::alloc(), &vm_config);

    let mtm = MainThreadMarker::new().expect("create_vm must run on the main thread");
    let delegate = VmStateDelegate::new(mtm, stop_sender);
    vm.setDelegate(Some(ProtocolObject::from_ref(&*delegate)));

    let vm_addr = Retained::into_raw(vm) as usize;
    let delegate_addr = Retained::into_raw(delegate) as usize;
    Ok(BuiltVm {
        vm_addr,
        delegate_addr,
        allocated_pty_path,
    })
}

/// Starts the VM, selecting the recovery-OS entry point via
/// `VZMacOSVirtualMachineStartOptions` when `recovery` is set (macOS guests
/// only; Apple's framework has no equivalent knob for Linux/generic guests,
/// so `recovery` is ignored there).
pub fn start_vm(
    vm_addr: usize,
    recovery: bool,
    result_tx: tokio::sync::oneshot::Sender<std::result::Result<(), String>>,
) {
    // SAFETY: see `create_vm`'s SAFETY note; this reclaims and re-leaks the
    // `VZVirtualMachine` pointer to call a method on it, exactly as the
    // teacher's start routine did.
    unsafe {
        let ptr = vm_addr as *mut VZVirtualMachine;
        let vm = Retained::from_raw(ptr).expect("invalid VM pointer");

        let result_tx = std::sync::Mutex::new(Some(result_tx));
        let completion_handler = RcBlock::new(move |error: *mut NSError| {
            if let Some(tx) = result_tx.lock().unwrap().take() {
                if error.is_null() {
                    let _ = tx.send(Ok(()));
                } else {
                    let err = &*error;
                    let _ = tx.send(Err(err.localizedDescription().to_string()));
                }
            }
        });
        std::mem::forget(completion_handler.clone());

        if recovery {
            let options = objc2_virtualization::VZMacOSVirtualMachineStartOptions::new();
            options.setStartUpFromMacOSRecovery(true);
            vm.startWithOptions_completionHandler(&options, &completion_handler);
        } else {
            vm.startWithCompletionHandler(&completion_handler);
        }

        let _ = Retained::into_raw(vm);
    }
}

/// Kicks off restoring the VM's live state from a previously saved snapshot
/// before `start_vm` is called (§4.8's `resume=true` path). Must run (via
/// the caller's `apple_main::on_main`) after `create_vm` and before
/// `start_vm`; the framework rejects a restore attempt once the machine has
/// already started. Mirrors `start_vm`'s split between the synchronous
/// main-thread trigger and the caller awaiting `result_tx` off-thread.
pub fn restore_vm_state(
    vm_addr: usize,
    path: &Path,
    result_tx: tokio::sync::oneshot::Sender<std::result::Result<(), String>>,
) {
    let url = url_for(path);

    // SAFETY: see `create_vm`'s SAFETY note; reclaims and re-leaks the
    // `VZVirtualMachine` pointer to call a method on it.
    unsafe {
        let ptr = vm_addr as *mut VZVirtualMachine;
        let vm = Retained::from_raw(ptr).expect("invalid VM pointer");

        let result_tx = std::sync::Mutex::new(Some(result_tx));
        let completion_handler = RcBlock::new(move |error: *mut NSError| {
            if let Some(tx) = result_tx.lock().unwrap().take() {
                if error.is_null() {
                    let _ = tx.send(Ok(()));
                } else {
                    let _ = tx.send(Err((*error).localizedDescription().to_string()));
                }
            }
        });
        std::mem::forget(completion_handler.clone());

        vm.restoreMachineStateFromURL_completionHandler(&url, &completion_handler);

        let _ = Retained::into_raw(vm);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nvram_path_sits_next_to_root_disk() {
        let request = HardwareRequest {
            config: sample_config(),
            root_disk: DiskAttachmentPlan {
                location: DiskLocation::Image(PathBuf::from("/tmp/vm/disk.img")),
                read_only: false,
                sync_mode: SyncMode::default(),
                caching_mode: CachingMode::default(),
            },
            disks: vec![],
            dir_shares: vec![],
            network: NetworkPlan::SharedNat,
            network_guest_fd: None,
            serial: SerialPlan::Disabled,
            rosetta_tag: None,
            nested: false,
            audio_enabled: true,
            trackpad_enabled: false,
            root_disk_options: None,
        };
        assert_eq!(nvram_path(&request), PathBuf::from("/tmp/vm/nvram.bin"));
    }

    fn sample_config() -> vmrun_core::VmConfigDocument {
        vmrun_core::VmConfigDocument {
            cpu_count: 2,
            memory_bytes: 1024,
            display: vmrun_core::DisplayGeometry::default(),
            mac_address: vmrun_core::MacAddress::generate(),
            guest_os: GuestOs::Linux,
            disk_format: vmrun_core::DiskFormatTag::Raw,
            hardware_model: vec![],
            platform: PlatformKind::Generic,
            ecid: None,
        }
    }
}
