//! Probes the concrete host capabilities this backend can actually offer,
//! for the conservative [`vmrun_core::capabilities::HostCapabilities::default`]
//! to be replaced with before the engine's `--nested`/`--rosetta`/disk-format
//! checks run.

use objc2_virtualization::{VZLinuxRosettaDirectoryShare, VZVirtualMachine};
use vmrun_core::{DiskFormatTag, HostCapabilities};

/// Whether the host supports running virtual machines at all
/// (`VZVirtualMachine.isSupported`).
pub fn virtualization_supported() -> bool {
    VZVirtualMachine::isSupported()
}

/// Whether Rosetta translation is installed and can be shared into a Linux
/// guest (`VZLinuxRosettaDirectoryShare.availability`).
fn rosetta_available() -> bool {
    // SAFETY: `availability` is a read-only class property with no
    // preconditions beyond the framework being linked.
    unsafe { VZLinuxRosettaDirectoryShare::availability() == objc2_virtualization::VZLinuxRosettaDirectoryShareAvailability::Installed }
}

/// Whether nested virtualization is available on this host
/// (`VZGenericPlatformConfiguration.isNestedVirtualizationSupported`, Apple
/// silicon hosts running a new enough macOS only).
fn nested_virtualization_available() -> bool {
    objc2_virtualization::VZGenericPlatformConfiguration::isNestedVirtualizationSupported()
}

/// Runs the real capability probe for this host. Disk formats are limited to
/// `Raw` because `VZDiskImageStorageDeviceAttachment` only understands raw
/// image files; `network_block_device` is `false` because the framework has
/// no NBD client of its own.
pub fn probe_host_capabilities() -> HostCapabilities {
    HostCapabilities {
        nested_virtualization: nested_virtualization_available(),
        rosetta_translation: rosetta_available(),
        block_device_attach: true,
        network_block_device: false,
        directory_sharing: true,
        save_restore: true,
        supported_disk_formats: vec![DiskFormatTag::Raw],
    }
}
