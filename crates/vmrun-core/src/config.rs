use crate::types::{GuestOs, MacAddress};
use serde::{Deserialize, Serialize};

/// On-disk tag identifying the root disk image's format. Validated against
/// host support when a VM directory is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskFormatTag {
    Raw,
    Qcow2,
}

/// Platform class backing the hardware configuration; drives which
/// bootloader and platform-configuration object Device Assembly builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformKind {
    Mac,
    Generic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayGeometry {
    pub width: u32,
    pub height: u32,
}

impl Default for DisplayGeometry {
    fn default() -> Self {
        Self {
            width: 1024,
            height: 768,
        }
    }
}

/// The VM configuration document persisted as `config.json` inside a VM
/// Directory. This is also the target of the VM lock (§4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmConfigDocument {
    pub cpu_count: u32,
    pub memory_bytes: u64,
    #[serde(default)]
    pub display: DisplayGeometry,
    pub mac_address: MacAddress,
    pub guest_os: GuestOs,
    pub disk_format: DiskFormatTag,
    #[serde(default)]
    pub hardware_model: Vec<u8>,
    pub platform: PlatformKind,
    #[serde(default)]
    pub ecid: Option<Vec<u8>>,
}

impl VmConfigDocument {
    /// Whether this configuration's platform class supports save/restore to
    /// disk. Per §4.6, only macOS guests do.
    pub fn supports_save_restore(&self) -> bool {
        matches!(self.guest_os, GuestOs::Macos) && matches!(self.platform, PlatformKind::Mac)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let doc = VmConfigDocument {
            cpu_count: 4,
            memory_bytes: 4 * 1024 * 1024 * 1024,
            display: DisplayGeometry::default(),
            mac_address: MacAddress::new([0, 1, 2, 3, 4, 5]),
            guest_os: GuestOs::Linux,
            disk_format: DiskFormatTag::Raw,
            hardware_model: vec![1, 2, 3],
            platform: PlatformKind::Generic,
            ecid: None,
        };
        let json = serde_json::to_string(&doc).unwrap();
        let back: VmConfigDocument = serde_json::from_str(&json).unwrap();
        assert_eq!(back.cpu_count, 4);
        assert_eq!(back.mac_address, doc.mac_address);
    }

    #[test]
    fn macos_guest_on_mac_platform_supports_save_restore() {
        let doc = VmConfigDocument {
            cpu_count: 1,
            memory_bytes: 1024,
            display: DisplayGeometry::default(),
            mac_address: MacAddress::generate(),
            guest_os: GuestOs::Macos,
            disk_format: DiskFormatTag::Raw,
            hardware_model: vec![],
            platform: PlatformKind::Mac,
            ecid: None,
        };
        assert!(doc.supports_save_restore());
    }

    #[test]
    fn linux_guest_does_not_support_save_restore() {
        let doc = VmConfigDocument {
            cpu_count: 1,
            memory_bytes: 1024,
            display: DisplayGeometry::default(),
            mac_address: MacAddress::generate(),
            guest_os: GuestOs::Linux,
            disk_format: DiskFormatTag::Raw,
            hardware_model: vec![],
            platform: PlatformKind::Generic,
            ecid: None,
        };
        assert!(!doc.supports_save_restore());
    }
}
