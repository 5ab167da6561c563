use crate::config::DiskFormatTag;

/// Host-platform capabilities relevant to the error taxonomy's `Unsupported`
/// kind (§7). Populated once per process by the hypervisor backend's
/// capability probe and consulted by the Network Selector and Device
/// Assembly before any resource is acquired.
#[derive(Debug, Clone)]
pub struct HostCapabilities {
    pub nested_virtualization: bool,
    pub rosetta_translation: bool,
    pub block_device_attach: bool,
    pub network_block_device: bool,
    pub directory_sharing: bool,
    pub save_restore: bool,
    pub supported_disk_formats: Vec<DiskFormatTag>,
}

impl HostCapabilities {
    pub fn supports_disk_format(&self, format: DiskFormatTag) -> bool {
        self.supported_disk_formats.contains(&format)
    }
}

impl Default for HostCapabilities {
    /// Conservative defaults used by tests and by any backend that has not
    /// run its probe yet: only the mandatory feature set.
    fn default() -> Self {
        Self {
            nested_virtualization: false,
            rosetta_translation: false,
            block_device_attach: true,
            network_block_device: true,
            directory_sharing: true,
            save_restore: true,
            supported_disk_formats: vec![DiskFormatTag::Raw],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_supports_raw_but_not_qcow2() {
        let caps = HostCapabilities::default();
        assert!(caps.supports_disk_format(DiskFormatTag::Raw));
        assert!(!caps.supports_disk_format(DiskFormatTag::Qcow2));
    }
}
