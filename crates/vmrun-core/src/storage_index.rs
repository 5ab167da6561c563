use crate::error::Result;
use crate::types::MacAddress;
use crate::vmdir::{VmDirectory, CONFIG_FILE_NAME};
use std::path::{Path, PathBuf};

/// Enumerates local VM directories under a home directory (§4.3). Used by
/// the Lifecycle Controller for MAC-collision detection and for enriching
/// `VirtualMachineLimitExceeded` with the names of other running VMs.
pub struct StorageIndex {
    home: PathBuf,
}

impl StorageIndex {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    /// Lists every subdirectory of `home` that looks like a VM directory
    /// (i.e. contains a `config.json`). Entries that fail to read are
    /// skipped rather than aborting the whole enumeration, since this is
    /// always used for best-effort lookups.
    pub fn list(&self) -> Vec<VmDirectory> {
        let Ok(entries) = std::fs::read_dir(&self.home) else {
            return vec![];
        };

        entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().join(CONFIG_FILE_NAME).is_file())
            .filter_map(|entry| {
                let name = entry.file_name().into_string().ok()?;
                Some(VmDirectory::from_path_unchecked(name, entry.path()))
            })
            .collect()
    }

    /// Finds a peer VM directory (excluding `exclude_name`) that is
    /// currently running with the given MAC address.
    pub fn find_running_peer_with_mac(
        &self,
        mac: MacAddress,
        exclude_name: &str,
    ) -> Result<Option<VmDirectory>> {
        for dir in self.list() {
            if dir.name() == exclude_name {
                continue;
            }
            let Ok(config) = dir.load_config() else {
                continue;
            };
            if config.mac_address == mac && dir.running().unwrap_or(false) {
                return Ok(Some(dir));
            }
        }
        Ok(None)
    }

    /// Best-effort enumeration of every VM directory that is currently
    /// running, excluding `exclude_name`. Failures enumerating a given
    /// directory are swallowed (§4.8).
    pub fn running_peer_names(&self, exclude_name: &str) -> Vec<String> {
        self.list()
            .into_iter()
            .filter(|dir| dir.name() != exclude_name)
            .filter(|dir| dir.running().unwrap_or(false))
            .map(|dir| dir.name().to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DiskFormatTag, DisplayGeometry, PlatformKind};
    use crate::types::GuestOs;
    use fs4::fs_std::FileExt;
    use std::fs::File;

    fn make_vm_dir(home: &Path, name: &str, mac: MacAddress) -> VmDirectory {
        let root = home.join(name);
        std::fs::create_dir_all(&root).unwrap();
        let dir = VmDirectory::from_path_unchecked(name.to_string(), root);
        dir.save_config(&crate::config::VmConfigDocument {
            cpu_count: 1,
            memory_bytes: 1024,
            display: DisplayGeometry::default(),
            mac_address: mac,
            guest_os: GuestOs::Linux,
            disk_format: DiskFormatTag::Raw,
            hardware_model: vec![],
            platform: PlatformKind::Generic,
            ecid: None,
        })
        .unwrap();
        dir
    }

    #[test]
    fn list_skips_directories_without_a_config() {
        let home = tempfile::tempdir().unwrap();
        make_vm_dir(home.path(), "foo", MacAddress::generate());
        std::fs::create_dir_all(home.path().join("not-a-vm")).unwrap();

        let index = StorageIndex::new(home.path());
        let names: Vec<_> = index.list().iter().map(|d| d.name().to_string()).collect();
        assert_eq!(names, vec!["foo".to_string()]);
    }

    #[test]
    fn finds_running_peer_with_matching_mac() {
        let home = tempfile::tempdir().unwrap();
        let mac = MacAddress::generate();
        let a = make_vm_dir(home.path(), "a", mac);
        make_vm_dir(home.path(), "b", mac);

        let held = File::open(a.config_path()).unwrap();
        held.lock_exclusive().unwrap();

        let index = StorageIndex::new(home.path());
        let peer = index.find_running_peer_with_mac(mac, "b").unwrap();
        assert_eq!(peer.unwrap().name(), "a");

        FileExt::unlock(&held).unwrap();
    }

    #[test]
    fn no_peer_found_when_macs_differ() {
        let home = tempfile::tempdir().unwrap();
        make_vm_dir(home.path(), "a", MacAddress::generate());

        let index = StorageIndex::new(home.path());
        let peer = index
            .find_running_peer_with_mac(MacAddress::generate(), "b")
            .unwrap();
        assert!(peer.is_none());
    }

    #[test]
    fn running_peer_names_excludes_self_and_non_running() {
        let home = tempfile::tempdir().unwrap();
        let a = make_vm_dir(home.path(), "a", MacAddress::generate());
        make_vm_dir(home.path(), "b", MacAddress::generate());

        let held = File::open(a.config_path()).unwrap();
        held.lock_exclusive().unwrap();

        let index = StorageIndex::new(home.path());
        let names = index.running_peer_names("a");
        assert_eq!(names, Vec::<String>::new());

        let names = index.running_peer_names("b");
        assert_eq!(names, vec!["a".to_string()]);

        FileExt::unlock(&held).unwrap();
    }
}
