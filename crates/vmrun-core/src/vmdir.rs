use crate::config::VmConfigDocument;
use crate::error::{Error, Result};
use crate::types::MacAddress;
use std::fs::File;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "config.json";
pub const ROOT_DISK_FILE_NAME: &str = "disk.img";
pub const NVRAM_FILE_NAME: &str = "nvram.bin";
pub const STATE_FILE_NAME: &str = "state.bin";
pub const CONTROL_SOCKET_NAME: &str = "sock";

/// Owns the on-disk layout of a single VM (§3, §6). Does not itself hold any
/// lock; the Lock Manager (`lock.rs`) operates on the paths this type
/// exposes.
#[derive(Debug, Clone)]
pub struct VmDirectory {
    name: String,
    root: PathBuf,
}

impl VmDirectory {
    /// Opens an existing VM directory. Fails with `VmNotFound` if the
    /// directory or its config document does not exist.
    pub fn open(home: &Path, name: &str) -> Result<Self> {
        let root = home.join(name);
        if !root.join(CONFIG_FILE_NAME).is_file() {
            return Err(Error::VmNotFound(name.to_string()));
        }
        Ok(Self {
            name: name.to_string(),
            root,
        })
    }

    /// Wraps a directory path without checking for the config file's
    /// presence; used by the Storage Index while enumerating candidates.
    pub(crate) fn from_path_unchecked(name: String, root: PathBuf) -> Self {
        Self { name, root }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE_NAME)
    }

    pub fn root_disk_path(&self) -> PathBuf {
        self.root.join(ROOT_DISK_FILE_NAME)
    }

    pub fn nvram_path(&self) -> PathBuf {
        self.root.join(NVRAM_FILE_NAME)
    }

    pub fn state_path(&self) -> PathBuf {
        self.root.join(STATE_FILE_NAME)
    }

    pub fn control_socket_path(&self) -> PathBuf {
        self.root.join(CONTROL_SOCKET_NAME)
    }

    /// `suspended(dir) ≡ saved-state blob is present` (§3).
    pub fn suspended(&self) -> bool {
        self.state_path().is_file()
    }

    /// `running(dir) ≡ another process holds an exclusive advisory lock on
    /// dir's config` (§3). This is a non-blocking probe: it takes and
    /// immediately releases a try-lock, so it must never be called while
    /// this process already holds the VM lock for `dir`.
    pub fn running(&self) -> Result<bool> {
        use fs4::fs_std::FileExt;

        let file = File::open(self.config_path())?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                fs4::fs_std::FileExt::unlock(&file)?;
                Ok(false)
            }
            Err(_) => Ok(true),
        }
    }

    pub fn load_config(&self) -> Result<VmConfigDocument> {
        let contents = std::fs::read_to_string(self.config_path())?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn save_config(&self, config: &VmConfigDocument) -> Result<()> {
        let contents = serde_json::to_string_pretty(config)?;
        std::fs::write(self.config_path(), contents)?;
        Ok(())
    }

    pub fn mac_address(&self) -> Result<MacAddress> {
        Ok(self.load_config()?.mac_address)
    }

    /// Removes the saved-state blob, e.g. after a successful restore. Per
    /// the end-to-end scenario in §8, this happens before `start(resume=true)`.
    pub fn remove_saved_state(&self) -> Result<()> {
        if self.state_path().is_file() {
            std::fs::remove_file(self.state_path())?;
        }
        Ok(())
    }

    /// Moves the saved-state blob aside to a staging path and returns that
    /// path. `suspended()` observes `false` immediately after this returns,
    /// matching the §8 scenario where `state.bin` disappears before
    /// `start(resume=true)` is invoked, while the bytes the backend needs to
    /// actually restore from are preserved at the returned path. The caller
    /// is responsible for removing the staging file once the backend is
    /// done with it (§5 scoped-release discipline).
    pub fn take_saved_state(&self) -> Result<PathBuf> {
        let staging = self.root.join(format!(".{STATE_FILE_NAME}.restoring"));
        std::fs::rename(self.state_path(), &staging)?;
        Ok(staging)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DiskFormatTag, DisplayGeometry, PlatformKind};
    use crate::types::GuestOs;

    fn sample_config() -> VmConfigDocument {
        VmConfigDocument {
            cpu_count: 2,
            memory_bytes: 2 * 1024 * 1024 * 1024,
            display: DisplayGeometry::default(),
            mac_address: MacAddress::generate(),
            guest_os: GuestOs::Linux,
            disk_format: DiskFormatTag::Raw,
            hardware_model: vec![],
            platform: PlatformKind::Generic,
            ecid: None,
        }
    }

    fn make_vm_dir(home: &Path, name: &str) -> VmDirectory {
        let root = home.join(name);
        std::fs::create_dir_all(&root).unwrap();
        let dir = VmDirectory::from_path_unchecked(name.to_string(), root);
        dir.save_config(&sample_config()).unwrap();
        dir
    }

    #[test]
    fn open_fails_when_config_missing() {
        let home = tempfile::tempdir().unwrap();
        let err = VmDirectory::open(home.path(), "missing").unwrap_err();
        assert!(matches!(err, Error::VmNotFound(_)));
    }

    #[test]
    fn open_succeeds_once_config_exists() {
        let home = tempfile::tempdir().unwrap();
        make_vm_dir(home.path(), "foo");
        assert!(VmDirectory::open(home.path(), "foo").is_ok());
    }

    #[test]
    fn suspended_reflects_state_file_presence() {
        let home = tempfile::tempdir().unwrap();
        let dir = make_vm_dir(home.path(), "foo");
        assert!(!dir.suspended());
        std::fs::write(dir.state_path(), b"state").unwrap();
        assert!(dir.suspended());
        dir.remove_saved_state().unwrap();
        assert!(!dir.suspended());
    }

    #[test]
    fn running_is_false_with_no_lock_held() {
        let home = tempfile::tempdir().unwrap();
        let dir = make_vm_dir(home.path(), "foo");
        assert!(!dir.running().unwrap());
    }

    #[test]
    fn running_is_true_while_another_handle_holds_the_lock() {
        use fs4::fs_std::FileExt;

        let home = tempfile::tempdir().unwrap();
        let dir = make_vm_dir(home.path(), "foo");

        let held = File::open(dir.config_path()).unwrap();
        held.lock_exclusive().unwrap();

        assert!(dir.running().unwrap());

        FileExt::unlock(&held).unwrap();
        assert!(!dir.running().unwrap());
    }

    #[test]
    fn config_round_trips_through_save_and_load() {
        let home = tempfile::tempdir().unwrap();
        let dir = make_vm_dir(home.path(), "foo");
        let loaded = dir.load_config().unwrap();
        assert_eq!(loaded.cpu_count, 2);
    }
}
