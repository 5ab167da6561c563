use crate::error::{Error, Result};
use crate::vmdir::VmDirectory;
use fs4::fs_std::FileExt;
use std::fs::{File, OpenOptions};
use std::path::Path;

const HOME_LOCK_FILE_NAME: &str = ".home.lock";

/// Exclusive lock over the VM home directory (§4.4). Held only for the
/// short window in which the Lifecycle Controller checks MAC collisions
/// and decides whether to proceed; released as soon as the VM lock is
/// secured.
pub struct HomeLock {
    file: File,
}

impl HomeLock {
    /// Blocks until the lock is acquired. The home lock is a low-contention,
    /// short-held resource, so blocking acquisition (rather than try-lock)
    /// is appropriate here.
    pub fn acquire(home: &Path) -> Result<Self> {
        std::fs::create_dir_all(home)?;
        let path = home.join(HOME_LOCK_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        file.lock_exclusive()?;
        Ok(Self { file })
    }

    pub fn release(self) -> Result<()> {
        FileExt::unlock(&self.file)?;
        Ok(())
    }
}

/// Exclusive lock on a VM Directory's config file (§4.4). Acquisition is
/// non-blocking: contention means another engine instance already owns the
/// VM.
///
/// Ordering constraint (critical, see §4.4): callers must read the VM
/// configuration document into memory *before* constructing this lock.
/// Opening the file fresh here and reading it beforehand (rather than
/// reading through this same `File`) keeps the read from silently dropping
/// a lock a caller may have taken earlier on the same path via a different
/// file description.
pub struct VmLock {
    file: File,
    vm_name: String,
}

impl VmLock {
    pub fn try_acquire(dir: &VmDirectory) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(dir.config_path())?;
        file.try_lock_exclusive()
            .map_err(|_| Error::VmAlreadyRunning(dir.name().to_string()))?;
        Ok(Self {
            file,
            vm_name: dir.name().to_string(),
        })
    }

    pub fn vm_name(&self) -> &str {
        &self.vm_name
    }

    pub fn release(self) -> Result<()> {
        FileExt::unlock(&self.file)?;
        Ok(())
    }
}

/// Exclusive lock over a writable local disk image attachment (§7
/// `DiskAlreadyInUse`). Held for the lifetime of the attachment so a second
/// engine instance cannot attach the same image for writing underneath this
/// one; read-only attachments never take this lock (§8 scenario 4).
pub struct DiskImageLock {
    file: File,
}

impl DiskImageLock {
    pub fn try_acquire(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        file.try_lock_exclusive()
            .map_err(|_| Error::DiskAlreadyInUse(path.display().to_string()))?;
        Ok(Self { file })
    }
}

impl Drop for DiskImageLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DiskFormatTag, DisplayGeometry, PlatformKind};
    use crate::types::{GuestOs, MacAddress};

    fn make_vm_dir(home: &Path, name: &str) -> VmDirectory {
        let root = home.join(name);
        std::fs::create_dir_all(&root).unwrap();
        let dir = VmDirectory::from_path_unchecked(name.to_string(), root);
        dir.save_config(&crate::config::VmConfigDocument {
            cpu_count: 1,
            memory_bytes: 1024,
            display: DisplayGeometry::default(),
            mac_address: MacAddress::generate(),
            guest_os: GuestOs::Linux,
            disk_format: DiskFormatTag::Raw,
            hardware_model: vec![],
            platform: PlatformKind::Generic,
            ecid: None,
        })
        .unwrap();
        dir
    }

    mod home_lock {
        use super::*;

        #[test]
        fn acquire_then_release_does_not_error() {
            let home = tempfile::tempdir().unwrap();
            let lock = HomeLock::acquire(home.path()).unwrap();
            lock.release().unwrap();
        }

        #[test]
        fn creates_home_directory_if_missing() {
            let home = tempfile::tempdir().unwrap();
            let nested = home.path().join("nested");
            let lock = HomeLock::acquire(&nested).unwrap();
            assert!(nested.is_dir());
            lock.release().unwrap();
        }
    }

    mod disk_image_lock {
        use super::*;

        #[test]
        fn try_acquire_succeeds_when_uncontended() {
            let home = tempfile::tempdir().unwrap();
            let path = home.path().join("disk.img");
            std::fs::write(&path, b"").unwrap();
            DiskImageLock::try_acquire(&path).unwrap();
        }

        #[test]
        fn try_acquire_fails_when_already_locked() {
            use fs4::fs_std::FileExt;

            let home = tempfile::tempdir().unwrap();
            let path = home.path().join("disk.img");
            std::fs::write(&path, b"").unwrap();

            let held = File::open(&path).unwrap();
            held.lock_exclusive().unwrap();

            let err = DiskImageLock::try_acquire(&path).unwrap_err();
            assert!(matches!(err, Error::DiskAlreadyInUse(_)));

            FileExt::unlock(&held).unwrap();
        }

        #[test]
        fn releases_lock_on_drop() {
            let home = tempfile::tempdir().unwrap();
            let path = home.path().join("disk.img");
            std::fs::write(&path, b"").unwrap();

            {
                let _lock = DiskImageLock::try_acquire(&path).unwrap();
            }

            DiskImageLock::try_acquire(&path).unwrap();
        }
    }

    mod vm_lock {
        use super::*;

        #[test]
        fn try_acquire_succeeds_when_uncontended() {
            let home = tempfile::tempdir().unwrap();
            let dir = make_vm_dir(home.path(), "foo");
            let lock = VmLock::try_acquire(&dir).unwrap();
            assert_eq!(lock.vm_name(), "foo");
        }

        #[test]
        fn try_acquire_fails_with_vm_already_running_when_contended() {
            use fs4::fs_std::FileExt;

            let home = tempfile::tempdir().unwrap();
            let dir = make_vm_dir(home.path(), "foo");

            let held = File::open(dir.config_path()).unwrap();
            held.lock_exclusive().unwrap();

            let err = VmLock::try_acquire(&dir).unwrap_err();
            assert!(matches!(err, Error::VmAlreadyRunning(name) if name == "foo"));

            FileExt::unlock(&held).unwrap();
        }

        #[test]
        fn config_can_be_read_before_the_lock_is_taken() {
            let home = tempfile::tempdir().unwrap();
            let dir = make_vm_dir(home.path(), "foo");

            // Mirrors the ordering constraint in §4.4: read first, lock second.
            let config = dir.load_config().unwrap();
            let lock = VmLock::try_acquire(&dir).unwrap();

            assert_eq!(config.cpu_count, 1);
            lock.release().unwrap();
        }
    }
}
