use std::path::PathBuf;

/// Environment variable overriding the VM home directory (§6).
pub const HOME_ENV_VAR: &str = "TART_HOME";

/// Resolves the VM home directory: `TART_HOME` if set and non-empty, else a
/// default under the user's home directory.
pub fn resolve_vm_home() -> PathBuf {
    if let Ok(value) = std::env::var(HOME_ENV_VAR) {
        if !value.is_empty() {
            return PathBuf::from(value);
        }
    }

    let base = dirs_home().unwrap_or_else(|| PathBuf::from("."));
    base.join(".vmrun")
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn uses_tart_home_when_set() {
        let _guard = ENV_LOCK.lock().unwrap();
        // SAFETY: serialized via ENV_LOCK; no other thread reads/writes
        // TART_HOME concurrently with this test.
        unsafe {
            std::env::set_var(HOME_ENV_VAR, "/tmp/custom-home");
        }
        assert_eq!(resolve_vm_home(), PathBuf::from("/tmp/custom-home"));
        unsafe {
            std::env::remove_var(HOME_ENV_VAR);
        }
    }

    #[test]
    fn falls_back_to_default_when_empty() {
        let _guard = ENV_LOCK.lock().unwrap();
        unsafe {
            std::env::set_var(HOME_ENV_VAR, "");
        }
        let resolved = resolve_vm_home();
        assert!(resolved.ends_with(".vmrun"));
        unsafe {
            std::env::remove_var(HOME_ENV_VAR);
        }
    }
}
