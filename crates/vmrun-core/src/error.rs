/// Errors surfaced by the VM directory model, spec parsers and lock manager.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid options: {0}")]
    InvalidOptions(String),

    #[error("invalid spec '{spec}': {reason}")]
    InvalidSpec { spec: String, reason: String },

    #[error("'{0}' looks like amd64 media and cannot run on this host")]
    ArchMismatch(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("VM '{0}' not found")]
    VmNotFound(String),

    #[error("VM '{0}' is already running")]
    VmAlreadyRunning(String),

    #[error("VM configuration error: {0}")]
    VmConfigurationError(String),

    #[error("failed to open block device '{path}': {cause}")]
    FailedToOpenBlockDevice { path: String, cause: String },

    #[error("disk image '{0}' is already in use by another VM")]
    DiskAlreadyInUse(String),

    #[error("virtual machine limit exceeded{}", running_peers_suffix(.running_peers))]
    VirtualMachineLimitExceeded { running_peers: Vec<String> },

    #[error("failed to suspend VM: {0}")]
    SuspendFailed(String),

    #[error("no bridged interface matches '{0}'")]
    NoBridgeInterface(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn running_peers_suffix(running_peers: &[String]) -> String {
    if running_peers.is_empty() {
        String::new()
    } else {
        format!(" (other running VMs: {})", running_peers.join(", "))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vm_already_running_message_names_the_vm() {
        let err = Error::VmAlreadyRunning("foo".to_string());
        assert_eq!(err.to_string(), "VM 'foo' is already running");
    }

    #[test]
    fn limit_exceeded_enriches_with_peer_names() {
        let err = Error::VirtualMachineLimitExceeded {
            running_peers: vec!["foo".to_string(), "bar".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "virtual machine limit exceeded (other running VMs: foo, bar)"
        );
    }

    #[test]
    fn limit_exceeded_with_no_peers_has_no_suffix() {
        let err = Error::VirtualMachineLimitExceeded {
            running_peers: vec![],
        };
        assert_eq!(err.to_string(), "virtual machine limit exceeded");
    }

    #[test]
    fn invalid_spec_includes_spec_and_reason() {
        let err = Error::InvalidSpec {
            spec: "a.img:caching=weird".to_string(),
            reason: "unknown caching mode 'weird'".to_string(),
        };
        assert!(err.to_string().contains("a.img:caching=weird"));
        assert!(err.to_string().contains("unknown caching mode"));
    }
}
