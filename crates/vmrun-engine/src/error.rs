/// Errors surfaced by the engine crate: the Network Selector, Device
/// Assembly, the Lifecycle Controller, and the ambient servers (§7).
/// Wraps `vmrun_core::Error` and `vmrun_net::Error` via `#[from]` rather than
/// re-deriving their variants.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] vmrun_core::Error),

    #[error(transparent)]
    Net(#[from] vmrun_net::Error),

    #[error("invalid options: {0}")]
    InvalidOptions(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("failed to suspend VM: {0}")]
    SuspendFailed(String),

    #[error("no bridged interface matches '{0}'")]
    NoBridgeInterface(String),

    #[error("hypervisor error: {0}")]
    Hypervisor(String),

    #[error("no virtualization backend is available on this host")]
    NoBackendAvailable,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
