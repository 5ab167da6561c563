//! Network selection, device assembly, lifecycle control and the ambient
//! servers (control socket, chrome bridge) that sit between the CLI
//! adapter and the platform hypervisor backends.

pub mod chrome_bridge;
pub mod control_socket;
pub mod device_assembly;
pub mod error;
pub mod lifecycle;
pub mod network_selector;
pub mod run_options;

pub use device_assembly::{AssembledDevices, ClonedDiskGuard, ImageCloner, NullImageCloner};
pub use error::{Error, Result};
pub use lifecycle::{flush_telemetry_on_error, LifecycleController};
pub use network_selector::NetworkResolution;
pub use run_options::{DisplayMode, RunOptions};
