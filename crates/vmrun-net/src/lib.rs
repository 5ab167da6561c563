//! Data-plane plumbing consumed by Device Assembly and the Network Selector
//! (§4.5, §4.6): the anonymous socket pair handed to the guest network
//! device, and the subprocess wiring for the isolating filter helper.
//!
//! The helper's own packet processing is out of scope (§1) — this crate only
//! owns the boundary: spawning it, passing its arguments, and handing back
//! the host end of its data-plane socket.

mod error;
mod frame_io;

#[cfg(unix)]
mod filter_helper;
#[cfg(unix)]
mod socketpair;

pub use error::NetError as Error;
pub use error::Result;
pub use frame_io::FrameIO;

#[cfg(unix)]
pub use filter_helper::{ensure_setuid_bit, FilterHelperArgs, FilterHelperProcess};
#[cfg(unix)]
pub use socketpair::SocketPairDevice;
