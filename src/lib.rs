//! gandalf: usbmuxd TCP relay daemon
//!
//! This crate relays TCP connections from loopback ports on the host to
//! services running on USB-attached iOS devices, via the host's `usbmuxd`
//! UNIX socket. Point `ssh` at `127.0.0.1:2222` and the session is
//! tunneled to port 22 on the device named by your mapping file.
//!
//! # Architecture
//!
//! ```text
//! ssh → 127.0.0.1:2222 → tunnel worker → usbmuxd → device:22
//!                             ↑
//!                      device inventory
//!                  (attach/detach events)
//! ```
//!
//! The supervisor subscribes to usbmuxd attach/detach events, joins them
//! against the user-supplied `UDID:LOCAL_PORT[:DEVICE_PORT]` mapping, and
//! keeps one tunnel worker per matched entry. Each accepted local
//! connection opens a fresh usbmuxd connection, negotiates a Connect, and
//! splices bytes until either side closes or the idle timeout fires.
//!
//! # Modules
//!
//! - [`config`]: settings, mapping types, and the mapping-file parser
//! - [`control`]: exit codes, pidfile, control signals, daemonizing
//! - [`error`]: error types
//! - [`inventory`]: live device table joined against the mapping
//! - [`io`]: bidirectional splice with idle timeout
//! - [`muxd`]: usbmuxd wire-protocol client
//! - [`status`]: read-only status endpoint
//! - [`supervisor`]: boot, retry wrapper, signal-driven reload/shutdown
//! - [`tunnel`]: per-port tunnel workers

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod control;
pub mod error;
pub mod inventory;
pub mod io;
pub mod muxd;
pub mod status;
pub mod supervisor;
pub mod tunnel;

// Re-export commonly used types at the crate root
pub use config::{load_mapping, parse_mapping_str, Mapping, MappingEntry, Settings};
pub use control::{exit_code, ControlVerb};
pub use error::{
    ConfigError, ControlError, GandalfError, MuxError, ProtocolError, Result, TunnelError,
};
pub use inventory::{DeviceInventory, TunnelSpec};
pub use muxd::{
    build_connect, build_listen, parse_reply, swap_port, DeviceProperties, FrameHeader, MuxEvent,
    MuxSession, Reply, ResultCode,
};
pub use status::TunnelStatus;
pub use supervisor::{with_retries, Command, Supervisor};
pub use tunnel::{spawn_tunnel, TunnelHandle};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
