//! usbmuxd wire-protocol client
//!
//! This module implements the client side of the usbmuxd plist protocol:
//! the 16-byte frame header, the Listen/Connect payloads and their replies,
//! and the session type that owns one connection to the daemon's UNIX
//! socket.
//!
//! # Wire Protocol
//!
//! ```text
//! +--------------+---------+---------+-------+----------------------+
//! | total_length | version | request |  tag  |     XML plist        |
//! +--------------+---------+---------+-------+----------------------+
//! |   u32 LE     | u32 LE  | u32 LE  | u32 LE| total_length - 16 B  |
//! +--------------+---------+---------+-------+----------------------+
//! ```
//!
//! `total_length` includes the header. `version` is 1 (plist), `request`
//! is 8 (plist payload), and `tag` is echoed in replies; the relay sends 1
//! and ignores the echo.

mod frame;
mod message;
mod session;

pub use frame::{FrameHeader, DEFAULT_TAG, HEADER_SIZE, PLIST_REQUEST, PLIST_VERSION};
pub use message::{
    build_connect, build_listen, parse_reply, swap_port, DeviceProperties, MuxEvent, Reply,
    ResultCode,
};
pub use session::MuxSession;
