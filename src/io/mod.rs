//! I/O utilities for gandalf
//!
//! Bidirectional byte splicing between an accepted local TCP connection
//! and a usbmuxd tunnel stream, with idle-timeout enforcement.

mod splice;

pub use splice::{splice_with_idle_timeout, SpliceResult, RELAY_BUFFER_SIZE};
