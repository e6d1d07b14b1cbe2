//! Configuration types and loading
//!
//! This module holds the daemon settings and the user-supplied UDID to
//! local-port mapping, plus the line-oriented mapping-file parser.

mod loader;
mod types;

pub use loader::{load_mapping, parse_mapping_str};
pub use types::{
    Mapping, MappingEntry, Settings, DEFAULT_IDLE_TIMEOUT_SECS, DEFAULT_MAX_RETRIES,
    DEFAULT_PIDFILE_PATH, DEFAULT_RETRY_WAIT_SECS, DEFAULT_STATUS_PORT, DEFAULT_USBMUXD_SOCKET,
};
