//! Settings and mapping types

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Default usbmuxd UNIX socket path
pub const DEFAULT_USBMUXD_SOCKET: &str = "/var/run/usbmuxd";

/// Default pidfile path
pub const DEFAULT_PIDFILE_PATH: &str = "/var/run/gandalf.pid";

/// Default status endpoint port (loopback only)
pub const DEFAULT_STATUS_PORT: u16 = 5000;

/// Default tunnel idle timeout in seconds
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 1800;

/// Default retry budget for supervised tasks
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default wait between retries in seconds
pub const DEFAULT_RETRY_WAIT_SECS: f64 = 2.0;

/// Daemon settings
///
/// Assembled by the CLI front-end and validated once at boot. The mapping
/// path is resolved to an absolute path by the supervisor so that reloads
/// survive a working-directory change after daemonizing.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Path to the usbmuxd UNIX socket
    pub usbmuxd_socket: PathBuf,
    /// Path to the mapping file
    pub mapping_path: PathBuf,
    /// Idle timeout for tunnel connections
    pub idle_timeout: Duration,
    /// Whether to serve the status endpoint
    pub status_enabled: bool,
    /// Status endpoint port on loopback
    pub status_port: u16,
    /// Retry budget for supervised tasks, must be in `1..20`
    pub max_retries: u32,
    /// Wait between retries, must be in `(0.0, 10.0)` seconds
    pub retry_wait: Duration,
    /// Detach from the terminal and write the pidfile
    pub daemonize: bool,
    /// Pidfile path
    pub pidfile_path: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            usbmuxd_socket: DEFAULT_USBMUXD_SOCKET.into(),
            mapping_path: PathBuf::new(),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            status_enabled: false,
            status_port: DEFAULT_STATUS_PORT,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_wait: Duration::from_secs_f64(DEFAULT_RETRY_WAIT_SECS),
            daemonize: false,
            pidfile_path: DEFAULT_PIDFILE_PATH.into(),
        }
    }
}

impl Settings {
    /// Validate the settings
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Validation` for any out-of-range knob.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mapping_path.as_os_str().is_empty() {
            return Err(ConfigError::validation("mapping path is required"));
        }
        if self.idle_timeout.is_zero() {
            return Err(ConfigError::validation("idle timeout must be positive"));
        }
        if !(1..20).contains(&self.max_retries) {
            return Err(ConfigError::validation(format!(
                "max retries {} out of range 1..20",
                self.max_retries
            )));
        }
        let wait = self.retry_wait.as_secs_f64();
        if wait <= 0.0 || wait >= 10.0 {
            return Err(ConfigError::validation(format!(
                "retry wait {wait}s out of range (0.0, 10.0)"
            )));
        }
        Ok(())
    }
}

/// One mapping entry: forward loopback:`local_port` to `device_port` on the
/// device identified by `udid`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingEntry {
    /// Device UDID
    pub udid: String,
    /// Local loopback port to listen on
    pub local_port: u16,
    /// Device-side TCP port to connect to
    pub device_port: u16,
}

/// Ordered collection of mapping entries
///
/// UDIDs may repeat when several local ports forward to different device
/// ports on the same device; `(udid, local_port)` is unique.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mapping {
    entries: Vec<MappingEntry>,
}

impl Mapping {
    /// Create a mapping, enforcing `(udid, local_port)` uniqueness
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::DuplicateEntry` on the first repeated pair.
    pub fn new(entries: Vec<MappingEntry>) -> Result<Self, ConfigError> {
        for (i, entry) in entries.iter().enumerate() {
            if entries[..i]
                .iter()
                .any(|e| e.udid == entry.udid && e.local_port == entry.local_port)
            {
                return Err(ConfigError::DuplicateEntry {
                    udid: entry.udid.clone(),
                    local_port: entry.local_port,
                });
            }
        }
        Ok(Self { entries })
    }

    /// Iterate over all entries in file order
    pub fn entries(&self) -> impl Iterator<Item = &MappingEntry> {
        self.entries.iter()
    }

    /// Iterate over the entries for one UDID
    pub fn for_udid<'a>(&'a self, udid: &'a str) -> impl Iterator<Item = &'a MappingEntry> {
        self.entries.iter().filter(move |e| e.udid == udid)
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the mapping is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
