//! Error types for gandalf
//!
//! This module defines the error hierarchy for the relay daemon. All errors
//! are categorized by subsystem and carry enough context to decide whether
//! the supervisor should retry, keep running, or terminate with a specific
//! exit code.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::control::exit_code;

/// Top-level error type for gandalf
#[derive(Debug, Error)]
pub enum GandalfError {
    /// Configuration errors (mapping parsing, settings validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// usbmuxd wire-protocol errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Mux session transport errors
    #[error("Mux session error: {0}")]
    Mux(#[from] MuxError),

    /// Tunnel worker errors
    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    /// Pidfile and control-signal errors
    #[error("Control error: {0}")]
    Control(#[from] ControlError),

    /// Task was cancelled; not a failure
    #[error("cancelled")]
    Cancelled,

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl GandalfError {
    /// Check if this error is recoverable (the retry wrapper may retry)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(e) => e.is_recoverable(),
            Self::Protocol(_) => true,
            Self::Mux(e) => e.is_recoverable(),
            Self::Tunnel(e) => e.is_recoverable(),
            Self::Control(_) => false,
            Self::Cancelled => false,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }

    /// Check if this error represents cancellation rather than failure
    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Map this error to the daemon's process exit code
    ///
    /// Exit codes: `0` normal, `2` pidfile permission, `3` control signal
    /// permission, `4` unhandled, `5` stale pidfile, `6` address in use.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Cancelled => exit_code::OK,
            Self::Control(ControlError::PidfilePermission { .. }) => exit_code::PIDFILE_PERMISSION,
            Self::Control(ControlError::SignalPermission { .. }) => exit_code::SIGNAL_PERMISSION,
            Self::Control(ControlError::StaleProcess { .. })
            | Self::Control(ControlError::PidfileUnreadable { .. }) => exit_code::STALE_PIDFILE,
            Self::Tunnel(TunnelError::Bind { source, .. })
                if source.kind() == io::ErrorKind::AddrInUse =>
            {
                exit_code::ADDR_IN_USE
            }
            Self::Io(e) if e.kind() == io::ErrorKind::AddrInUse => exit_code::ADDR_IN_USE,
            _ => exit_code::UNHANDLED,
        }
    }
}

/// usbmuxd wire-protocol errors
///
/// Raised while encoding or decoding frames and plist payloads. A protocol
/// error closes the owning mux session; it never terminates the daemon.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Fewer than 16 header bytes could be read
    #[error("truncated frame header")]
    TruncatedHeader,

    /// Header declared a total length smaller than the header itself
    #[error("invalid frame length {0} (minimum 16)")]
    BadLength(u32),

    /// Reply carried a MessageType this client does not understand
    #[error("unknown reply type: {0}")]
    UnknownReply(String),

    /// Result reply carried a number outside the closed set {0, 2, 3, 5}
    #[error("unknown result number: {0}")]
    UnknownResultNumber(u64),

    /// A required field was absent from a reply dictionary
    #[error("missing field in reply: {0}")]
    MissingField(&'static str),

    /// Payload was not a plist dictionary or failed to (de)serialize
    #[error("plist error: {0}")]
    Plist(#[from] plist::Error),

    /// Socket failed mid-frame
    #[error("frame I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Mux session transport errors
#[derive(Debug, Error)]
pub enum MuxError {
    /// Could not reach the usbmuxd socket
    #[error("failed to connect to usbmuxd at {path:?}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// usbmuxd refused the Listen request
    #[error("event subscription refused by usbmuxd (result {number})")]
    SubscriptionRefused { number: u64 },

    /// Malformed traffic on the session
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Socket read/write failed
    #[error("mux I/O error: {0}")]
    Io(#[from] io::Error),
}

impl MuxError {
    /// Check if this error is recoverable
    ///
    /// Transport and protocol failures are retried by the supervisor's
    /// retry wrapper, which re-opens the session from scratch.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Connect { .. } => true,
            Self::SubscriptionRefused { .. } => false,
            Self::Protocol(_) => true,
            Self::Io(e) => !matches!(e.kind(), io::ErrorKind::PermissionDenied),
        }
    }

    /// Create a connect error
    pub fn connect(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Connect {
            path: path.into(),
            source,
        }
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Mapping file not found or inaccessible
    #[error("mapping file not found: {path}")]
    FileNotFound { path: String },

    /// A mapping line did not match `UDID:LOCAL_PORT[:DEVICE_PORT]`
    #[error("malformed mapping line {line_no}: {line:?}")]
    MalformedLine { line_no: usize, line: String },

    /// Port was zero or not a 16-bit integer
    #[error("invalid port {value:?} on mapping line {line_no}")]
    InvalidPort { line_no: usize, value: String },

    /// Two entries shared the same (udid, local_port) pair
    #[error("duplicate mapping entry for {udid} on local port {local_port}")]
    DuplicateEntry { udid: String, local_port: u16 },

    /// Settings validation failed (out-of-range knob)
    #[error("settings validation failed: {0}")]
    Validation(String),

    /// I/O error while reading the mapping file
    #[error("I/O error reading mapping: {0}")]
    Io(#[from] io::Error),
}

impl ConfigError {
    /// Boot-time configuration failures are retried by the wrapper;
    /// validation errors need user intervention.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::FileNotFound { .. } | Self::Io(_) => true,
            Self::MalformedLine { .. }
            | Self::InvalidPort { .. }
            | Self::DuplicateEntry { .. }
            | Self::Validation(_) => false,
        }
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}

/// Tunnel worker errors
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Could not bind the loopback listener
    #[error("failed to bind 127.0.0.1:{port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },

    /// usbmuxd reported the device is no longer attached
    #[error("device {device_id} requested but not connected")]
    DeviceNotConnected { device_id: u64 },

    /// usbmuxd reported the device-side port is unavailable
    #[error("port {device_port} requested on device {device_id} wasn't available")]
    PortUnavailable { device_id: u64, device_port: u16 },

    /// Mux session failure while setting up the device side
    #[error(transparent)]
    Mux(#[from] MuxError),

    /// Local socket I/O failure
    #[error("tunnel I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TunnelError {
    /// Check if this error is recoverable
    ///
    /// Per-connection failures never bring the worker down; only bind
    /// conflicts are terminal.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Bind { .. } => false,
            Self::DeviceNotConnected { .. } | Self::PortUnavailable { .. } => true,
            Self::Mux(e) => e.is_recoverable(),
            Self::Io(_) => true,
        }
    }

    /// Create a bind error
    pub const fn bind(port: u16, source: io::Error) -> Self {
        Self::Bind { port, source }
    }
}

/// Pidfile and control-signal errors
#[derive(Debug, Error)]
pub enum ControlError {
    /// Pidfile could not be written due to permissions
    #[error("cannot write pidfile {path:?}: permission denied")]
    PidfilePermission { path: PathBuf },

    /// Pidfile could not be read or did not contain a pid
    #[error("cannot read pidfile {path:?}: {reason}")]
    PidfileUnreadable { path: PathBuf, reason: String },

    /// Pidfile names a process that no longer exists
    #[error("no process with pid {pid} (was the relay running?)")]
    StaleProcess { pid: i32 },

    /// Not permitted to signal the daemon process
    #[error("not permitted to signal pid {pid}")]
    SignalPermission { pid: i32 },

    /// Fork/setsid failed while detaching
    #[error("failed to daemonize: {0}")]
    Daemonize(String),

    /// I/O error on the pidfile or status socket
    #[error("control I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Type alias for Result with `GandalfError`
pub type Result<T> = std::result::Result<T, GandalfError>;
