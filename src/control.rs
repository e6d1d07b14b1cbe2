//! Process control: exit codes, pidfile, control signals, daemonizing
//!
//! The pidfile is the coordination point between a running daemon and the
//! `--status`/`--reload`/`--shutdown` invocations. Control verbs read the
//! pid and deliver SIGUSR1/SIGUSR2; a pid that no longer exists maps to
//! exit 5 and a permission failure to exit 3.

use std::io::{self, Read};
use std::net::SocketAddr;
use std::path::Path;

use tracing::info;

use crate::error::ControlError;

/// Process exit codes
pub mod exit_code {
    /// Normal termination
    pub const OK: i32 = 0;
    /// Pidfile could not be written (permission)
    pub const PIDFILE_PERMISSION: i32 = 2;
    /// Control signal delivery was not permitted
    pub const SIGNAL_PERMISSION: i32 = 3;
    /// Unhandled async exception
    pub const UNHANDLED: i32 = 4;
    /// Stale pidfile: no such process
    pub const STALE_PIDFILE: i32 = 5;
    /// Listener address already in use
    pub const ADDR_IN_USE: i32 = 6;
}

/// Control verbs delivered to a running daemon via signals
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlVerb {
    /// Re-read the mapping and restart tunnels (SIGUSR1)
    Reload,
    /// Graceful shutdown (SIGUSR2)
    Shutdown,
}

impl ControlVerb {
    const fn signal(self) -> libc::c_int {
        match self {
            Self::Reload => libc::SIGUSR1,
            Self::Shutdown => libc::SIGUSR2,
        }
    }
}

/// Write the current pid to the pidfile as decimal ASCII
///
/// # Errors
///
/// Returns `ControlError::PidfilePermission` on `EACCES`, other failures
/// as `ControlError::Io`.
pub fn write_pidfile(path: impl AsRef<Path>) -> Result<(), ControlError> {
    let path = path.as_ref();
    std::fs::write(path, std::process::id().to_string()).map_err(|e| {
        if e.kind() == io::ErrorKind::PermissionDenied {
            ControlError::PidfilePermission {
                path: path.to_path_buf(),
            }
        } else {
            ControlError::Io(e)
        }
    })?;

    info!("Wrote pid {} to {:?}", std::process::id(), path);
    Ok(())
}

/// Remove the pidfile, ignoring errors
pub fn remove_pidfile(path: impl AsRef<Path>) {
    let _ = std::fs::remove_file(path);
}

/// Read the daemon pid from the pidfile
///
/// # Errors
///
/// Returns `ControlError::PidfileUnreadable` if the file cannot be read or
/// does not contain a decimal pid.
pub fn read_pidfile(path: impl AsRef<Path>) -> Result<i32, ControlError> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path).map_err(|e| ControlError::PidfileUnreadable {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    contents
        .trim()
        .parse::<i32>()
        .map_err(|_| ControlError::PidfileUnreadable {
            path: path.to_path_buf(),
            reason: format!("not a pid: {:?}", contents.trim()),
        })
}

/// Deliver a control verb to the daemon named by the pidfile
///
/// Returns the signalled pid on success.
///
/// # Errors
///
/// Returns `ControlError::StaleProcess` when the pid no longer exists
/// (`ESRCH`) and `ControlError::SignalPermission` on `EPERM`.
pub fn signal_daemon(
    pidfile_path: impl AsRef<Path>,
    verb: ControlVerb,
) -> Result<i32, ControlError> {
    let pid = read_pidfile(pidfile_path)?;
    deliver(pid, verb.signal())?;
    Ok(pid)
}

/// Check that the daemon named by the pidfile is alive
///
/// Uses the null signal, so the daemon observes nothing.
///
/// # Errors
///
/// Same classification as [`signal_daemon`].
pub fn check_daemon(pidfile_path: impl AsRef<Path>) -> Result<i32, ControlError> {
    let pid = read_pidfile(pidfile_path)?;
    deliver(pid, 0)?;
    Ok(pid)
}

fn deliver(pid: i32, signal: libc::c_int) -> Result<(), ControlError> {
    // SAFETY: kill(2) with a plain signal number has no memory effects.
    let rc = unsafe { libc::kill(pid, signal) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        return Err(match err.raw_os_error() {
            Some(libc::ESRCH) => ControlError::StaleProcess { pid },
            Some(libc::EPERM) => ControlError::SignalPermission { pid },
            _ => ControlError::Io(err),
        });
    }
    Ok(())
}

/// Ignore SIGPIPE so broken peer sockets surface as write errors
pub fn ignore_sigpipe() {
    // SAFETY: setting a signal disposition to SIG_IGN is async-signal-safe.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

/// Detach from the controlling terminal
///
/// Double fork with an intervening `setsid`, then stdio redirected to
/// `/dev/null`. Must run before the async runtime starts; forking a
/// multi-threaded process does not survive.
///
/// # Errors
///
/// Returns `ControlError::Daemonize` if any step fails.
pub fn daemonize() -> Result<(), ControlError> {
    // SAFETY: called single-threaded from main before the runtime exists.
    unsafe {
        match libc::fork() {
            -1 => {
                return Err(ControlError::Daemonize(format!(
                    "first fork failed: {}",
                    io::Error::last_os_error()
                )))
            }
            0 => {}
            _ => libc::_exit(0),
        }

        if libc::setsid() == -1 {
            return Err(ControlError::Daemonize(format!(
                "setsid failed: {}",
                io::Error::last_os_error()
            )));
        }

        match libc::fork() {
            -1 => {
                return Err(ControlError::Daemonize(format!(
                    "second fork failed: {}",
                    io::Error::last_os_error()
                )))
            }
            0 => {}
            _ => libc::_exit(0),
        }

        let devnull = libc::open(c"/dev/null".as_ptr(), libc::O_RDWR);
        if devnull >= 0 {
            libc::dup2(devnull, libc::STDIN_FILENO);
            libc::dup2(devnull, libc::STDOUT_FILENO);
            libc::dup2(devnull, libc::STDERR_FILENO);
            if devnull > libc::STDERR_FILENO {
                libc::close(devnull);
            }
        }
    }

    Ok(())
}

/// Fetch the status line from a running daemon's status endpoint
///
/// # Errors
///
/// Returns the connection or read error.
pub fn query_status(port: u16) -> io::Result<String> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let mut stream = std::net::TcpStream::connect(addr)?;
    let mut line = String::new();
    stream.read_to_string(&mut line)?;
    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_pidfile_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gandalf.pid");

        write_pidfile(&path).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, std::process::id().to_string());

        #[allow(clippy::cast_possible_wrap)]
        let expected = std::process::id() as i32;
        assert_eq!(read_pidfile(&path).unwrap(), expected);

        remove_pidfile(&path);
        assert!(!path.exists());
    }

    #[test]
    fn test_read_pidfile_garbage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gandalf.pid");
        std::fs::write(&path, "not-a-pid").unwrap();

        assert!(matches!(
            read_pidfile(&path),
            Err(ControlError::PidfileUnreadable { .. })
        ));
    }

    #[test]
    fn test_read_pidfile_missing() {
        assert!(matches!(
            read_pidfile("/nonexistent/gandalf.pid"),
            Err(ControlError::PidfileUnreadable { .. })
        ));
    }

    #[test]
    fn test_signal_stale_pid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gandalf.pid");
        // Above any real pid_max; kill(2) reports ESRCH
        std::fs::write(&path, "99999999").unwrap();

        let result = signal_daemon(&path, ControlVerb::Reload);
        assert!(matches!(
            result,
            Err(ControlError::StaleProcess { pid: 99_999_999 })
        ));
    }

    #[test]
    fn test_control_verb_signals() {
        assert_eq!(ControlVerb::Reload.signal(), libc::SIGUSR1);
        assert_eq!(ControlVerb::Shutdown.signal(), libc::SIGUSR2);
    }
}
