//! Supervisor: boot sequence, retry wrapper, signals, reload and shutdown
//!
//! Signal handlers only post a command onto a channel; the supervisor's
//! event loop drains it. This keeps reload from racing tunnel
//! registration: the running-tunnel list is only touched by the event
//! loop, under its mutex.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::{load_mapping, Settings};
use crate::control::{self, exit_code};
use crate::error::{GandalfError, Result};
use crate::inventory::{DeviceInventory, TunnelSpec};
use crate::status::{spawn_status_server, StatusHandle};
use crate::tunnel::{spawn_tunnel, TunnelHandle};

/// Wall-clock window granted to usbmuxd for its initial burst of Attached
/// events; when it closes, the partially-populated inventory is accepted
const FIRST_BURST_WINDOW: Duration = Duration::from_secs(1);

/// Commands posted by signal handlers and drained by the event loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Re-read the mapping, tear down, restart (SIGUSR1)
    Reload,
    /// Graceful shutdown (SIGUSR2, SIGTERM)
    Shutdown,
}

/// Run a task under the retry policy
///
/// Retries up to `max_retries` consecutive failures with `wait` between
/// attempts. Cancellation is not an error: it short-circuits to
/// `Ok(None)`. After the budget is spent the last error is returned and
/// the supervised task terminates.
///
/// # Errors
///
/// Returns the final error once `max_retries` attempts have failed.
pub async fn with_retries<T, F, Fut>(
    label: &str,
    max_retries: u32,
    wait: Duration,
    mut task: F,
) -> Result<Option<T>>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut last_error = None;

    for attempt in 1..=max_retries {
        match task().await {
            Ok(value) => return Ok(Some(value)),
            Err(e) if e.is_cancellation() => return Ok(None),
            Err(e) => {
                warn!("{} attempt {}/{} failed: {}", label, attempt, max_retries, e);
                last_error = Some(e);
                if attempt < max_retries {
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    info!("{}: tried {} times and gave up", label, max_retries);
    Err(last_error.unwrap_or(GandalfError::Cancelled))
}

/// Classify an error escaping the supervisor and report it
///
/// Returns the process exit code. Cancellation is logged at info and maps
/// to a clean exit; an address conflict means another relay is likely
/// already running.
pub fn report_unhandled(err: &GandalfError) -> i32 {
    let code = err.exit_code();
    match code {
        exit_code::OK => info!("connection timed out"),
        exit_code::ADDR_IN_USE => {
            eprintln!("gandalf: {err} (is another relay already running?)");
        }
        exit_code::UNHANDLED => {
            eprintln!("gandalf: please report, unhandled async exception: {err}");
        }
        _ => eprintln!("gandalf: {err}"),
    }
    code
}

/// The relay supervisor
///
/// Owns the running-tunnel list, the status server handle, and the
/// long-lived inventory task. All mutation happens from the event loop.
pub struct Supervisor {
    settings: Settings,
    /// Mapping path resolved once at boot so reloads survive chdir
    mapping_path: PathBuf,
    tunnels: Mutex<Vec<TunnelHandle>>,
    status: Mutex<Option<StatusHandle>>,
    inventory_task: Mutex<Option<JoinHandle<()>>>,
}

impl Supervisor {
    /// Create a supervisor, resolving the mapping path to an absolute one
    ///
    /// # Errors
    ///
    /// Returns an error if the path cannot be made absolute.
    pub fn new(settings: Settings) -> Result<Self> {
        let mapping_path = std::path::absolute(&settings.mapping_path)?;
        Ok(Self {
            settings,
            mapping_path,
            tunnels: Mutex::new(Vec::new()),
            status: Mutex::new(None),
            inventory_task: Mutex::new(None),
        })
    }

    /// Run the boot sequence
    ///
    /// The mapping load and the first-burst subscription run inside the
    /// retry wrapper; pidfile, status server, tunnel workers, and the
    /// long-lived inventory task follow. Bind conflicts propagate so the
    /// caller can exit 6.
    ///
    /// # Errors
    ///
    /// Returns the final failure of the retry-wrapped phase, a pidfile
    /// permission error, or a listener bind error.
    pub async fn boot(&self) -> Result<()> {
        let booted = with_retries(
            "boot",
            self.settings.max_retries,
            self.settings.retry_wait,
            || {
                let this = self;
                async move {
                    let mapping = load_mapping(&this.mapping_path)?;
                    let inventory =
                        Arc::new(DeviceInventory::new(this.mapping_path.clone(), mapping));
                    this.first_burst(&inventory).await?;
                    Ok(inventory)
                }
            },
        )
        .await?;

        let Some(inventory) = booted else {
            // Cancelled mid-boot; nothing to start
            return Ok(());
        };

        if self.settings.daemonize {
            control::write_pidfile(&self.settings.pidfile_path)?;
        }

        if self.settings.status_enabled {
            let handle =
                spawn_status_server(self.settings.status_port, Arc::clone(&inventory)).await?;
            *self.status.lock() = Some(handle);
        }

        self.spawn_tunnels(inventory.snapshot()).await?;
        self.spawn_inventory_task(inventory);

        Ok(())
    }

    /// Reload: tear everything down and re-run the boot sequence
    ///
    /// If the mapping file has been deleted, logs and keeps the current
    /// tunnels running.
    ///
    /// # Errors
    ///
    /// Returns the boot failure if the restart does not come up.
    pub async fn reload(&self) -> Result<()> {
        if !self.mapping_path.exists() {
            warn!(
                "Mapping file {:?} no longer exists; keeping current tunnels",
                self.mapping_path
            );
            return Ok(());
        }

        info!("Reload requested");
        let count = self.stop_all().await;
        debug!("Stopped {} tunnel(s) for reload", count);

        self.boot().await
    }

    /// Graceful shutdown: close all listeners and clear the running list
    pub async fn shutdown(&self) {
        let count = self.stop_all().await;
        info!("Shut down {} tunnel(s)", count);

        if self.settings.daemonize {
            control::remove_pidfile(&self.settings.pidfile_path);
        }
    }

    /// Give usbmuxd a bounded window to replay already-attached devices
    ///
    /// The deadline firing is the expected outcome and yields the
    /// partially-populated inventory; only a real subscription failure is
    /// an error.
    async fn first_burst(&self, inventory: &Arc<DeviceInventory>) -> Result<()> {
        let subscription = Arc::clone(inventory).run(self.settings.usbmuxd_socket.clone());

        match timeout(FIRST_BURST_WINDOW, subscription).await {
            Err(_deadline) => {
                debug!(
                    "Initial burst window closed with {} device(s) attached",
                    inventory.device_count()
                );
                Ok(())
            }
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
        }
    }

    /// Spawn one tunnel worker per snapshot tuple, in parallel
    async fn spawn_tunnels(&self, specs: Vec<TunnelSpec>) -> Result<()> {
        let mut set = JoinSet::new();
        for spec in specs {
            set.spawn(spawn_tunnel(
                spec,
                self.settings.usbmuxd_socket.clone(),
                self.settings.idle_timeout,
            ));
        }

        let mut first_error = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(handle)) => self.tunnels.lock().push(handle),
                Ok(Err(e)) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
                Err(e) => debug!("Tunnel spawn task failed: {}", e),
            }
        }

        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Spawn the long-lived event subscription, wrapped in the retry policy
    fn spawn_inventory_task(&self, inventory: Arc<DeviceInventory>) {
        let socket = self.settings.usbmuxd_socket.clone();
        let max_retries = self.settings.max_retries;
        let wait = self.settings.retry_wait;

        let task = tokio::spawn(async move {
            let result = with_retries("device inventory", max_retries, wait, || {
                let inventory = Arc::clone(&inventory);
                let socket = socket.clone();
                async move { inventory.run(socket).await.map_err(GandalfError::from) }
            })
            .await;

            if let Err(e) = result {
                debug!("Device inventory subscription terminated: {}", e);
            }
        });

        *self.inventory_task.lock() = Some(task);
    }

    /// Stop the inventory task, the status server, and all tunnel workers
    async fn stop_all(&self) -> usize {
        let task = self.inventory_task.lock().take();
        if let Some(task) = task {
            task.abort();
        }

        let status = self.status.lock().take();
        if let Some(status) = status {
            status.shutdown().await;
        }

        let handles: Vec<TunnelHandle> = {
            let mut tunnels = self.tunnels.lock();
            tunnels.drain(..).collect()
        };
        let count = handles.len();
        for handle in handles {
            handle.shutdown().await;
        }
        count
    }

    /// Number of currently-registered tunnel workers
    #[must_use]
    pub fn tunnel_count(&self) -> usize {
        self.tunnels.lock().len()
    }
}

/// Install signal handlers that post commands and return promptly
///
/// SIGUSR1 posts `Reload`; SIGUSR2 and SIGTERM post `Shutdown`.
///
/// # Errors
///
/// Returns an error if a signal stream cannot be registered.
pub fn spawn_signal_listeners(tx: &mpsc::Sender<Command>) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut usr1 = signal(SignalKind::user_defined1())?;
    let reload_tx = tx.clone();
    tokio::spawn(async move {
        while usr1.recv().await.is_some() {
            let _ = reload_tx.send(Command::Reload).await;
        }
    });

    let mut usr2 = signal(SignalKind::user_defined2())?;
    let usr2_tx = tx.clone();
    tokio::spawn(async move {
        while usr2.recv().await.is_some() {
            let _ = usr2_tx.send(Command::Shutdown).await;
        }
    });

    let mut term = signal(SignalKind::terminate())?;
    let term_tx = tx.clone();
    tokio::spawn(async move {
        while term.recv().await.is_some() {
            let _ = term_tx.send(Command::Shutdown).await;
        }
    });

    Ok(())
}

/// Boot the relay and serve commands until shutdown
///
/// This is the daemon's main entry: it validates settings, installs
/// signal handlers, runs the boot sequence, then blocks draining the
/// command channel until a shutdown command arrives.
///
/// # Errors
///
/// Returns boot failures and bind conflicts; the caller maps them to exit
/// codes.
pub async fn run(settings: Settings) -> Result<()> {
    settings.validate()?;
    control::ignore_sigpipe();

    info!(
        "gandalf {} starting on {}",
        crate::VERSION,
        std::env::consts::OS
    );

    let supervisor = Supervisor::new(settings)?;

    let (tx, mut rx) = mpsc::channel(8);
    spawn_signal_listeners(&tx)?;

    supervisor.boot().await?;

    loop {
        match rx.recv().await {
            Some(Command::Reload) => supervisor.reload().await?,
            Some(Command::Shutdown) | None => {
                supervisor.shutdown().await;
                info!("Shutdown complete");
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_retry_success_first_attempt() {
        let calls = AtomicU32::new(0);
        let result = with_retries("test", 3, Duration::from_millis(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(42) }
        })
        .await;

        assert_eq!(result.unwrap(), Some(42));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_bounded_by_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<Option<()>> = with_retries("test", 3, Duration::from_millis(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(GandalfError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "refused",
                )))
            }
        })
        .await;

        assert!(result.is_err());
        // A deterministically failing task is invoked exactly max_retries times
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_recovers_mid_budget() {
        let calls = AtomicU32::new(0);
        let result = with_retries("test", 5, Duration::from_millis(1), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(GandalfError::Io(std::io::Error::new(
                        std::io::ErrorKind::ConnectionRefused,
                        "refused",
                    )))
                } else {
                    Ok("up")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), Some("up"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_cancellation_is_success() {
        let calls = AtomicU32::new(0);
        let result: Result<Option<()>> = with_retries("test", 3, Duration::from_millis(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(GandalfError::Cancelled) }
        })
        .await;

        assert_eq!(result.unwrap(), None);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_boot_gives_up_without_usbmuxd() {
        let mut mapping = NamedTempFile::new().unwrap();
        writeln!(mapping, "UDID-A:2222").unwrap();

        let settings = Settings {
            mapping_path: mapping.path().to_path_buf(),
            usbmuxd_socket: "/nonexistent/usbmuxd.sock".into(),
            max_retries: 2,
            retry_wait: Duration::from_millis(10),
            ..Settings::default()
        };

        let supervisor = Supervisor::new(settings).unwrap();
        let result = supervisor.boot().await;
        assert!(result.is_err());
        assert_eq!(supervisor.tunnel_count(), 0);
    }

    #[tokio::test]
    async fn test_reload_with_deleted_mapping_keeps_running() {
        let mapping = NamedTempFile::new().unwrap();
        let path = mapping.path().to_path_buf();

        let settings = Settings {
            mapping_path: path.clone(),
            usbmuxd_socket: "/nonexistent/usbmuxd.sock".into(),
            max_retries: 1,
            retry_wait: Duration::from_millis(10),
            ..Settings::default()
        };

        let supervisor = Supervisor::new(settings).unwrap();
        drop(mapping);
        assert!(!path.exists());

        // The deleted mapping short-circuits before any teardown
        supervisor.reload().await.unwrap();
    }
}
