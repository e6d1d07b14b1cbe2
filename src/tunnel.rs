//! Tunnel worker: one loopback listener per mapping entry
//!
//! Each accepted local TCP connection opens a fresh mux session, sends a
//! Connect for the worker's device and port, and on success splices bytes
//! until EOF, error, or the idle timeout. Connections run in parallel; the
//! listener serves until the supervisor shuts it down.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream, UnixStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{MuxError, TunnelError};
use crate::inventory::TunnelSpec;
use crate::io::splice_with_idle_timeout;
use crate::muxd::{build_connect, MuxSession, Reply, ResultCode};

/// A running tunnel worker
///
/// Dropping the handle (or calling [`TunnelHandle::shutdown`]) closes the
/// listener; in-flight connections finish their current read or write and
/// then observe the close.
#[derive(Debug)]
pub struct TunnelHandle {
    spec: TunnelSpec,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl TunnelHandle {
    /// The spec this worker serves
    #[must_use]
    pub fn spec(&self) -> &TunnelSpec {
        &self.spec
    }

    /// Stop the listener and wait for the accept loop to exit
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task.await;
    }
}

/// Bind a loopback listener for `spec` and spawn its accept loop
///
/// The bind happens before spawning so that an address conflict surfaces
/// to the caller immediately.
///
/// # Errors
///
/// Returns `TunnelError::Bind` if loopback:`local_port` cannot be bound.
pub async fn spawn_tunnel(
    spec: TunnelSpec,
    usbmuxd_socket: PathBuf,
    idle_timeout: Duration,
) -> Result<TunnelHandle, TunnelError> {
    let addr = SocketAddr::from(([127, 0, 0, 1], spec.local_port));
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| TunnelError::bind(spec.local_port, e))?;

    info!(
        "Tunneling 127.0.0.1:{} -> {}:{} (device id {})",
        spec.local_port, spec.udid, spec.device_port, spec.device_id
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = TunnelWorker {
        spec: spec.clone(),
        usbmuxd_socket,
        idle_timeout,
        listener,
        shutdown_rx,
    };
    let task = tokio::spawn(worker.run());

    Ok(TunnelHandle {
        spec,
        shutdown_tx,
        task,
    })
}

struct TunnelWorker {
    spec: TunnelSpec,
    usbmuxd_socket: PathBuf,
    idle_timeout: Duration,
    listener: TcpListener,
    shutdown_rx: watch::Receiver<bool>,
}

impl TunnelWorker {
    async fn run(mut self) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((client, peer)) => {
                            debug!(
                                "Accepted {} on 127.0.0.1:{}",
                                peer, self.spec.local_port
                            );
                            let spec = self.spec.clone();
                            let socket = self.usbmuxd_socket.clone();
                            let idle = self.idle_timeout;
                            tokio::spawn(relay_connection(client, spec, socket, idle));
                        }
                        Err(e) => {
                            debug!(
                                "Accept error on 127.0.0.1:{}: {}",
                                self.spec.local_port, e
                            );
                        }
                    }
                }
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        debug!("Listener on 127.0.0.1:{} closed", self.spec.local_port);
    }
}

/// Serve one accepted connection
async fn relay_connection(
    client: TcpStream,
    spec: TunnelSpec,
    usbmuxd_socket: PathBuf,
    idle_timeout: Duration,
) {
    match connect_device(&spec, &usbmuxd_socket).await {
        Ok(Some(device)) => {
            match splice_with_idle_timeout(client, device, idle_timeout).await {
                Ok(result) if result.idle_timed_out => {
                    info!("connection timed out");
                }
                Ok(result) => {
                    debug!(
                        "Tunnel on port {} done: {} bytes up, {} bytes down",
                        spec.local_port, result.client_to_device, result.device_to_client
                    );
                }
                Err(e) => {
                    debug!("Tunnel on port {} transfer error: {}", spec.local_port, e);
                }
            }
        }
        // Reply outside the handled set: close silently
        Ok(None) => {}
        Err(TunnelError::DeviceNotConnected { device_id }) => {
            warn!("Device requested wasn't connected (id {})", device_id);
        }
        Err(TunnelError::PortUnavailable { device_port, .. }) => {
            warn!("Port requested wasn't available ({})", device_port);
        }
        Err(e) => {
            debug!("Tunnel setup on port {} failed: {}", spec.local_port, e);
        }
    }
    // Both sockets are dropped here on every path
}

/// Open a mux session and negotiate the device-port tunnel
///
/// `Ok(Some(stream))` means the Connect succeeded and the stream is the
/// tunnel byte pipe; `Ok(None)` means usbmuxd answered with something the
/// relay closes silently.
async fn connect_device(
    spec: &TunnelSpec,
    usbmuxd_socket: &Path,
) -> Result<Option<UnixStream>, TunnelError> {
    let mut session = MuxSession::connect(usbmuxd_socket).await?;
    let payload =
        build_connect(spec.device_id, spec.device_port).map_err(MuxError::from)?;

    match session.request(&payload).await? {
        Reply::Result(ResultCode::Success) => Ok(Some(session.into_stream())),
        Reply::Result(ResultCode::DeviceRequestedNotConnected) => {
            Err(TunnelError::DeviceNotConnected {
                device_id: spec.device_id,
            })
        }
        Reply::Result(ResultCode::PortRequestedNotAvailable) => Err(TunnelError::PortUnavailable {
            device_id: spec.device_id,
            device_port: spec.device_port,
        }),
        other => {
            debug!("Unexpected Connect reply: {:?}", other);
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    fn spec(local_port: u16) -> TunnelSpec {
        TunnelSpec {
            local_port,
            device_id: 4,
            udid: "UDID-A".into(),
            device_port: 22,
        }
    }

    async fn spawn_on_free_port() -> (TunnelHandle, u16) {
        // Grab a free port, release it, then let the worker bind it
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let handle = spawn_tunnel(
            spec(port),
            PathBuf::from("/nonexistent/usbmuxd.sock"),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        (handle, port)
    }

    #[tokio::test]
    async fn test_bind_conflict() {
        let (handle, port) = spawn_on_free_port().await;

        let result = spawn_tunnel(
            spec(port),
            PathBuf::from("/nonexistent/usbmuxd.sock"),
            Duration::from_secs(5),
        )
        .await;

        match result {
            Err(TunnelError::Bind { port: p, source }) => {
                assert_eq!(p, port);
                assert_eq!(source.kind(), io::ErrorKind::AddrInUse);
            }
            other => panic!("expected bind conflict, got {:?}", other.map(|h| h.spec().clone())),
        }

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_releases_port() {
        let (handle, port) = spawn_on_free_port().await;

        // Listener is up: a client can connect even though the mux side
        // will fail and close
        let probe = TcpStream::connect(("127.0.0.1", port)).await;
        assert!(probe.is_ok());

        handle.shutdown().await;

        // The port can be bound again once the worker is gone
        let rebind = TcpListener::bind(("127.0.0.1", port)).await;
        assert!(rebind.is_ok());
    }

    #[tokio::test]
    async fn test_handle_exposes_spec() {
        let (handle, port) = spawn_on_free_port().await;
        assert_eq!(handle.spec().local_port, port);
        assert_eq!(handle.spec().udid, "UDID-A");
        handle.shutdown().await;
    }
}
