//! Status endpoint: read-only snapshot of current tunnels
//!
//! Binds loopback only. Each accepted connection receives a single line,
//! a JSON array of `{"Port", "DeviceID", "UDID"}` objects followed by a
//! newline, then the connection is closed. The snapshot comes from the
//! device inventory's single event subscription; no second Listen socket
//! is opened.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::inventory::DeviceInventory;

/// One tunnel as reported by the status endpoint
#[derive(Debug, Clone, Serialize)]
pub struct TunnelStatus {
    /// Local loopback port
    #[serde(rename = "Port")]
    pub port: u16,
    /// usbmuxd device id
    #[serde(rename = "DeviceID")]
    pub device_id: u64,
    /// Device UDID
    #[serde(rename = "UDID")]
    pub udid: String,
}

/// A running status server
#[derive(Debug)]
pub struct StatusHandle {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl StatusHandle {
    /// The bound address
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop the server and wait for the accept loop to exit
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task.await;
    }
}

/// Bind the status endpoint on loopback:`port` and spawn its accept loop
///
/// # Errors
///
/// Returns the bind error; `AddrInUse` means another relay is likely
/// already running.
pub async fn spawn_status_server(
    port: u16,
    inventory: Arc<DeviceInventory>,
) -> io::Result<StatusHandle> {
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], port))).await?;
    let local_addr = listener.local_addr()?;

    info!("Status endpoint listening on {}", local_addr);

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _peer)) => {
                            let inventory = Arc::clone(&inventory);
                            tokio::spawn(async move {
                                if let Err(e) = serve_snapshot(stream, &inventory).await {
                                    debug!("Status connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => debug!("Status accept error: {}", e),
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Status endpoint closed");
    });

    Ok(StatusHandle {
        local_addr,
        shutdown_tx,
        task,
    })
}

/// Write the snapshot as one JSON line, then close
async fn serve_snapshot(mut stream: TcpStream, inventory: &DeviceInventory) -> io::Result<()> {
    let tunnels: Vec<TunnelStatus> = inventory
        .snapshot()
        .into_iter()
        .map(|spec| TunnelStatus {
            port: spec.local_port,
            device_id: spec.device_id,
            udid: spec.udid,
        })
        .collect();

    let mut line = serde_json::to_vec(&tunnels)?;
    line.push(b'\n');

    stream.write_all(&line).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_mapping_str;
    use crate::muxd::{DeviceProperties, MuxEvent};
    use std::io::Write;
    use tempfile::NamedTempFile;
    use tokio::io::AsyncReadExt;

    fn inventory_with(contents: &str) -> (Arc<DeviceInventory>, NamedTempFile) {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
        let mapping = parse_mapping_str(contents).unwrap();
        (
            Arc::new(DeviceInventory::new(file.path().to_path_buf(), mapping)),
            file,
        )
    }

    async fn read_status_line(addr: SocketAddr) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut line = String::new();
        stream.read_to_string(&mut line).await.unwrap();
        line
    }

    #[tokio::test]
    async fn test_status_line_format() {
        let (inventory, _file) = inventory_with("UDID-A:2222\n");
        inventory.apply(MuxEvent::Attached(DeviceProperties {
            serial_number: "UDID-A".into(),
            connection_speed: 480_000_000,
            connection_type: "USB".into(),
            product_id: 4776,
            location_id: 1,
            device_id: 4,
        }));

        let handle = spawn_status_server(0, Arc::clone(&inventory)).await.unwrap();
        let line = read_status_line(handle.local_addr()).await;

        assert!(line.ends_with('\n'));
        let parsed: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(
            parsed,
            serde_json::json!([{"Port": 2222, "DeviceID": 4, "UDID": "UDID-A"}])
        );

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_status_empty_inventory() {
        let (inventory, _file) = inventory_with("UDID-X:2223\n");

        let handle = spawn_status_server(0, inventory).await.unwrap();
        let line = read_status_line(handle.local_addr()).await;
        assert_eq!(line, "[]\n");

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_status_serves_multiple_connections() {
        let (inventory, _file) = inventory_with("UDID-X:2223\n");

        let handle = spawn_status_server(0, inventory).await.unwrap();
        for _ in 0..3 {
            let line = read_status_line(handle.local_addr()).await;
            assert_eq!(line, "[]\n");
        }

        handle.shutdown().await;
    }
}
