//! Device inventory: the relay's live view of attached devices
//!
//! One task owns a Listen subscription and applies attach/detach events to
//! the `device_id → udid` table. Snapshot consumers (the supervisor when it
//! spawns tunnels, the status server) observe a consistent join of the
//! table against the current mapping. The mapping file is re-read on every
//! event so edits take effect without a full reload.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::{load_mapping, Mapping};
use crate::error::MuxError;
use crate::muxd::{MuxEvent, MuxSession};

/// Everything a tunnel worker needs to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSpec {
    /// Loopback port to listen on
    pub local_port: u16,
    /// usbmuxd device id for Connect requests
    pub device_id: u64,
    /// Device UDID, for logs and the status endpoint
    pub udid: String,
    /// Device-side TCP port
    pub device_port: u16,
}

#[derive(Debug)]
struct InventoryState {
    /// Currently-attached devices, keyed by usbmuxd device id
    devices: HashMap<u64, String>,
    /// Most recently parsed mapping
    mapping: Mapping,
}

/// Live inventory of attached devices joined with the mapping
#[derive(Debug)]
pub struct DeviceInventory {
    state: Mutex<InventoryState>,
    mapping_path: PathBuf,
}

impl DeviceInventory {
    /// Create an inventory with an initial mapping
    #[must_use]
    pub fn new(mapping_path: PathBuf, mapping: Mapping) -> Self {
        Self {
            state: Mutex::new(InventoryState {
                devices: HashMap::new(),
                mapping,
            }),
            mapping_path,
        }
    }

    /// Apply one attach/detach event
    ///
    /// Re-reads the mapping file first so snapshots taken after this event
    /// see current mapping edits; a parse failure keeps the previous
    /// mapping in place.
    pub fn apply(&self, event: MuxEvent) {
        self.refresh_mapping();

        let mut state = self.state.lock();
        match event {
            MuxEvent::Attached(device) => {
                info!(
                    "Device attached: {} (id {}, {} at {} bps)",
                    device.serial_number,
                    device.device_id,
                    device.connection_type,
                    device.connection_speed
                );
                state
                    .devices
                    .entry(device.device_id)
                    .or_insert(device.serial_number);
            }
            MuxEvent::Detached { device_id } => {
                match state.devices.remove(&device_id) {
                    Some(udid) => info!("Device detached: {} (id {})", udid, device_id),
                    None => debug!("Detach for unknown device id {}", device_id),
                }
            }
        }
    }

    /// Join the inventory against the mapping
    ///
    /// Returns one tuple per attached `(device_id, udid)` × matching
    /// mapping entry. Mapping UDIDs with no attached device are dropped.
    #[must_use]
    pub fn snapshot(&self) -> Vec<TunnelSpec> {
        let state = self.state.lock();
        let mut specs = Vec::new();

        for entry in state.mapping.entries() {
            let mut matched = false;
            for (device_id, udid) in &state.devices {
                if *udid == entry.udid {
                    matched = true;
                    specs.push(TunnelSpec {
                        local_port: entry.local_port,
                        device_id: *device_id,
                        udid: udid.clone(),
                        device_port: entry.device_port,
                    });
                }
            }
            if !matched {
                info!(
                    "Device {} not attached, skipping port {}",
                    entry.udid, entry.local_port
                );
            }
        }

        specs
    }

    /// Number of currently-attached devices
    #[must_use]
    pub fn device_count(&self) -> usize {
        self.state.lock().devices.len()
    }

    /// Run the long-lived event subscription
    ///
    /// Terminates only on socket failure or cancellation; the supervisor's
    /// retry wrapper re-invokes it.
    ///
    /// # Errors
    ///
    /// Returns `MuxError` when the subscription breaks.
    pub async fn run(self: Arc<Self>, usbmuxd_socket: PathBuf) -> Result<(), MuxError> {
        let session = MuxSession::connect(&usbmuxd_socket).await?;
        let inventory = Arc::clone(&self);
        session.subscribe(move |event| inventory.apply(event)).await
    }

    fn refresh_mapping(&self) {
        match load_mapping(&self.mapping_path) {
            Ok(mapping) => {
                let mut state = self.state.lock();
                if state.mapping != mapping {
                    info!("Mapping changed on disk: now {} entries", mapping.len());
                    state.mapping = mapping;
                }
            }
            Err(e) => {
                warn!(
                    "Keeping previous mapping; reload of {:?} failed: {}",
                    self.mapping_path, e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_mapping_str;
    use crate::muxd::DeviceProperties;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn device(id: u64, serial: &str) -> DeviceProperties {
        DeviceProperties {
            serial_number: serial.into(),
            connection_speed: 480_000_000,
            connection_type: "USB".into(),
            product_id: 4776,
            location_id: 1,
            device_id: id,
        }
    }

    fn mapping_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    fn inventory_with(contents: &str) -> (DeviceInventory, NamedTempFile) {
        let file = mapping_file(contents);
        let mapping = parse_mapping_str(contents).unwrap();
        (
            DeviceInventory::new(file.path().to_path_buf(), mapping),
            file,
        )
    }

    #[test]
    fn test_attach_detach_mutations() {
        let (inventory, _file) = inventory_with("UDID-A:2222\n");

        inventory.apply(MuxEvent::Attached(device(4, "UDID-A")));
        assert_eq!(inventory.device_count(), 1);

        // Re-attach with the same id does not overwrite
        inventory.apply(MuxEvent::Attached(device(4, "UDID-OTHER")));
        assert_eq!(inventory.device_count(), 1);
        assert_eq!(inventory.snapshot().len(), 1);

        inventory.apply(MuxEvent::Detached { device_id: 4 });
        assert_eq!(inventory.device_count(), 0);

        // Detach for an unknown id is a no-op
        inventory.apply(MuxEvent::Detached { device_id: 9 });
        assert_eq!(inventory.device_count(), 0);
    }

    #[test]
    fn test_snapshot_joins_mapping() {
        let (inventory, _file) = inventory_with("UDID-A:2222\nUDID-A:8080:80\nUDID-B:2223\n");

        inventory.apply(MuxEvent::Attached(device(4, "UDID-A")));

        let mut specs = inventory.snapshot();
        specs.sort_by_key(|s| s.local_port);

        // UDID-B is not attached; only UDID-A's two entries survive the join
        assert_eq!(specs.len(), 2);
        assert_eq!(
            specs[0],
            TunnelSpec {
                local_port: 2222,
                device_id: 4,
                udid: "UDID-A".into(),
                device_port: 22,
            }
        );
        assert_eq!(specs[1].local_port, 8080);
        assert_eq!(specs[1].device_port, 80);
    }

    #[test]
    fn test_snapshot_empty_when_nothing_attached() {
        let (inventory, _file) = inventory_with("UDID-X:2223\n");
        assert!(inventory.snapshot().is_empty());
    }

    #[test]
    fn test_event_rereads_mapping() {
        let (inventory, file) = inventory_with("UDID-A:2222\n");

        // Rewrite the mapping on disk, then deliver an event
        std::fs::write(file.path(), "UDID-A:3333\n").unwrap();
        inventory.apply(MuxEvent::Attached(device(4, "UDID-A")));

        let specs = inventory.snapshot();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].local_port, 3333);
    }

    #[test]
    fn test_broken_mapping_keeps_previous() {
        let (inventory, file) = inventory_with("UDID-A:2222\n");

        std::fs::write(file.path(), "not a mapping line\n").unwrap();
        inventory.apply(MuxEvent::Attached(device(4, "UDID-A")));

        let specs = inventory.snapshot();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].local_port, 2222);
    }
}
