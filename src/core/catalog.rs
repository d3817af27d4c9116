use std::sync::Arc;

use log::{debug, warn};
use thiserror::Error;

use crate::core::disk_ops::DiskManager;
use crate::core::{DeviceDescriptor, DiskError};

/// The host lacks a usable device-enumeration facility. Distinct from a
/// successful scan that found nothing plugged in.
#[derive(Error, Debug)]
#[error("drive discovery unavailable: {0}")]
pub struct DiscoveryUnavailable(pub String);

/// Produces the current set of removable, non-system drives in a
/// platform-neutral shape.
///
/// Read-only and stateless: each [`scan`](DriveCatalog::scan) queries the
/// backend afresh and returns an immutable snapshot, ordered ascending by
/// device id so repeated scans of unchanged hardware yield the same sequence.
pub struct DriveCatalog {
    manager: Arc<dyn DiskManager>,
}

impl DriveCatalog {
    pub fn new(manager: Arc<dyn DiskManager>) -> Self {
        Self { manager }
    }

    /// Scans the host for drives that are safe to offer for flashing.
    ///
    /// Devices not flagged removable, and the device hosting the running
    /// system, are dropped. `Ok(vec![])` means nothing eligible is plugged
    /// in; [`DiscoveryUnavailable`] means the host could not be asked at all.
    pub async fn scan(&self) -> Result<Vec<DeviceDescriptor>, DiscoveryUnavailable> {
        let all = self.manager.list_devices().await.map_err(|e| {
            warn!("device enumeration failed: {e}");
            match e {
                DiskError::DiscoveryUnavailable(msg) => DiscoveryUnavailable(msg),
                other => DiscoveryUnavailable(other.to_string()),
            }
        })?;

        let mut devices: Vec<DeviceDescriptor> = all
            .into_iter()
            .filter(|d| d.is_removable && !d.is_system)
            .collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));

        debug!("scan found {} eligible device(s)", devices.len());
        Ok(devices)
    }
}
