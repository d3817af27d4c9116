use async_trait::async_trait;
use std::io;
use std::process::Command;

use crate::core::disk_ops::DiskManager;
use crate::core::{ClusterSize, DeviceDescriptor, DiskError, FileSystemType};

pub struct MacOSDiskManager;

impl MacOSDiskManager {
    pub fn new() -> Self {
        Self
    }

    /// Parse diskutil list -plist output into descriptors
    fn parse_diskutil_output(&self, output: &[u8]) -> Result<Vec<DeviceDescriptor>, DiskError> {
        let plist: plist::Value =
            plist::from_bytes(output).map_err(|e| DiskError::ParseError(e.to_string()))?;

        let mut devices = Vec::new();

        let all_disks = plist
            .as_dictionary()
            .and_then(|d| d.get("AllDisksAndPartitions"))
            .and_then(|v| v.as_array())
            .ok_or_else(|| DiskError::ParseError("Missing AllDisksAndPartitions".to_string()))?;

        for disk in all_disks {
            let disk_dict = match disk.as_dictionary() {
                Some(d) => d,
                None => continue,
            };

            let device_identifier = disk_dict
                .get("DeviceIdentifier")
                .and_then(|v| v.as_string())
                .unwrap_or("unknown");

            let total_bytes = disk_dict
                .get("Size")
                .and_then(|v| v.as_unsigned_integer())
                .unwrap_or(0);

            // Whole disks only; partition identifiers end in sN.
            if is_partition_identifier(device_identifier) || total_bytes == 0 {
                continue;
            }

            // disk0 is the internal drive; anything holding the root mount
            // point is the system disk even when it is external.
            let mut is_system = device_identifier == "disk0";
            let mut label = String::new();
            let mut filesystem = None;
            let mut free_bytes = None;

            if let Some(partitions) = disk_dict.get("Partitions").and_then(|v| v.as_array()) {
                for partition in partitions {
                    let part_dict = match partition.as_dictionary() {
                        Some(d) => d,
                        None => continue,
                    };

                    if part_dict.get("MountPoint").and_then(|v| v.as_string()) == Some("/") {
                        is_system = true;
                    }
                    if label.is_empty() {
                        if let Some(name) =
                            part_dict.get("VolumeName").and_then(|v| v.as_string())
                        {
                            label = name.to_string();
                        }
                    }
                    if filesystem.is_none() {
                        filesystem = part_dict
                            .get("Content")
                            .and_then(|v| v.as_string())
                            .map(|s| s.to_string());
                    }
                    if free_bytes.is_none() {
                        free_bytes = part_dict
                            .get("FreeSpace")
                            .and_then(|v| v.as_unsigned_integer());
                    }
                }
            }

            devices.push(DeviceDescriptor {
                id: format!("/dev/{device_identifier}"),
                label,
                filesystem,
                total_bytes,
                free_bytes,
                // `diskutil list external` already restricts the listing;
                // everything that is not the system disk is ejectable here.
                is_removable: !is_system,
                is_system,
            });
        }

        Ok(devices)
    }
}

impl Default for MacOSDiskManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DiskManager for MacOSDiskManager {
    async fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, DiskError> {
        let output = Command::new("diskutil")
            .args(["list", "-plist", "external"])
            .output()
            .map_err(|e| {
                if e.kind() == io::ErrorKind::NotFound {
                    DiskError::DiscoveryUnavailable("diskutil is not available".to_string())
                } else {
                    DiskError::IoError(e)
                }
            })?;

        if !output.status.success() {
            return Err(DiskError::DiscoveryUnavailable(
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }

        self.parse_diskutil_output(&output.stdout)
    }

    async fn unmount(&self, path: &str) -> Result<(), DiskError> {
        let output = Command::new("diskutil")
            .args(["unmountDisk", path])
            .output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("busy") {
                return Err(DiskError::DeviceBusy);
            }
            return Err(DiskError::CommandFailed(stderr.to_string()));
        }

        Ok(())
    }

    async fn format(
        &self,
        path: &str,
        fs_type: FileSystemType,
        _cluster_size: ClusterSize,
        label: &str,
    ) -> Result<(), DiskError> {
        let identifier = path
            .strip_prefix("/dev/")
            .ok_or_else(|| DiskError::DeviceNotFound(path.to_string()))?;

        // eraseDisk requires the whole-disk identifier. diskutil picks the
        // cluster size itself; the hint is ignored on this platform.
        let target_disk = extract_parent_disk(identifier);

        let output = Command::new("diskutil")
            .args([
                "eraseDisk",
                fs_type.as_diskutil_format(),
                label,
                &target_disk,
            ])
            .output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("busy") {
                return Err(DiskError::DeviceBusy);
            }
            return Err(DiskError::CommandFailed(stderr.to_string()));
        }

        Ok(())
    }

    async fn finalize(&self, _path: &str) -> Result<(), DiskError> {
        // The system re-reads the partition map when the raw device closes.
        Ok(())
    }

    fn has_privileges(&self) -> bool {
        crate::utils::is_root()
    }
}

/// Partition identifiers look like disk4s1; whole disks like disk4.
fn is_partition_identifier(identifier: &str) -> bool {
    identifier.contains('s')
        && identifier
            .split('s')
            .next_back()
            .is_some_and(|s| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()))
        && identifier.starts_with("disk")
        && identifier != "disk"
}

/// Extract parent disk from partition identifier
/// e.g., disk4s1 -> disk4, disk4s2 -> disk4, disk0s1 -> disk0
fn extract_parent_disk(identifier: &str) -> String {
    let bytes = identifier.as_bytes();
    for i in (1..bytes.len()).rev() {
        if bytes[i] == b's' && bytes[i - 1].is_ascii_digit() {
            return identifier[..i].to_string();
        }
    }
    // No partition separator found, return as-is
    identifier.to_string()
}
