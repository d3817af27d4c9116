use async_trait::async_trait;
use serde::Deserialize;
use std::io;
use std::process::Command;

use crate::core::disk_ops::DiskManager;
use crate::core::{ClusterSize, DeviceDescriptor, DiskError, FileSystemType};

/// Linux-specific disk manager using lsblk and standard Linux tools
pub struct LinuxDiskManager;

impl LinuxDiskManager {
    pub fn new() -> Self {
        Self
    }

    /// Parse lsblk JSON output into descriptors
    fn parse_lsblk_output(
        &self,
        output: &str,
        root_device: Option<&str>,
    ) -> Result<Vec<DeviceDescriptor>, DiskError> {
        let lsblk: LsblkOutput =
            serde_json::from_str(output).map_err(|e| DiskError::ParseError(e.to_string()))?;

        let mut devices = Vec::new();

        for block in lsblk.blockdevices {
            // Skip virtual devices and anything that is not a whole disk;
            // partitions show up as children.
            if block.name.starts_with("loop")
                || block.name.starts_with("ram")
                || block.name.starts_with("zram")
                || block.device_type != "disk"
            {
                continue;
            }

            let path = block
                .path
                .clone()
                .unwrap_or_else(|| format!("/dev/{}", block.name));

            // A size of zero usually means an empty card reader slot.
            let total_bytes = block.size.unwrap_or(0);
            if total_bytes == 0 {
                continue;
            }

            // The disk backing the root filesystem (or holding its partition)
            // is the system disk regardless of its removable flag.
            let is_system = root_device
                .map(|rd| rd == path || holds_partition(&path, rd))
                .unwrap_or(false);

            // Label, filesystem, and free space live on the partitions for
            // most sticks; take the first child that reports each. Missing
            // metadata leaves the field unknown rather than hiding the disk.
            let children = block.children.as_deref().unwrap_or(&[]);
            let label = block
                .label
                .clone()
                .or_else(|| children.iter().find_map(|c| c.label.clone()))
                .unwrap_or_default();
            let filesystem = block
                .fstype
                .clone()
                .or_else(|| children.iter().find_map(|c| c.fstype.clone()));
            let free_bytes = block
                .fsavail
                .or_else(|| children.iter().find_map(|c| c.fsavail));

            devices.push(DeviceDescriptor {
                id: path,
                label,
                filesystem,
                total_bytes,
                free_bytes,
                is_removable: block.rm.unwrap_or(false),
                is_system,
            });
        }

        Ok(devices)
    }

    /// Get the device containing the root filesystem
    fn get_root_device(&self) -> Option<String> {
        let output = Command::new("findmnt")
            .args(["-n", "-o", "SOURCE", "/"])
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let source = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if source.is_empty() {
            return None;
        }

        // LVM and dm-crypt roots (/dev/mapper/...) share no name with their
        // backing disk; PKNAME resolves the parent either way. Partition
        // sources fall back to name matching if lsblk cannot resolve them.
        if let Ok(pk) = Command::new("lsblk").args(["-no", "PKNAME", &source]).output() {
            if pk.status.success() {
                let stdout = String::from_utf8_lossy(&pk.stdout);
                if let Some(name) = stdout.split_whitespace().next() {
                    return Some(format!("/dev/{name}"));
                }
            }
        }

        Some(source)
    }
}

/// Whether `source` names a partition of the whole disk at `disk_path`:
/// the remainder after the disk path must start with a partition number
/// (`/dev/sda` + `1`, `/dev/nvme0n1` + `p2`). A bare prefix is not enough,
/// `/dev/sdab1` lives on `/dev/sdab`, not `/dev/sda`.
fn holds_partition(disk_path: &str, source: &str) -> bool {
    let Some(rest) = source.strip_prefix(disk_path) else {
        return false;
    };
    let mut chars = rest.chars();
    match chars.next() {
        Some(c) if c.is_ascii_digit() => true,
        Some('p') => chars.next().is_some_and(|c| c.is_ascii_digit()),
        _ => false,
    }
}

impl Default for LinuxDiskManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Structures for parsing lsblk JSON output (`-b` keeps sizes in bytes)
#[derive(Debug, Deserialize)]
struct LsblkOutput {
    blockdevices: Vec<BlockDevice>,
}

#[derive(Debug, Deserialize)]
struct BlockDevice {
    name: String,
    size: Option<u64>,
    #[serde(rename = "type")]
    device_type: String,
    fstype: Option<String>,
    label: Option<String>,
    path: Option<String>,
    rm: Option<bool>,
    fsavail: Option<u64>,
    children: Option<Vec<BlockDevice>>,
}

#[async_trait]
impl DiskManager for LinuxDiskManager {
    async fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, DiskError> {
        let output = Command::new("lsblk")
            .args([
                "--json",
                "-b",
                "-o",
                "NAME,SIZE,TYPE,FSTYPE,LABEL,PATH,RM,FSAVAIL",
            ])
            .output()
            .map_err(|e| {
                if e.kind() == io::ErrorKind::NotFound {
                    DiskError::DiscoveryUnavailable("lsblk is not installed".to_string())
                } else {
                    DiskError::IoError(e)
                }
            })?;

        if !output.status.success() {
            return Err(DiskError::DiscoveryUnavailable(
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let root_device = self.get_root_device();
        self.parse_lsblk_output(&stdout, root_device.as_deref())
    }

    async fn unmount(&self, path: &str) -> Result<(), DiskError> {
        let output = Command::new("umount").arg(path).output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("busy") || stderr.contains("target is busy") {
                return Err(DiskError::DeviceBusy);
            }
            if stderr.contains("not mounted") {
                // Already unmounted, treat as success
                return Ok(());
            }
            return Err(DiskError::CommandFailed(stderr.to_string()));
        }

        Ok(())
    }

    async fn format(
        &self,
        path: &str,
        fs_type: FileSystemType,
        cluster_size: ClusterSize,
        label: &str,
    ) -> Result<(), DiskError> {
        let (cmd, mut args) = match fs_type {
            FileSystemType::Fat32 => (
                "mkfs.vfat",
                vec![
                    "-F".to_string(),
                    "32".to_string(),
                    "-n".to_string(),
                    label.to_string(),
                ],
            ),
            FileSystemType::ExFat => ("mkfs.exfat", vec!["-n".to_string(), label.to_string()]),
            FileSystemType::Ntfs => (
                "mkfs.ntfs",
                vec!["-f".to_string(), "-L".to_string(), label.to_string()],
            ),
        };

        if let Some(bytes) = cluster_size.as_bytes() {
            match fs_type {
                // mkfs.vfat takes sectors per cluster, not bytes.
                FileSystemType::Fat32 => {
                    args.push("-s".to_string());
                    args.push((bytes / 512).to_string());
                }
                FileSystemType::ExFat | FileSystemType::Ntfs => {
                    args.push("-c".to_string());
                    args.push(bytes.to_string());
                }
            }
        }
        args.push(path.to_string());

        let output = Command::new(cmd).args(&args).output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("busy") {
                return Err(DiskError::DeviceBusy);
            }
            return Err(DiskError::CommandFailed(stderr.to_string()));
        }

        Ok(())
    }

    async fn finalize(&self, path: &str) -> Result<(), DiskError> {
        // The written image brings its own partition table; have the kernel
        // re-read it.
        let output = Command::new("blockdev").args(["--rereadpt", path]).output()?;

        if !output.status.success() {
            return Err(DiskError::CommandFailed(
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }

        Ok(())
    }

    fn has_privileges(&self) -> bool {
        crate::utils::is_root()
    }
}
