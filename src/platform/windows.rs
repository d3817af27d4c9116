use async_trait::async_trait;
use serde::Deserialize;
use std::io;
use std::process::Command;

use crate::core::disk_ops::DiskManager;
use crate::core::{ClusterSize, DeviceDescriptor, DiskError, FileSystemType};

/// Windows disk manager driving PowerShell CIM queries and Format-Volume.
pub struct WindowsDiskManager;

impl WindowsDiskManager {
    pub fn new() -> Self {
        Self
    }

    fn parse_logical_disks(&self, output: &str) -> Result<Vec<DeviceDescriptor>, DiskError> {
        let trimmed = output.trim();
        if trimmed.is_empty() {
            // No removable drives at all; ConvertTo-Json emits nothing.
            return Ok(Vec::new());
        }

        // ConvertTo-Json drops the array for a single element.
        let disks: OneOrMany<LogicalDisk> =
            serde_json::from_str(trimmed).map_err(|e| DiskError::ParseError(e.to_string()))?;

        Ok(disks
            .into_vec()
            .into_iter()
            .filter(|d| !d.device_id.is_empty())
            .map(|d| DeviceDescriptor {
                id: d.device_id,
                label: d.volume_name.unwrap_or_default(),
                filesystem: d.file_system,
                total_bytes: d.size.unwrap_or(0),
                free_bytes: d.free_space,
                // The query is already filtered to DriveType=2 (removable),
                // which can never host the running system volume.
                is_removable: true,
                is_system: false,
            })
            .collect())
    }
}

/// Extracts the letter from ids like `E:` or `E:\`.
fn drive_letter(path: &str) -> Result<char, DiskError> {
    let stem = path.trim_end_matches('\\').trim_end_matches(':');
    let mut chars = stem.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if c.is_ascii_alphabetic() => Ok(c.to_ascii_uppercase()),
        _ => Err(DiskError::DeviceNotFound(path.to_string())),
    }
}

impl Default for WindowsDiskManager {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(item) => vec![item],
            OneOrMany::Many(items) => items,
        }
    }
}

#[derive(Debug, Deserialize)]
struct LogicalDisk {
    #[serde(rename = "DeviceID", default)]
    device_id: String,
    #[serde(rename = "VolumeName")]
    volume_name: Option<String>,
    #[serde(rename = "FileSystem")]
    file_system: Option<String>,
    #[serde(rename = "Size")]
    size: Option<u64>,
    #[serde(rename = "FreeSpace")]
    free_space: Option<u64>,
}

fn powershell(script: &str) -> Result<std::process::Output, DiskError> {
    Command::new("powershell")
        .args(["-NoProfile", "-NonInteractive", "-Command", script])
        .output()
        .map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                DiskError::DiscoveryUnavailable("powershell is not available".to_string())
            } else {
                DiskError::IoError(e)
            }
        })
}

#[async_trait]
impl DiskManager for WindowsDiskManager {
    async fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, DiskError> {
        let output = powershell(
            "Get-CimInstance Win32_LogicalDisk -Filter 'DriveType=2' | \
             Select-Object DeviceID,VolumeName,FileSystem,Size,FreeSpace | ConvertTo-Json",
        )?;

        if !output.status.success() {
            return Err(DiskError::DiscoveryUnavailable(
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }

        self.parse_logical_disks(&String::from_utf8_lossy(&output.stdout))
    }

    async fn unmount(&self, path: &str) -> Result<(), DiskError> {
        // Flush and dismount the volume, keeping the drive letter so that
        // Format-Volume can still address it. Permanent=$false lets the
        // system remount on the next filesystem access.
        let letter = drive_letter(path)?;
        let script = format!(
            "Get-CimInstance Win32_Volume -Filter \"DriveLetter='{letter}:'\" | \
             Invoke-CimMethod -MethodName Dismount \
             -Arguments @{{Force=$true; Permanent=$false}} | Out-Null"
        );
        let output = powershell(&script)?;
        if !output.status.success() {
            return Err(DiskError::CommandFailed(
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }
        Ok(())
    }

    fn raw_device_path(&self, id: &str) -> String {
        // `E:` alone is a drive-relative path; writes to the block device go
        // through the device namespace.
        match drive_letter(id) {
            Ok(letter) => format!(r"\\.\{letter}:"),
            Err(_) => id.to_string(),
        }
    }

    async fn format(
        &self,
        path: &str,
        fs_type: FileSystemType,
        cluster_size: ClusterSize,
        label: &str,
    ) -> Result<(), DiskError> {
        let letter = drive_letter(path)?;
        let mut script = format!(
            "Format-Volume -DriveLetter {letter} -FileSystem {} -NewFileSystemLabel '{label}' -Force",
            fs_type.as_windows_format()
        );
        if let Some(bytes) = cluster_size.as_bytes() {
            script.push_str(&format!(" -AllocationUnitSize {bytes}"));
        }

        let output = powershell(&script)?;
        if !output.status.success() {
            return Err(DiskError::CommandFailed(
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }

        Ok(())
    }

    async fn finalize(&self, _path: &str) -> Result<(), DiskError> {
        Ok(())
    }

    fn has_privileges(&self) -> bool {
        // `net session` only succeeds in an elevated shell.
        Command::new("net")
            .arg("session")
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }
}
