pub mod catalog;
pub mod disk_ops;
pub mod flasher;

use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use thiserror::Error;

/// One candidate removable drive, as reported by a [`catalog::DriveCatalog`]
/// scan.
///
/// Descriptors are immutable snapshots: a new list is produced on every scan
/// and the previous one is discarded wholesale. `id` is the platform device
/// path (`/dev/sdb`, `/dev/disk4`, `E:`) and is the only field that
/// participates in equality and selection.
#[derive(Debug, Clone)]
pub struct DeviceDescriptor {
    /// Platform device path or drive letter, unique within one scan.
    pub id: String,
    /// Human-readable name; may be empty when the OS reports none.
    pub label: String,
    /// Filesystem currently on the device, when the OS reports one.
    pub filesystem: Option<String>,
    /// Total capacity in bytes.
    pub total_bytes: u64,
    /// Free space in bytes; unknown on platforms that only expose raw disks.
    pub free_bytes: Option<u64>,
    /// Hot-pluggable per the OS. The catalog only returns removable devices;
    /// backends still report the flag so filtering stays in one place.
    pub is_removable: bool,
    /// Device hosts the running system or boot volume. Never eligible.
    pub is_system: bool,
}

impl PartialEq for DeviceDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for DeviceDescriptor {}

impl Hash for DeviceDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// The boot image selected for writing. An opaque byte source; nothing here
/// interprets the ISO format.
#[derive(Debug, Clone)]
pub struct ImageSource {
    pub path: PathBuf,
    pub size_bytes: u64,
}

impl ImageSource {
    /// Stats `path` and captures its size. Fails if the file is missing,
    /// unreadable, or empty.
    ///
    /// This is a convenience for selection time; the flasher re-validates the
    /// image when an operation actually starts, so a file deleted in between
    /// is still caught before anything touches the device.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, DiskError> {
        let path = path.as_ref();
        let meta = std::fs::metadata(path)?;
        if !meta.is_file() || meta.len() == 0 {
            return Err(DiskError::InvalidImage(path.display().to_string()));
        }
        Ok(Self {
            path: path.to_path_buf(),
            size_bytes: meta.len(),
        })
    }
}

/// User-chosen options for one flash run.
#[derive(Debug, Clone, Copy)]
pub struct FlashConfig {
    /// Format the device before writing the image.
    pub do_format: bool,
    /// Filesystem to create when formatting.
    pub target_filesystem: FileSystemType,
    /// Advisory cluster size; format tools may ignore it.
    pub cluster_size: ClusterSize,
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            do_format: false,
            target_filesystem: FileSystemType::Fat32,
            cluster_size: ClusterSize::Default,
        }
    }
}

/// Filesystems the format stage can create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileSystemType {
    Fat32,
    Ntfs,
    ExFat,
}

impl FileSystemType {
    /// Get the filesystem name as used by diskutil
    pub fn as_diskutil_format(&self) -> &'static str {
        match self {
            FileSystemType::Fat32 => "FAT32",
            FileSystemType::Ntfs => "NTFS",
            FileSystemType::ExFat => "ExFAT",
        }
    }

    /// Name understood by Windows `Format-Volume -FileSystem`.
    pub fn as_windows_format(&self) -> &'static str {
        match self {
            FileSystemType::Fat32 => "FAT32",
            FileSystemType::Ntfs => "NTFS",
            FileSystemType::ExFat => "exFAT",
        }
    }

    /// Get display name
    pub fn display_name(&self) -> &'static str {
        match self {
            FileSystemType::Fat32 => "FAT32",
            FileSystemType::Ntfs => "NTFS",
            FileSystemType::ExFat => "exFAT",
        }
    }
}

/// Advisory cluster-size hint forwarded to the format tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClusterSize {
    /// Let the tool pick.
    #[default]
    Default,
    K4,
    K8,
    K16,
    K32,
    K64,
}

impl ClusterSize {
    /// Cluster size in bytes, or `None` for the tool's default.
    pub fn as_bytes(&self) -> Option<u32> {
        match self {
            ClusterSize::Default => None,
            ClusterSize::K4 => Some(4 * 1024),
            ClusterSize::K8 => Some(8 * 1024),
            ClusterSize::K16 => Some(16 * 1024),
            ClusterSize::K32 => Some(32 * 1024),
            ClusterSize::K64 => Some(64 * 1024),
        }
    }
}

/// Errors that can occur during disk operations
#[derive(Error, Debug)]
pub enum DiskError {
    #[error("device is busy or in use")]
    DeviceBusy,

    #[error("insufficient privileges - run as root/admin")]
    InsufficientPrivileges,

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("image is missing, unreadable, or empty: {0}")]
    InvalidImage(String),

    #[error("device enumeration is not available on this host: {0}")]
    DiscoveryUnavailable(String),

    #[error("command failed: {0}")]
    CommandFailed(String),

    #[error("parse error: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}
