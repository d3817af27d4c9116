use async_trait::async_trait;

use super::{ClusterSize, DeviceDescriptor, DiskError, FileSystemType};

/// Trait for platform-specific disk operations.
///
/// One implementation per host OS, selected once at startup by
/// [`crate::platform::get_disk_manager`]. Everything above this trait is
/// platform-neutral: the catalog filters and orders what `list_devices`
/// returns, and the flasher drives `unmount`/`format`/`finalize` around its
/// own raw image write.
#[async_trait]
pub trait DiskManager: Send + Sync {
    /// Enumerates block devices visible to the host.
    ///
    /// Returns every candidate with its removable/system flags set; filtering
    /// happens in the catalog. A device whose metadata cannot be resolved is
    /// still returned with the unknown fields empty, never omitted.
    ///
    /// Fails with [`DiskError::DiscoveryUnavailable`] when the host has no
    /// usable enumeration facility, which callers must keep distinct from an
    /// empty list.
    async fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, DiskError>;

    /// Unmounts the device (and any mounted partitions) at the given path.
    /// Called before formatting and again before the raw write; "already
    /// unmounted" is success.
    async fn unmount(&self, path: &str) -> Result<(), DiskError>;

    /// Path to open for raw block writes against this device id. Identity on
    /// unix, where the id already names the block device; Windows maps a
    /// drive letter like `E:` into the `\\.\E:` device namespace, since the
    /// bare letter resolves to a directory path.
    fn raw_device_path(&self, id: &str) -> String {
        id.to_string()
    }

    /// Formats the device with the specified filesystem and label. The
    /// cluster-size hint is advisory; tools that cannot honor it ignore it.
    async fn format(
        &self,
        path: &str,
        fs_type: FileSystemType,
        cluster_size: ClusterSize,
        label: &str,
    ) -> Result<(), DiskError>;

    /// Post-write fix-up: make the OS re-read the partition table the image
    /// brought along. No-op on platforms that pick it up automatically.
    async fn finalize(&self, path: &str) -> Result<(), DiskError>;

    /// Checks if running with elevated privileges (root/admin)
    fn has_privileges(&self) -> bool;
}
