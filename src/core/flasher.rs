use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use anyhow::{Context, Result, anyhow, bail};
use log::{info, warn};
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

use crate::core::catalog::DriveCatalog;
use crate::core::disk_ops::DiskManager;
use crate::core::{DeviceDescriptor, FlashConfig, ImageSource};
use crate::utils::bytes_to_human;

const WRITE_BUFFER_SIZE: usize = 1024 * 1024;

/// Active pipeline stages. `Pending` is implicit (a constructed but not yet
/// polled worker); the terminal states are carried by [`FlashOutcome`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Validating,
    Formatting,
    Writing,
    Finalizing,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Validating => "validating",
            Stage::Formatting => "formatting",
            Stage::Writing => "writing",
            Stage::Finalizing => "finalizing",
        }
    }

    /// Fixed percentage range this stage is allotted within the overall
    /// 0-100 bar. When formatting is disabled, writing absorbs its budget so
    /// the bar stays continuous.
    pub fn budget(&self, do_format: bool) -> (u8, u8) {
        match self {
            Stage::Validating => (0, 5),
            Stage::Formatting => (5, 50),
            Stage::Writing => (if do_format { 50 } else { 5 }, 95),
            Stage::Finalizing => (95, 100),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Errors terminal for one flash run. Destructive steps are never retried
/// internally; every variant reaches the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FlashError {
    /// A precondition failed before any destructive action; the device was
    /// not touched.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Another operation holds the mutual-exclusion key for this device id.
    #[error("an operation is already running on {0}")]
    AlreadyRunning(String),

    /// Host-level failure during a destructive stage. The device may be left
    /// partially modified and should not be trusted.
    #[error("I/O failure during {stage}: {message}")]
    Io { stage: Stage, message: String },
}

/// Terminal result of one run, also delivered as the final
/// [`FlashEvent::Done`] on the event channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlashOutcome {
    Succeeded,
    Failed { stage: Stage, error: FlashError },
    /// User-initiated stop, observed at a safe checkpoint. `last_progress`
    /// still within the validating budget means nothing was written; anything
    /// past it means the device was already modified.
    Cancelled { last_progress: u8 },
}

/// Progress stream for a single operation. Events arrive in strict stage
/// order with non-decreasing percent, ending with exactly one `Done`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlashEvent {
    Progress {
        stage: Stage,
        percent: u8,
        message: String,
    },
    Done(FlashOutcome),
}

// One operation per device id at a time, process-wide. Scoped to the id so
// unrelated devices can be flashed concurrently.
static ACTIVE_DEVICES: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();

struct DeviceClaim {
    id: String,
}

impl DeviceClaim {
    fn acquire(id: &str) -> Option<Self> {
        let lock = ACTIVE_DEVICES.get_or_init(|| Mutex::new(HashSet::new()));
        let mut active = match lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if active.insert(id.to_string()) {
            Some(Self { id: id.to_string() })
        } else {
            None
        }
    }
}

impl Drop for DeviceClaim {
    fn drop(&mut self) {
        if let Some(lock) = ACTIVE_DEVICES.get() {
            let mut active = match lock.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            active.remove(&self.id);
        }
    }
}

/// A single destructive write sequence against one device:
/// validate, format (optional), write the image, finalize.
///
/// [`start`](FlashOperation::start) claims the device id, spawns a worker,
/// and returns immediately; the caller follows the run through the event
/// channel and [`FlashHandle::wait`]. The worker yields at every stage and
/// chunk boundary, which are exactly the points where cancellation is
/// observed.
pub struct FlashOperation;

impl FlashOperation {
    /// Begins a flash run. Fails synchronously with
    /// [`FlashError::AlreadyRunning`] if the device id is already claimed;
    /// all other failures are reported through the events and the outcome.
    ///
    /// Callers are expected to have confirmed the destructive action with the
    /// user before calling this; no prompt happens here.
    pub fn start(
        manager: Arc<dyn DiskManager>,
        device: DeviceDescriptor,
        image: ImageSource,
        config: FlashConfig,
        events: UnboundedSender<FlashEvent>,
    ) -> Result<FlashHandle, FlashError> {
        let claim = DeviceClaim::acquire(&device.id)
            .ok_or_else(|| FlashError::AlreadyRunning(device.id.clone()))?;

        info!(
            "starting flash of {} ({}) onto {}",
            image.path.display(),
            bytes_to_human(image.size_bytes),
            device.id
        );

        let cancel = Arc::new(AtomicBool::new(false));
        let device_id = device.id.clone();
        let worker = FlashWorker {
            manager,
            device,
            image,
            config,
            events,
            cancel: cancel.clone(),
            last_percent: 0,
        };

        let join = tokio::spawn(async move {
            // Claim lives for the whole run; released on every exit path.
            let _claim = claim;
            worker.run().await
        });

        Ok(FlashHandle {
            device_id,
            cancel,
            join,
        })
    }
}

/// Caller-side handle to a running operation.
pub struct FlashHandle {
    device_id: String,
    cancel: Arc<AtomicBool>,
    join: JoinHandle<FlashOutcome>,
}

impl FlashHandle {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Requests a cooperative stop. Observed at the next stage or chunk
    /// boundary; never aborts a write mid-chunk.
    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Waits for the terminal outcome. The same outcome is also the final
    /// event on the channel.
    pub async fn wait(self) -> Result<FlashOutcome> {
        match self.join.await {
            Ok(outcome) => Ok(outcome),
            Err(e) => Err(anyhow!("flash worker panicked: {e:?}")),
        }
    }
}

enum WriteStatus {
    Completed,
    Cancelled,
}

struct FlashWorker {
    manager: Arc<dyn DiskManager>,
    device: DeviceDescriptor,
    image: ImageSource,
    config: FlashConfig,
    events: UnboundedSender<FlashEvent>,
    cancel: Arc<AtomicBool>,
    last_percent: u8,
}

impl FlashWorker {
    async fn run(mut self) -> FlashOutcome {
        let outcome = self.execute().await;
        match &outcome {
            FlashOutcome::Succeeded => info!("flash of {} succeeded", self.device.id),
            FlashOutcome::Failed { stage, error } => {
                warn!("flash of {} failed during {stage}: {error}", self.device.id)
            }
            FlashOutcome::Cancelled { last_progress } => info!(
                "flash of {} cancelled at {last_progress}%",
                self.device.id
            ),
        }
        let _ = self.events.send(FlashEvent::Done(outcome.clone()));
        outcome
    }

    async fn execute(&mut self) -> FlashOutcome {
        let do_format = self.config.do_format;

        // Validating: the safety gate. Nothing below touches the device
        // until this stage has passed in full.
        if self.cancel_requested() {
            return self.cancelled();
        }
        self.emit(Stage::Validating, 0, "Validating image and target device");
        if let Err(error) = self.validate().await {
            return FlashOutcome::Failed {
                stage: Stage::Validating,
                error,
            };
        }
        let (_, validated) = Stage::Validating.budget(do_format);
        self.emit(Stage::Validating, validated, "Validation complete");
        if self.cancel_requested() {
            return self.cancelled();
        }

        if do_format {
            let (lo, hi) = Stage::Formatting.budget(do_format);
            self.emit(
                Stage::Formatting,
                lo,
                format!(
                    "Formatting {} as {}",
                    self.device.id,
                    self.config.target_filesystem.display_name()
                ),
            );
            if let Err(error) = self.format_device().await {
                return FlashOutcome::Failed {
                    stage: Stage::Formatting,
                    error,
                };
            }
            self.emit(Stage::Formatting, hi, "Format complete");
            // Past this point the device is already modified; a cancellation
            // still honors the request but the reported progress tells the
            // caller data was written.
            if self.cancel_requested() {
                return self.cancelled();
            }
        }

        let (lo, hi) = Stage::Writing.budget(do_format);
        self.emit(
            Stage::Writing,
            lo,
            format!(
                "Writing {} to {}",
                bytes_to_human(self.image.size_bytes),
                self.device.id
            ),
        );
        match self.write_image(lo, hi).await {
            Ok(WriteStatus::Completed) => {
                self.emit(Stage::Writing, hi, "Write complete");
            }
            Ok(WriteStatus::Cancelled) => return self.cancelled(),
            Err(e) => {
                return FlashOutcome::Failed {
                    stage: Stage::Writing,
                    error: FlashError::Io {
                        stage: Stage::Writing,
                        message: format!("{e:#}"),
                    },
                };
            }
        }

        let (lo, hi) = Stage::Finalizing.budget(do_format);
        self.emit(Stage::Finalizing, lo, "Setting boot flags");
        if self.cancel_requested() {
            return self.cancelled();
        }
        if let Err(e) = self.manager.finalize(&self.device.id).await {
            return FlashOutcome::Failed {
                stage: Stage::Finalizing,
                error: FlashError::Io {
                    stage: Stage::Finalizing,
                    message: e.to_string(),
                },
            };
        }
        self.emit(Stage::Finalizing, hi, "Bootable USB created successfully");
        FlashOutcome::Succeeded
    }

    /// Re-checks every precondition at start time instead of trusting the
    /// possibly stale selection: the image must still be a readable non-empty
    /// file that fits the device, and the device id must appear in a fresh
    /// scan (it may have been unplugged since it was listed).
    async fn validate(&mut self) -> Result<(), FlashError> {
        if !self.manager.has_privileges() {
            return Err(FlashError::Validation(
                "insufficient privileges - run as root/admin".to_string(),
            ));
        }

        let meta = tokio::fs::metadata(&self.image.path).await.map_err(|e| {
            FlashError::Validation(format!(
                "image {} is not readable: {e}",
                self.image.path.display()
            ))
        })?;
        if !meta.is_file() || meta.len() == 0 {
            return Err(FlashError::Validation(format!(
                "image {} is empty or not a regular file",
                self.image.path.display()
            )));
        }
        // The file may have changed since selection; the fresh size is the
        // one the write stage will trust.
        self.image.size_bytes = meta.len();

        File::open(&self.image.path).await.map_err(|e| {
            FlashError::Validation(format!(
                "image {} cannot be opened: {e}",
                self.image.path.display()
            ))
        })?;

        let catalog = DriveCatalog::new(Arc::clone(&self.manager));
        let devices = catalog
            .scan()
            .await
            .map_err(|e| FlashError::Validation(e.to_string()))?;
        let current = devices
            .iter()
            .find(|d| d.id == self.device.id)
            .ok_or_else(|| {
                FlashError::Validation(format!(
                    "device {} is no longer present; rescan and select again",
                    self.device.id
                ))
            })?;

        if current.total_bytes > 0 && self.image.size_bytes > current.total_bytes {
            return Err(FlashError::Validation(format!(
                "image ({}) is larger than device ({})",
                bytes_to_human(self.image.size_bytes),
                bytes_to_human(current.total_bytes)
            )));
        }

        // Refresh capacity and metadata from the rescan.
        self.device = current.clone();
        Ok(())
    }

    async fn format_device(&mut self) -> Result<(), FlashError> {
        let io = |e: crate::core::DiskError| FlashError::Io {
            stage: Stage::Formatting,
            message: e.to_string(),
        };
        self.manager.unmount(&self.device.id).await.map_err(io)?;
        let label = volume_label(&self.image.path);
        self.manager
            .format(
                &self.device.id,
                self.config.target_filesystem,
                self.config.cluster_size,
                &label,
            )
            .await
            .map_err(io)
    }

    /// Copies the image to the device in aligned chunks, deriving progress
    /// from bytes confirmed written over the total, never from elapsed time.
    /// Cancellation is checked between chunks only, so a chunk is never torn.
    async fn write_image(&mut self, lo: u8, hi: u8) -> Result<WriteStatus> {
        // Formatting may leave the fresh volume mounted again, so detach
        // unconditionally before touching the raw device.
        self.manager
            .unmount(&self.device.id)
            .await
            .map_err(|e| anyhow!("failed to unmount {}: {e}", self.device.id))?;

        let total = self.image.size_bytes;
        let mut image = File::open(&self.image.path)
            .await
            .with_context(|| format!("failed to open image {}", self.image.path.display()))?;
        let raw_path = self.manager.raw_device_path(&self.device.id);
        let mut device = OpenOptions::new()
            .write(true)
            .open(&raw_path)
            .await
            .with_context(|| format!("failed to open device {raw_path}"))?;

        let mut buffer = vec![0u8; WRITE_BUFFER_SIZE];
        let mut written: u64 = 0;

        loop {
            if self.cancel.load(Ordering::SeqCst) {
                // Record what is confirmed on the device before stopping.
                let _ = device.sync_all().await;
                return Ok(WriteStatus::Cancelled);
            }

            let n = image
                .read(&mut buffer)
                .await
                .context("failed to read from image")?;
            if n == 0 {
                if written < total {
                    bail!(
                        "image truncated: expected {total} bytes, read {written}"
                    );
                }
                break;
            }

            device
                .write_all(&buffer[..n])
                .await
                .context("failed to write to device")?;
            written += n as u64;

            let span = (hi - lo) as u64;
            let percent = lo + (span * written.min(total) / total.max(1)) as u8;
            if percent > self.last_percent {
                self.emit(
                    Stage::Writing,
                    percent,
                    format!(
                        "Writing image... {} / {}",
                        bytes_to_human(written),
                        bytes_to_human(total)
                    ),
                );
            }
        }

        // The stage may only report its upper bound once the bytes are
        // durable, not merely buffered.
        if let Err(e) = device.sync_all().await {
            if sync_unsupported(&e) {
                return Ok(WriteStatus::Completed);
            }
            return Err(anyhow::Error::new(e).context("failed to sync device"));
        }

        Ok(WriteStatus::Completed)
    }

    fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn cancelled(&self) -> FlashOutcome {
        FlashOutcome::Cancelled {
            last_progress: self.last_percent,
        }
    }

    /// Sends one progress event, clamped so the reported percent never
    /// decreases within a run.
    fn emit(&mut self, stage: Stage, percent: u8, message: impl Into<String>) {
        let percent = percent.clamp(self.last_percent, 100);
        self.last_percent = percent;
        let _ = self.events.send(FlashEvent::Progress {
            stage,
            percent,
            message: message.into(),
        });
    }
}

/// macOS and BSD raw character devices reject fsync with "inappropriate
/// ioctl for device"; the write path to them is unbuffered anyway.
#[cfg(any(target_os = "macos", target_os = "freebsd"))]
fn sync_unsupported(e: &std::io::Error) -> bool {
    e.raw_os_error() == Some(libc::ENOTTY)
}

#[cfg(not(any(target_os = "macos", target_os = "freebsd")))]
fn sync_unsupported(_e: &std::io::Error) -> bool {
    false
}

/// Derives a FAT-safe volume label from the image file name: uppercased
/// alphanumerics, at most 11 characters.
fn volume_label(image_path: &Path) -> String {
    let label: String = image_path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .take(11)
        .collect();
    if label.is_empty() {
        "BOOTUSB".to_string()
    } else {
        label
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::io::Write;
    use std::path::PathBuf;
    use tempfile::TempDir;
    use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};

    use crate::core::disk_ops::DiskManager;
    use crate::core::{ClusterSize, DiskError, FileSystemType};

    /// In-memory backend whose "device" is a plain file, so the write engine
    /// runs for real without touching hardware.
    struct FakeDiskManager {
        devices: Mutex<Vec<DeviceDescriptor>>,
        format_calls: Mutex<Vec<(String, FileSystemType, ClusterSize, String)>>,
        unmount_calls: Mutex<Vec<String>>,
        raw_paths: Mutex<std::collections::HashMap<String, String>>,
    }

    impl FakeDiskManager {
        fn new(devices: Vec<DeviceDescriptor>) -> Self {
            Self {
                devices: Mutex::new(devices),
                format_calls: Mutex::new(Vec::new()),
                unmount_calls: Mutex::new(Vec::new()),
                raw_paths: Mutex::new(std::collections::HashMap::new()),
            }
        }

        /// Make a device id resolve to a different path for raw writes, the
        /// way the Windows backend maps `E:` to `\\.\E:`.
        fn map_raw_path(&self, id: &str, path: &str) {
            self.raw_paths
                .lock()
                .unwrap()
                .insert(id.to_string(), path.to_string());
        }

        fn format_calls(&self) -> Vec<(String, FileSystemType, ClusterSize, String)> {
            self.format_calls.lock().unwrap().clone()
        }

        fn unmount_calls(&self) -> Vec<String> {
            self.unmount_calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DiskManager for FakeDiskManager {
        async fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, DiskError> {
            Ok(self.devices.lock().unwrap().clone())
        }

        async fn unmount(&self, path: &str) -> Result<(), DiskError> {
            self.unmount_calls.lock().unwrap().push(path.to_string());
            Ok(())
        }

        fn raw_device_path(&self, id: &str) -> String {
            self.raw_paths
                .lock()
                .unwrap()
                .get(id)
                .cloned()
                .unwrap_or_else(|| id.to_string())
        }

        async fn format(
            &self,
            path: &str,
            fs_type: FileSystemType,
            cluster_size: ClusterSize,
            label: &str,
        ) -> Result<(), DiskError> {
            self.format_calls.lock().unwrap().push((
                path.to_string(),
                fs_type,
                cluster_size,
                label.to_string(),
            ));
            Ok(())
        }

        async fn finalize(&self, _path: &str) -> Result<(), DiskError> {
            Ok(())
        }

        fn has_privileges(&self) -> bool {
            true
        }
    }

    struct Bench {
        _dir: TempDir,
        manager: Arc<FakeDiskManager>,
        device: DeviceDescriptor,
        device_path: PathBuf,
        image: ImageSource,
    }

    /// One removable 8 GB device backed by a temp file, plus an image of the
    /// requested size filled with a repeating pattern.
    fn bench(image_len: usize) -> Bench {
        let dir = TempDir::new().unwrap();
        let device_path = dir.path().join("fake-device");
        std::fs::File::create(&device_path).unwrap();

        let image_path = dir.path().join("boot.iso");
        let mut f = std::fs::File::create(&image_path).unwrap();
        let pattern: Vec<u8> = (0..image_len).map(|i| (i % 251) as u8).collect();
        f.write_all(&pattern).unwrap();
        drop(f);

        let device = DeviceDescriptor {
            id: device_path.to_string_lossy().to_string(),
            label: "SANDISK".to_string(),
            filesystem: Some("vfat".to_string()),
            total_bytes: 8 * 1024 * 1024 * 1024,
            free_bytes: Some(8 * 1024 * 1024 * 1024),
            is_removable: true,
            is_system: false,
        };
        let manager = Arc::new(FakeDiskManager::new(vec![device.clone()]));
        let image = ImageSource::from_path(&image_path).unwrap();

        Bench {
            _dir: dir,
            manager,
            device,
            device_path,
            image,
        }
    }

    fn channel() -> (UnboundedSender<FlashEvent>, UnboundedReceiver<FlashEvent>) {
        unbounded_channel()
    }

    async fn drain(mut rx: UnboundedReceiver<FlashEvent>) -> Vec<FlashEvent> {
        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            let done = matches!(ev, FlashEvent::Done(_));
            events.push(ev);
            if done {
                break;
            }
        }
        events
    }

    fn assert_monotonic(events: &[FlashEvent]) {
        let mut last = 0u8;
        for ev in events {
            if let FlashEvent::Progress { percent, .. } = ev {
                assert!(
                    *percent >= last,
                    "progress went backwards: {last} -> {percent}"
                );
                last = *percent;
            }
        }
    }

    #[tokio::test]
    async fn full_run_without_format_succeeds_at_100() {
        let b = bench(3 * WRITE_BUFFER_SIZE + 4096);
        let (tx, rx) = channel();
        let handle = FlashOperation::start(
            b.manager.clone(),
            b.device.clone(),
            b.image.clone(),
            FlashConfig::default(),
            tx,
        )
        .unwrap();

        let outcome = handle.wait().await.unwrap();
        assert_eq!(outcome, FlashOutcome::Succeeded);

        let events = drain(rx).await;
        assert_monotonic(&events);
        assert_eq!(events.last(), Some(&FlashEvent::Done(FlashOutcome::Succeeded)));

        // Writing absorbs the formatting budget: first writing event at 5,
        // last at 95, and the bar ends at exactly 100.
        let writing: Vec<u8> = events
            .iter()
            .filter_map(|ev| match ev {
                FlashEvent::Progress {
                    stage: Stage::Writing,
                    percent,
                    ..
                } => Some(*percent),
                _ => None,
            })
            .collect();
        assert_eq!(writing.first(), Some(&5));
        assert_eq!(writing.last(), Some(&95));
        let final_percent = events
            .iter()
            .rev()
            .find_map(|ev| match ev {
                FlashEvent::Progress { percent, .. } => Some(*percent),
                _ => None,
            })
            .unwrap();
        assert_eq!(final_percent, 100);

        // The device file received the image bytes exactly.
        let image_bytes = std::fs::read(&b.image.path).unwrap();
        let device_bytes = std::fs::read(&b.device_path).unwrap();
        assert_eq!(image_bytes, device_bytes);

        // Raw write path still unmounts first; no format happened.
        assert!(b.manager.format_calls().is_empty());
        assert_eq!(b.manager.unmount_calls().len(), 1);
    }

    #[tokio::test]
    async fn full_run_with_format_stays_in_budgets() {
        let b = bench(2 * WRITE_BUFFER_SIZE);
        let (tx, rx) = channel();
        let config = FlashConfig {
            do_format: true,
            target_filesystem: FileSystemType::ExFat,
            cluster_size: ClusterSize::K32,
        };
        let handle = FlashOperation::start(
            b.manager.clone(),
            b.device.clone(),
            b.image.clone(),
            config,
            tx,
        )
        .unwrap();

        let outcome = handle.wait().await.unwrap();
        assert_eq!(outcome, FlashOutcome::Succeeded);

        let events = drain(rx).await;
        assert_monotonic(&events);

        let formats = b.manager.format_calls();
        assert_eq!(formats.len(), 1);
        assert_eq!(formats[0].0, b.device.id);
        assert_eq!(formats[0].1, FileSystemType::ExFat);
        assert_eq!(formats[0].2, ClusterSize::K32);
        assert_eq!(formats[0].3, "BOOT");

        // Once before formatting, once more before the raw write, since the
        // format tool may leave the fresh volume mounted.
        assert_eq!(b.manager.unmount_calls().len(), 2);

        for ev in &events {
            match ev {
                FlashEvent::Progress {
                    stage: Stage::Formatting,
                    percent,
                    ..
                } => assert!((5..=50).contains(percent)),
                FlashEvent::Progress {
                    stage: Stage::Writing,
                    percent,
                    ..
                } => assert!((50..=95).contains(percent)),
                _ => {}
            }
        }
    }

    // A device id need not be an openable path: Windows lists `E:` but raw
    // writes must go through the backend-mapped device namespace.
    #[tokio::test]
    async fn write_opens_the_backend_raw_path() {
        let dir = TempDir::new().unwrap();
        let raw_path = dir.path().join("raw-volume");
        std::fs::File::create(&raw_path).unwrap();

        let image_path = dir.path().join("boot.iso");
        std::fs::write(&image_path, vec![7u8; 8192]).unwrap();

        let device = DeviceDescriptor {
            id: "E:".to_string(),
            label: "SANDISK".to_string(),
            filesystem: Some("FAT32".to_string()),
            total_bytes: 8 * 1024 * 1024 * 1024,
            free_bytes: None,
            is_removable: true,
            is_system: false,
        };
        let manager = Arc::new(FakeDiskManager::new(vec![device.clone()]));
        manager.map_raw_path("E:", &raw_path.to_string_lossy());
        let image = ImageSource::from_path(&image_path).unwrap();

        let (tx, _rx) = channel();
        let handle =
            FlashOperation::start(manager.clone(), device, image, FlashConfig::default(), tx)
                .unwrap();
        assert_eq!(handle.wait().await.unwrap(), FlashOutcome::Succeeded);

        // The bytes landed in the mapped path; the id itself was never opened.
        assert_eq!(std::fs::read(&raw_path).unwrap(), vec![7u8; 8192]);
        assert_eq!(manager.unmount_calls(), vec!["E:".to_string()]);
    }

    #[tokio::test]
    async fn stale_device_id_fails_validation() {
        let b = bench(4096);
        let stale = DeviceDescriptor {
            id: "/dev/unplugged".to_string(),
            ..b.device.clone()
        };
        let (tx, rx) = channel();
        let handle = FlashOperation::start(
            b.manager.clone(),
            stale,
            b.image.clone(),
            FlashConfig::default(),
            tx,
        )
        .unwrap();

        let outcome = handle.wait().await.unwrap();
        assert!(matches!(
            outcome,
            FlashOutcome::Failed {
                stage: Stage::Validating,
                error: FlashError::Validation(_),
            }
        ));

        // No stage beyond validating was entered.
        for ev in drain(rx).await {
            if let FlashEvent::Progress { stage, .. } = ev {
                assert_eq!(stage, Stage::Validating);
            }
        }
        assert!(b.manager.format_calls().is_empty());
        assert!(b.manager.unmount_calls().is_empty());
    }

    #[tokio::test]
    async fn image_deleted_after_selection_fails_validation() {
        let b = bench(4096);
        std::fs::remove_file(&b.image.path).unwrap();

        let (tx, rx) = channel();
        let handle = FlashOperation::start(
            b.manager.clone(),
            b.device.clone(),
            b.image.clone(),
            FlashConfig::default(),
            tx,
        )
        .unwrap();

        let outcome = handle.wait().await.unwrap();
        assert!(matches!(
            outcome,
            FlashOutcome::Failed {
                stage: Stage::Validating,
                error: FlashError::Validation(_),
            }
        ));
        for ev in drain(rx).await {
            if let FlashEvent::Progress { stage, .. } = ev {
                assert_eq!(stage, Stage::Validating);
            }
        }
    }

    #[tokio::test]
    async fn image_larger_than_device_fails_validation() {
        let mut b = bench(4096);
        b.device.total_bytes = 1024;
        {
            let mut devices = b.manager.devices.lock().unwrap();
            devices[0].total_bytes = 1024;
        }

        let (tx, _rx) = channel();
        let handle = FlashOperation::start(
            b.manager.clone(),
            b.device.clone(),
            b.image.clone(),
            FlashConfig::default(),
            tx,
        )
        .unwrap();

        let outcome = handle.wait().await.unwrap();
        assert!(matches!(
            outcome,
            FlashOutcome::Failed {
                stage: Stage::Validating,
                error: FlashError::Validation(_),
            }
        ));
    }

    // Relies on the current-thread test runtime: the worker has not been
    // polled yet when the cancel lands, so the very first checkpoint sees it.
    #[tokio::test]
    async fn cancel_before_validation_touches_nothing() {
        let b = bench(2 * WRITE_BUFFER_SIZE);
        let before = std::fs::read(&b.device_path).unwrap();

        let (tx, rx) = channel();
        let handle = FlashOperation::start(
            b.manager.clone(),
            b.device.clone(),
            b.image.clone(),
            FlashConfig {
                do_format: true,
                ..FlashConfig::default()
            },
            tx,
        )
        .unwrap();
        handle.request_cancel();

        let outcome = handle.wait().await.unwrap();
        match outcome {
            FlashOutcome::Cancelled { last_progress } => assert!(last_progress <= 5),
            other => panic!("expected Cancelled, got {other:?}"),
        }

        assert!(b.manager.format_calls().is_empty());
        assert!(b.manager.unmount_calls().is_empty());
        assert_eq!(std::fs::read(&b.device_path).unwrap(), before);

        let events = drain(rx).await;
        assert!(matches!(
            events.last(),
            Some(FlashEvent::Done(FlashOutcome::Cancelled { .. }))
        ));
    }

    #[tokio::test]
    async fn cancel_mid_write_reports_partial_progress() {
        // Enough chunks that the worker must hit a checkpoint after the
        // cancel request lands.
        let b = bench(16 * WRITE_BUFFER_SIZE);
        let (tx, mut rx) = channel();
        let handle = FlashOperation::start(
            b.manager.clone(),
            b.device.clone(),
            b.image.clone(),
            FlashConfig {
                do_format: true,
                target_filesystem: FileSystemType::Fat32,
                cluster_size: ClusterSize::Default,
            },
            tx,
        )
        .unwrap();

        let mut requested = false;
        let mut outcome = None;
        while let Some(ev) = rx.recv().await {
            match ev {
                FlashEvent::Progress {
                    stage: Stage::Writing,
                    percent,
                    ..
                } if percent > 50 && !requested => {
                    handle.request_cancel();
                    requested = true;
                }
                FlashEvent::Done(done) => {
                    outcome = Some(done);
                    break;
                }
                _ => {}
            }
        }
        assert!(requested, "never observed writing progress");

        match outcome.unwrap() {
            FlashOutcome::Cancelled { last_progress } => {
                assert!(last_progress >= 50);
                assert!(last_progress < 100);
            }
            other => panic!("expected Cancelled, got {other:?}"),
        }
        let waited = handle.wait().await.unwrap();
        assert!(matches!(waited, FlashOutcome::Cancelled { .. }));
    }

    #[tokio::test]
    async fn second_start_on_same_device_is_rejected_immediately() {
        let b = bench(2 * WRITE_BUFFER_SIZE);
        let (tx1, _rx1) = channel();
        let handle = FlashOperation::start(
            b.manager.clone(),
            b.device.clone(),
            b.image.clone(),
            FlashConfig::default(),
            tx1,
        )
        .unwrap();

        let (tx2, _rx2) = channel();
        let second = FlashOperation::start(
            b.manager.clone(),
            b.device.clone(),
            b.image.clone(),
            FlashConfig::default(),
            tx2,
        );
        match second {
            Err(FlashError::AlreadyRunning(id)) => assert_eq!(id, b.device.id),
            Err(other) => panic!("expected AlreadyRunning, got {other:?}"),
            Ok(_) => panic!("second start was allowed"),
        }

        // The claim is released once the first run finishes.
        handle.wait().await.unwrap();
        let (tx3, _rx3) = channel();
        assert!(
            FlashOperation::start(
                b.manager.clone(),
                b.device.clone(),
                b.image.clone(),
                FlashConfig::default(),
                tx3,
            )
            .is_ok()
        );
    }

    #[test]
    fn writing_budget_absorbs_formatting_when_disabled() {
        assert_eq!(Stage::Validating.budget(false), (0, 5));
        assert_eq!(Stage::Writing.budget(false), (5, 95));
        assert_eq!(Stage::Writing.budget(true), (50, 95));
        assert_eq!(Stage::Formatting.budget(true), (5, 50));
        assert_eq!(Stage::Finalizing.budget(true), (95, 100));
    }

    #[test]
    fn volume_label_is_fat_safe() {
        assert_eq!(volume_label(Path::new("/isos/ubuntu-24.04.iso")), "UBUNTU2404");
        assert_eq!(
            volume_label(Path::new("a-very-long-distro-name.iso")),
            "AVERYLONGDI"
        );
        assert_eq!(volume_label(Path::new("---.iso")), "BOOTUSB");
    }
}
