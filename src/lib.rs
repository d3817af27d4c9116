//! Core library for creating bootable USB drives.
//!
//! `pendrive` is UI-agnostic: a desktop, TUI, or CLI front-end supplies the
//! image path and the destructive-action confirmation, and consumes the
//! structured progress events. Two components do the work:
//!
//! - [`DriveCatalog`] discovers removable, non-system drives on the host and
//!   returns immutable, deterministically ordered snapshots.
//! - [`FlashOperation`] drives one cancellable sequence against one device:
//!   validate, format (optional), write the image, finalize. Progress is
//!   derived from bytes confirmed written, reported as `{stage, percent,
//!   message}` events over a channel, and ends with exactly one terminal
//!   outcome.
//!
//! Platform specifics (lsblk, diskutil, PowerShell CIM) live behind the
//! [`DiskManager`] trait, selected once at startup via
//! [`platform::get_disk_manager`].
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pendrive::{DriveCatalog, FlashConfig, FlashEvent, FlashOperation, ImageSource};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let manager = pendrive::platform::get_disk_manager();
//!     let catalog = DriveCatalog::new(Arc::clone(&manager));
//!
//!     let devices = catalog.scan().await?;
//!     let target = devices.first().expect("no removable drives found").clone();
//!     let image = ImageSource::from_path("/isos/ubuntu-24.04.iso")?;
//!
//!     // The front-end must confirm the destructive action with the user
//!     // before this point; start() does not prompt.
//!     let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
//!     let handle = FlashOperation::start(manager, target, image, FlashConfig::default(), tx)?;
//!
//!     while let Some(event) = rx.recv().await {
//!         match event {
//!             FlashEvent::Progress { stage, percent, message } => {
//!                 println!("[{percent:3}%] {stage}: {message}");
//!             }
//!             FlashEvent::Done(outcome) => println!("{outcome:?}"),
//!         }
//!     }
//!     handle.wait().await?;
//!     Ok(())
//! }
//! ```

pub mod core;
pub mod platform;
pub mod utils;

pub use crate::core::catalog::{DiscoveryUnavailable, DriveCatalog};
pub use crate::core::disk_ops::DiskManager;
pub use crate::core::flasher::{
    FlashError, FlashEvent, FlashHandle, FlashOperation, FlashOutcome, Stage,
};
pub use crate::core::{
    ClusterSize, DeviceDescriptor, DiskError, FileSystemType, FlashConfig, ImageSource,
};
