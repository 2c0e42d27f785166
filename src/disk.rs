//! State disk seam.
//!
//! The encrypted state disk is driven by an external collaborator. Every use
//! is scoped: open, operate, close. [`DiskSession`] closes the device when it
//! goes out of scope, including on early returns.

use std::sync::Arc;

use tracing::warn;

use crate::error::{Result, ResultExt};

/// Manages the encrypted state disk.
pub trait EncryptedDisk: Send + Sync {
    /// Prepare the underlying device for disk operations.
    fn open(&self) -> Result<()>;
    /// Close the underlying device.
    fn close(&self) -> Result<()>;
    /// The device UUID.
    fn uuid(&self) -> Result<String>;
    /// Replace the initial random passphrase with a permanent one.
    fn update_passphrase(&self, passphrase: &[u8]) -> Result<()>;
}

/// An open disk, closed on drop.
pub struct DiskSession<'a> {
    disk: &'a dyn EncryptedDisk,
}

impl<'a> DiskSession<'a> {
    pub fn open(disk: &'a dyn EncryptedDisk) -> Result<Self> {
        disk.open().context("opening disk")?;
        Ok(Self { disk })
    }

    pub fn uuid(&self) -> Result<String> {
        self.disk.uuid().context("retrieving disk UUID")
    }

    pub fn update_passphrase(&self, passphrase: &[u8]) -> Result<()> {
        self.disk
            .update_passphrase(passphrase)
            .context("updating disk passphrase")
    }
}

impl Drop for DiskSession<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.disk.close() {
            warn!(error = %err, "failed to close state disk");
        }
    }
}

/// Read the disk UUID in its own session.
pub fn read_uuid(disk: &Arc<dyn EncryptedDisk>) -> Result<String> {
    DiskSession::open(disk.as_ref())?.uuid()
}

/// Set the permanent passphrase in its own session.
pub fn set_passphrase(disk: &Arc<dyn EncryptedDisk>, passphrase: &[u8]) -> Result<()> {
    DiskSession::open(disk.as_ref())?.update_passphrase(passphrase)
}
