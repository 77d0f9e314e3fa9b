//! Save device capability surface
//!
//! One implementation per storage target. The controller drives every target
//! through this trait, so recovery logic is written once.
//!
//! Contract for every call:
//! - Return `Err` only if the call could not be issued at all. The controller
//!   treats that as an immediate completion and waits for nothing.
//! - Otherwise post exactly one [`DeviceEvent`](crate::persistence::DeviceEvent)
//!   carrying the same [`Ticket`] once the call finishes.

use std::fmt;
use std::sync::Arc;

use crate::persistence::{DeviceFailure, Ticket, TransferProgress};

/// Opaque handle to a mounted container.
///
/// Not `Clone`: the operation that mounted the container owns it and gives it
/// back through [`SaveDevice::unmount`].
#[derive(PartialEq, Eq)]
pub struct MountHandle {
    id: u64,
    mount_point: String,
}

impl MountHandle {
    /// Devices mint handles when a mount completes
    pub fn new(id: u64, mount_point: impl Into<String>) -> Self {
        Self {
            id,
            mount_point: mount_point.into(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn mount_point(&self) -> &str {
        &self.mount_point
    }
}

impl fmt::Debug for MountHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountHandle")
            .field("id", &self.id)
            .field("mount_point", &self.mount_point)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountMode {
    ReadOnly,
    /// Create the container if missing, reserving `blocks` blocks
    ReadWrite { blocks: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRequest {
    pub user_id: i32,
    pub dir_name: String,
    pub mode: MountMode,
}

/// Per-container metadata set during the configure step
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerParams {
    pub title: String,
    pub subtitle: String,
    pub detail: String,
    /// PNG bytes
    pub icon: Option<Arc<[u8]>>,
}

/// A blob transfer within a mounted container
#[derive(Debug, Clone)]
pub enum Transfer {
    Write {
        filename: String,
        payload: Arc<[u8]>,
        chunk_size: usize,
        progress: TransferProgress,
    },
    Read {
        filename: String,
        chunk_size: usize,
        progress: TransferProgress,
    },
}

impl Transfer {
    pub fn filename(&self) -> &str {
        match self {
            Transfer::Write { filename, .. } | Transfer::Read { filename, .. } => filename,
        }
    }
}

/// Which flow opened a dialog
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogContext {
    Save,
    Load,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogKind {
    /// Not enough space to create the container
    NoFreeSpace { required_blocks: u64 },
    /// Not enough space to restore the backup
    NoFreeSpaceRestore,
    /// Corrupted data will be (or was) deleted
    DataCorruptedDeleted,
    /// Corrupted data will be restored from backup
    DataCorruptedRestore,
    GenericError { code: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialogRequest {
    pub user_id: i32,
    pub dir_name: String,
    pub context: DialogContext,
    pub kind: DialogKind,
}

impl DialogRequest {
    /// Human-readable text for devices that render dialogs themselves
    pub fn message(&self) -> String {
        match self.kind {
            DialogKind::NoFreeSpace { required_blocks } => format!(
                "There is not enough free space to save. {} more blocks are required.",
                required_blocks
            ),
            DialogKind::NoFreeSpaceRestore => {
                "There is not enough free space to restore the backup.".to_string()
            }
            DialogKind::DataCorruptedDeleted => {
                "The save data is corrupted and will be deleted.".to_string()
            }
            DialogKind::DataCorruptedRestore => {
                "The save data is corrupted. It will be restored from the backup.".to_string()
            }
            DialogKind::GenericError { code } => {
                let action = match self.context {
                    DialogContext::Save => "saving",
                    DialogContext::Load => "loading",
                };
                format!("An error occurred while {} ({:#010x}).", action, code)
            }
        }
    }
}

/// Asynchronous storage target driven by the save-data controller
pub trait SaveDevice {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Whether containers carry title/icon metadata that is set after mounting
    fn supports_metadata(&self) -> bool {
        false
    }

    /// Completes with `CallOutput::Mounted`
    fn mount(&mut self, ticket: Ticket, request: &MountRequest) -> Result<(), DeviceFailure>;

    fn configure(
        &mut self,
        ticket: Ticket,
        handle: &MountHandle,
        params: &ContainerParams,
    ) -> Result<(), DeviceFailure>;

    /// Writes complete with `CallOutput::Unit`, reads with `CallOutput::Data`
    fn transfer(
        &mut self,
        ticket: Ticket,
        handle: &MountHandle,
        transfer: Transfer,
    ) -> Result<(), DeviceFailure>;

    /// Release the container, optionally refreshing its backup copy
    fn unmount(
        &mut self,
        ticket: Ticket,
        handle: MountHandle,
        backup: bool,
    ) -> Result<(), DeviceFailure>;

    fn delete(&mut self, ticket: Ticket, user_id: i32, dir_name: &str)
    -> Result<(), DeviceFailure>;

    /// `Ok(Unit)` if a backup exists, `NotFound` if it does not
    fn check_backup(
        &mut self,
        ticket: Ticket,
        user_id: i32,
        dir_name: &str,
    ) -> Result<(), DeviceFailure>;

    fn restore_backup(
        &mut self,
        ticket: Ticket,
        user_id: i32,
        dir_name: &str,
    ) -> Result<(), DeviceFailure>;

    /// Completes with `CallOutput::DialogClosed` once the user dismisses it
    fn open_dialog(&mut self, ticket: Ticket, request: &DialogRequest)
    -> Result<(), DeviceFailure>;
}

/// Of the two backup slots `<pointer>0` and `<pointer>1`, the one that is
/// not the current backup. Devices without an atomic rename write the new
/// backup there and then repoint.
pub fn spare_backup_slot(pointer: &str, current: Option<&str>) -> String {
    let first = format!("{}0", pointer);
    if current == Some(first.as_str()) {
        format!("{}1", pointer)
    } else {
        first
    }
}
