//! Operation outcomes and device failures
//!
//! Every terminal step of a save/load produces an [`OperationOutcome`]. Device
//! completions carry either a [`CallOutput`] or a [`DeviceFailure`].

use std::fmt;

use crate::platform::device::MountHandle;

/// Result of a save or load operation, and the failure taxonomy used by devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationOutcome {
    Success,
    /// Another operation holds the device
    Busy,
    UserCanceled,
    NoFreeSpace,
    Corrupted,
    NotFound,
    GenericError,
}

impl OperationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, OperationOutcome::Success)
    }

    /// Whether a load with this outcome should be reported as successful.
    ///
    /// A missing save is not an error: the caller gets an empty payload.
    pub fn is_loadable(&self) -> bool {
        matches!(self, OperationOutcome::Success | OperationOutcome::NotFound)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationOutcome::Success => "success",
            OperationOutcome::Busy => "busy",
            OperationOutcome::UserCanceled => "user canceled",
            OperationOutcome::NoFreeSpace => "no free space",
            OperationOutcome::Corrupted => "corrupted",
            OperationOutcome::NotFound => "not found",
            OperationOutcome::GenericError => "generic error",
        }
    }
}

impl fmt::Display for OperationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generic internal error code used when a device has no native code to report
pub const CODE_INTERNAL: u32 = 0x8080_0001;

/// A failed device call.
///
/// `code` is the vendor/OS error code shown in the generic error dialog.
/// `required_blocks` is only meaningful for [`OperationOutcome::NoFreeSpace`]
/// on mount.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{outcome} (code {code:#010x})")]
pub struct DeviceFailure {
    pub outcome: OperationOutcome,
    pub code: u32,
    pub required_blocks: u64,
}

impl DeviceFailure {
    pub fn new(outcome: OperationOutcome, code: u32) -> Self {
        debug_assert!(
            outcome != OperationOutcome::Success,
            "a failure cannot carry a success outcome"
        );
        Self {
            outcome,
            code,
            required_blocks: 0,
        }
    }

    /// Transport or internal failure with the generic code
    pub fn internal() -> Self {
        Self::new(OperationOutcome::GenericError, CODE_INTERNAL)
    }

    pub fn busy() -> Self {
        Self::new(OperationOutcome::Busy, CODE_INTERNAL)
    }

    pub fn not_found() -> Self {
        Self::new(OperationOutcome::NotFound, CODE_INTERNAL)
    }

    pub fn corrupted() -> Self {
        Self::new(OperationOutcome::Corrupted, CODE_INTERNAL)
    }

    pub fn no_free_space(required_blocks: u64) -> Self {
        Self {
            required_blocks,
            ..Self::new(OperationOutcome::NoFreeSpace, CODE_INTERNAL)
        }
    }

    /// Map an I/O error from a filesystem-backed device
    pub fn from_io(err: &std::io::Error) -> Self {
        let code = err.raw_os_error().map(|c| c as u32).unwrap_or(CODE_INTERNAL);
        let outcome = match err.kind() {
            std::io::ErrorKind::NotFound => OperationOutcome::NotFound,
            std::io::ErrorKind::StorageFull => OperationOutcome::NoFreeSpace,
            std::io::ErrorKind::InvalidData => OperationOutcome::Corrupted,
            _ => OperationOutcome::GenericError,
        };
        Self::new(outcome, code)
    }
}

/// Successful completion payload of a device call
#[derive(Debug)]
pub enum CallOutput {
    /// Configure, write, unmount, delete, check/restore backup
    Unit,
    Mounted(MountHandle),
    /// Bytes read by a read transfer
    Data(Vec<u8>),
    /// Dialog was dismissed with the given result code
    DialogClosed(i32),
}

/// Completion of a single device call
pub type CallResult = Result<CallOutput, DeviceFailure>;
