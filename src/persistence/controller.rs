//! Save-data controller
//!
//! Owns one container mount at a time and sequences
//! mount → configure → transfer → unmount(backup), with bounded recovery:
//!
//! - `NoFreeSpace` on save mount: prompt, then fail (no retry)
//! - `Corrupted` on save mount: prompt, delete, retry once
//! - `Corrupted` on load mount: restore from backup and retry once, or
//!   delete and report `NotFound` if there is no backup
//! - anything else: generic error dialog, `GenericError`
//!
//! The controller is a polled state machine. [`SaveDataController::update`]
//! is called once per tick and consumes at most one completion event. Every
//! device call suspends the machine until its completion arrives; a second
//! call is never issued while one is pending.

use std::sync::Arc;

use super::chunked::TransferProgress;
use super::dispatch::{CallKind, DeviceEvent, DispatchQueue, Ticket};
use super::outcome::{CallOutput, CallResult, DeviceFailure, OperationOutcome};
use crate::consts::MAX_RECOVERY_ATTEMPTS;
use crate::platform::device::{
    ContainerParams, DialogContext, DialogKind, DialogRequest, MountHandle, MountMode,
    MountRequest, SaveDevice, Transfer,
};
use crate::settings::Settings;

/// Work handed to the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    CommitSave {
        filename: String,
        payload: Arc<[u8]>,
    },
    LoadSave {
        filename: String,
    },
}

impl Operation {
    pub fn save(filename: impl Into<String>, payload: Vec<u8>) -> Self {
        Operation::CommitSave {
            filename: filename.into(),
            payload: payload.into(),
        }
    }

    pub fn load(filename: impl Into<String>) -> Self {
        Operation::LoadSave {
            filename: filename.into(),
        }
    }

    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::CommitSave { .. } => OperationKind::Save,
            Operation::LoadSave { .. } => OperationKind::Load,
        }
    }

    pub fn filename(&self) -> &str {
        match self {
            Operation::CommitSave { filename, .. } | Operation::LoadSave { filename } => filename,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Save,
    Load,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Save => "Save",
            OperationKind::Load => "Load",
        }
    }

    fn dialog_context(&self) -> DialogContext {
        match self {
            OperationKind::Save => DialogContext::Save,
            OperationKind::Load => DialogContext::Load,
        }
    }
}

/// Terminal result of one operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationReport {
    pub kind: OperationKind,
    pub filename: String,
    pub outcome: OperationOutcome,
    /// Loaded bytes; empty for saves and for loads without data
    pub payload: Vec<u8>,
}

/// Observable controller state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Mounting,
    Configuring,
    Transferring,
    Unmounting,
    RecoveringCorruption,
    RecoveringNoSpace,
    /// Waiting for a generic error dialog to close
    AwaitingDialog,
    Done(OperationOutcome),
}

/// Returned by [`SaveDataController::begin`] when an operation is already
/// active; hands the rejected operation back.
#[derive(Debug, thiserror::Error)]
#[error("save-data controller is busy; rejected {} '{}'", .0.kind().as_str(), .0.filename())]
pub struct ControllerBusy(pub Operation);

/// Controller knobs taken from [`Settings`]
#[derive(Debug, Clone)]
struct ControllerConfig {
    user_id: i32,
    dir_name: String,
    blocks: u64,
    chunk_size: usize,
    backup_on_unmount: bool,
    stall_warning_ticks: u32,
}

/// What to do once a dialog closes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AfterDialog {
    /// Finish with the recorded outcome
    Finish,
    /// Delete the corrupted container
    Delete,
    /// Restore the container from its backup
    Restore,
    /// Metadata failure surfaced; carry on with the transfer
    Transfer,
    /// Transfer failure surfaced; release the container
    Unmount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Call {
    Mount,
    Configure,
    Transfer,
    Unmount,
    Delete,
    CheckBackup,
    RestoreBackup,
    Dialog(DialogKind, AfterDialog),
}

impl Call {
    fn kind(&self) -> CallKind {
        match self {
            Call::Mount => CallKind::Mount,
            Call::Configure => CallKind::Configure,
            Call::Transfer => CallKind::Transfer,
            Call::Unmount => CallKind::Unmount,
            Call::Delete => CallKind::Delete,
            Call::CheckBackup => CallKind::CheckBackup,
            Call::RestoreBackup => CallKind::RestoreBackup,
            Call::Dialog(..) => CallKind::OpenDialog,
        }
    }

    fn state(&self) -> ControllerState {
        match self {
            Call::Mount => ControllerState::Mounting,
            Call::Configure => ControllerState::Configuring,
            Call::Transfer => ControllerState::Transferring,
            Call::Unmount => ControllerState::Unmounting,
            Call::Delete | Call::CheckBackup | Call::RestoreBackup => {
                ControllerState::RecoveringCorruption
            }
            Call::Dialog(kind, _) => match kind {
                DialogKind::NoFreeSpace { .. } | DialogKind::NoFreeSpaceRestore => {
                    ControllerState::RecoveringNoSpace
                }
                DialogKind::DataCorruptedDeleted | DialogKind::DataCorruptedRestore => {
                    ControllerState::RecoveringCorruption
                }
                DialogKind::GenericError { .. } => ControllerState::AwaitingDialog,
            },
        }
    }
}

enum Next {
    Call(Call),
    Finish,
}

/// The one outstanding device call
#[derive(Debug, Clone, Copy)]
struct PendingCall {
    ticket: Ticket,
    call: Call,
}

struct ActiveOperation {
    operation: Operation,
    generation: u64,
    recovery_attempts: u8,
    handle: Option<MountHandle>,
    outcome: OperationOutcome,
    data: Vec<u8>,
}

impl ActiveOperation {
    fn kind(&self) -> OperationKind {
        self.operation.kind()
    }
}

/// Drives save/load operations against one [`SaveDevice`]
pub struct SaveDataController<D: SaveDevice> {
    device: D,
    queue: DispatchQueue,
    config: ControllerConfig,
    params: ContainerParams,
    state: ControllerState,
    active: Option<ActiveOperation>,
    pending: Option<PendingCall>,
    finished: Option<OperationReport>,
    next_generation: u64,
    next_sequence: u64,
    progress: TransferProgress,
    waiting_ticks: u32,
    stall_warned: bool,
}

impl<D: SaveDevice> SaveDataController<D> {
    /// `queue` must be the queue whose sender the device posts completions to
    pub fn new(device: D, queue: DispatchQueue, settings: &Settings) -> Self {
        let container = &settings.container;
        Self {
            device,
            queue,
            config: ControllerConfig {
                user_id: settings.user_id,
                dir_name: container.dir_name.clone(),
                blocks: container.blocks,
                chunk_size: settings.chunk_size,
                backup_on_unmount: settings.backup_on_unmount,
                stall_warning_ticks: settings.stall_warning_ticks,
            },
            params: ContainerParams {
                title: container.title.clone(),
                subtitle: container.subtitle.clone(),
                detail: container.detail.clone(),
                icon: None,
            },
            state: ControllerState::Idle,
            active: None,
            pending: None,
            finished: None,
            next_generation: 1,
            next_sequence: 1,
            progress: TransferProgress::new(),
            waiting_ticks: 0,
            stall_warned: false,
        }
    }

    /// Icon stored with the container metadata (PNG bytes)
    pub fn with_icon(mut self, icon: Vec<u8>) -> Self {
        self.params.icon = Some(icon.into());
        self
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// True when no operation is running and no report is waiting
    pub fn is_idle(&self) -> bool {
        self.active.is_none() && self.finished.is_none()
    }

    /// Progress of the current (or last) transfer
    pub fn progress(&self) -> f32 {
        self.progress.get()
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// Start an operation. Its first device call is issued immediately.
    pub fn begin(&mut self, operation: Operation) -> Result<(), ControllerBusy> {
        if !self.is_idle() {
            return Err(ControllerBusy(operation));
        }

        log::info!(
            "[SaveData] {} '{}' starting on {}",
            operation.kind().as_str(),
            operation.filename(),
            self.device.name()
        );

        self.progress.reset();
        self.active = Some(ActiveOperation {
            operation,
            generation: self.take_generation(),
            recovery_attempts: 0,
            handle: None,
            outcome: OperationOutcome::Success,
            data: Vec::new(),
        });
        self.drive(Next::Call(Call::Mount));
        Ok(())
    }

    /// Advance by one tick.
    ///
    /// Returns the report of an operation that finished, if any. Consumes at
    /// most one queued completion.
    pub fn update(&mut self) -> Option<OperationReport> {
        if let Some(report) = self.finished.take() {
            return Some(report);
        }

        match self.queue.pop() {
            Some(event) => self.dispatch(event),
            None => self.note_waiting(),
        }

        self.finished.take()
    }

    fn take_generation(&mut self) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        generation
    }

    fn dispatch(&mut self, event: DeviceEvent) {
        let pending = match self.pending {
            Some(pending) if pending.ticket == event.ticket => pending,
            _ => {
                log::warn!(
                    "[SaveData] Discarding stale completion {} (pending: {})",
                    event.ticket,
                    self.pending
                        .map(|p| p.ticket.to_string())
                        .unwrap_or_else(|| "none".to_string())
                );
                return;
            }
        };

        self.pending = None;
        match &event.result {
            Ok(_) => log::debug!("[SaveData] {} completed", event.ticket),
            Err(failure) => log::debug!("[SaveData] {} failed: {}", event.ticket, failure),
        }

        let next = self.on_complete(pending.call, event.result);
        self.drive(next);
    }

    fn note_waiting(&mut self) {
        let Some(pending) = self.pending else {
            return;
        };
        self.waiting_ticks = self.waiting_ticks.saturating_add(1);
        if !self.stall_warned && self.waiting_ticks >= self.config.stall_warning_ticks {
            self.stall_warned = true;
            log::warn!(
                "[SaveData] {} still unanswered after {} ticks",
                pending.ticket,
                self.waiting_ticks
            );
        }
    }

    /// Issue calls until one is pending or the operation finishes
    fn drive(&mut self, mut next: Next) {
        loop {
            match next {
                Next::Finish => return self.finish(),
                Next::Call(call) => match self.issue(call) {
                    Ok(()) => return,
                    Err(failure) => {
                        log::error!(
                            "[SaveData] {} could not be issued: {}",
                            call.kind().as_str(),
                            failure
                        );
                        next = self.on_complete(call, Err(failure));
                    }
                },
            }
        }
    }

    fn issue(&mut self, call: Call) -> Result<(), DeviceFailure> {
        assert!(
            self.pending.is_none(),
            "single-flight violated: {} issued while {:?} is pending",
            call.kind().as_str(),
            self.pending.map(|p| p.ticket)
        );

        self.state = call.state();
        let Self {
            device,
            config,
            params,
            progress,
            active,
            next_sequence,
            ..
        } = self;
        let Some(op) = active.as_mut() else {
            log::error!("[SaveData] {} requested with no active operation", call.kind().as_str());
            return Err(DeviceFailure::internal());
        };

        let ticket = Ticket {
            generation: op.generation,
            sequence: *next_sequence,
            kind: call.kind(),
        };
        *next_sequence += 1;

        let result = match call {
            Call::Mount => {
                let mode = match op.kind() {
                    OperationKind::Save => MountMode::ReadWrite {
                        blocks: config.blocks,
                    },
                    OperationKind::Load => MountMode::ReadOnly,
                };
                let request = MountRequest {
                    user_id: config.user_id,
                    dir_name: config.dir_name.clone(),
                    mode,
                };
                device.mount(ticket, &request)
            }
            Call::Configure => match op.handle.as_ref() {
                Some(handle) => device.configure(ticket, handle, params),
                None => Err(missing_handle(call)),
            },
            Call::Transfer => match op.handle.as_ref() {
                Some(handle) => {
                    progress.reset();
                    let transfer = match &op.operation {
                        Operation::CommitSave { filename, payload } => Transfer::Write {
                            filename: filename.clone(),
                            payload: Arc::clone(payload),
                            chunk_size: config.chunk_size,
                            progress: progress.clone(),
                        },
                        Operation::LoadSave { filename } => Transfer::Read {
                            filename: filename.clone(),
                            chunk_size: config.chunk_size,
                            progress: progress.clone(),
                        },
                    };
                    device.transfer(ticket, handle, transfer)
                }
                None => Err(missing_handle(call)),
            },
            Call::Unmount => match op.handle.take() {
                Some(handle) => device.unmount(ticket, handle, config.backup_on_unmount),
                None => Err(missing_handle(call)),
            },
            Call::Delete => device.delete(ticket, config.user_id, &config.dir_name),
            Call::CheckBackup => device.check_backup(ticket, config.user_id, &config.dir_name),
            Call::RestoreBackup => device.restore_backup(ticket, config.user_id, &config.dir_name),
            Call::Dialog(kind, _) => {
                let request = DialogRequest {
                    user_id: config.user_id,
                    dir_name: config.dir_name.clone(),
                    context: op.kind().dialog_context(),
                    kind,
                };
                device.open_dialog(ticket, &request)
            }
        };

        if result.is_ok() {
            log::debug!("[SaveData] Requested {}", ticket);
            self.pending = Some(PendingCall { ticket, call });
            self.waiting_ticks = 0;
            self.stall_warned = false;
        }
        result
    }

    /// Decide the next step from a completed call
    fn on_complete(&mut self, call: Call, result: CallResult) -> Next {
        let Some(op) = self.active.as_mut() else {
            log::error!("[SaveData] Completion with no active operation");
            return Next::Finish;
        };
        let kind = op.kind();

        match call {
            Call::Mount => match result {
                Ok(CallOutput::Mounted(handle)) => {
                    log::debug!("[SaveData] Mounted {}", handle.mount_point());
                    op.handle = Some(handle);
                    if kind == OperationKind::Save && self.device.supports_metadata() {
                        Next::Call(Call::Configure)
                    } else {
                        Next::Call(Call::Transfer)
                    }
                }
                Ok(other) => fail(op, unexpected(call, &other), AfterDialog::Finish),
                Err(failure) => on_mount_failure(op, failure),
            },

            // Metadata is cosmetic: never fatal to the data write
            Call::Configure => match result {
                Ok(_) => Next::Call(Call::Transfer),
                Err(failure) if failure.outcome == OperationOutcome::GenericError => {
                    log::error!("[SaveData] Setting container metadata failed: {}", failure);
                    Next::Call(Call::Dialog(
                        DialogKind::GenericError { code: failure.code },
                        AfterDialog::Transfer,
                    ))
                }
                Err(failure) => {
                    log::warn!("[SaveData] Container metadata not set: {}", failure);
                    Next::Call(Call::Transfer)
                }
            },

            Call::Transfer => match (kind, result) {
                (OperationKind::Save, Ok(CallOutput::Unit)) => {
                    log::info!(
                        "[SaveData] Wrote '{}' ({:.0}%)",
                        op.operation.filename(),
                        self.progress.get() * 100.0
                    );
                    Next::Call(Call::Unmount)
                }
                (OperationKind::Load, Ok(CallOutput::Data(data))) => {
                    log::info!(
                        "[SaveData] Read '{}' ({} bytes)",
                        op.operation.filename(),
                        data.len()
                    );
                    op.data = data;
                    Next::Call(Call::Unmount)
                }
                // Missing blob inside an existing container: no save yet
                (OperationKind::Load, Err(failure))
                    if failure.outcome == OperationOutcome::NotFound =>
                {
                    op.outcome = OperationOutcome::NotFound;
                    Next::Call(Call::Unmount)
                }
                (_, Ok(other)) => fail(op, unexpected(call, &other), AfterDialog::Unmount),
                (_, Err(failure)) => fail(op, failure, AfterDialog::Unmount),
            },

            Call::Unmount => match result {
                Ok(_) => Next::Finish,
                Err(failure) => {
                    // Not durable until the backup-unmount completes
                    op.data.clear();
                    fail(op, failure, AfterDialog::Finish)
                }
            },

            Call::Delete => match (kind, result) {
                (OperationKind::Save, Ok(_)) => {
                    op.recovery_attempts += 1;
                    op.generation = self.next_generation;
                    self.next_generation += 1;
                    log::info!(
                        "[SaveData] Corrupted container deleted, retrying save (attempt {})",
                        op.recovery_attempts
                    );
                    Next::Call(Call::Mount)
                }
                (OperationKind::Load, Ok(_)) => {
                    op.outcome = OperationOutcome::NotFound;
                    op.data.clear();
                    Next::Finish
                }
                (_, Err(failure)) => fail(op, failure, AfterDialog::Finish),
            },

            Call::CheckBackup => match result {
                Ok(_) => Next::Call(Call::Dialog(
                    DialogKind::DataCorruptedRestore,
                    AfterDialog::Restore,
                )),
                Err(failure) if failure.outcome == OperationOutcome::NotFound => {
                    log::warn!("[SaveData] No backup available, deleting corrupted data");
                    Next::Call(Call::Dialog(
                        DialogKind::DataCorruptedDeleted,
                        AfterDialog::Delete,
                    ))
                }
                Err(failure) => fail(op, failure, AfterDialog::Finish),
            },

            Call::RestoreBackup => match result {
                Ok(_) => {
                    op.recovery_attempts += 1;
                    op.generation = self.next_generation;
                    self.next_generation += 1;
                    log::info!(
                        "[SaveData] Backup restored, retrying load (attempt {})",
                        op.recovery_attempts
                    );
                    Next::Call(Call::Mount)
                }
                Err(failure) if failure.outcome == OperationOutcome::NoFreeSpace => {
                    log::error!("[SaveData] Not enough space to restore backup");
                    op.outcome = OperationOutcome::GenericError;
                    Next::Call(Call::Dialog(
                        DialogKind::NoFreeSpaceRestore,
                        AfterDialog::Finish,
                    ))
                }
                Err(failure) => fail(op, failure, AfterDialog::Finish),
            },

            Call::Dialog(dialog, after) => {
                match result {
                    Ok(CallOutput::DialogClosed(code)) => {
                        log::debug!("[SaveData] Dialog {:?} closed ({})", dialog, code)
                    }
                    Ok(_) => log::debug!("[SaveData] Dialog {:?} closed", dialog),
                    Err(failure) => {
                        log::error!("[SaveData] Dialog {:?} failed: {}", dialog, failure)
                    }
                }
                match after {
                    AfterDialog::Finish => Next::Finish,
                    AfterDialog::Delete => Next::Call(Call::Delete),
                    AfterDialog::Restore => Next::Call(Call::RestoreBackup),
                    AfterDialog::Transfer => Next::Call(Call::Transfer),
                    AfterDialog::Unmount => Next::Call(Call::Unmount),
                }
            }
        }
    }

    fn finish(&mut self) {
        let Some(op) = self.active.take() else {
            return;
        };

        if let Some(handle) = &op.handle {
            debug_assert!(false, "operation finished with {:?} still mounted", handle);
            log::error!(
                "[SaveData] Operation finished with {} still mounted",
                handle.mount_point()
            );
        }

        log::info!(
            "[SaveData] {} '{}' finished: {}",
            op.kind().as_str(),
            op.operation.filename(),
            op.outcome
        );

        self.state = ControllerState::Done(op.outcome);
        self.finished = Some(OperationReport {
            kind: op.kind(),
            filename: op.operation.filename().to_string(),
            outcome: op.outcome,
            payload: if op.kind() == OperationKind::Load && op.outcome.is_success() {
                op.data
            } else {
                Vec::new()
            },
        });
    }
}

fn on_mount_failure(op: &mut ActiveOperation, failure: DeviceFailure) -> Next {
    let kind = op.kind();
    let can_recover = op.recovery_attempts < MAX_RECOVERY_ATTEMPTS;

    match (kind, failure.outcome) {
        (OperationKind::Save, OperationOutcome::NoFreeSpace) => {
            log::error!(
                "[SaveData] Not enough space to save ({} blocks required)",
                failure.required_blocks
            );
            op.outcome = OperationOutcome::NoFreeSpace;
            Next::Call(Call::Dialog(
                DialogKind::NoFreeSpace {
                    required_blocks: failure.required_blocks,
                },
                AfterDialog::Finish,
            ))
        }
        (OperationKind::Save, OperationOutcome::Corrupted) if can_recover => {
            log::warn!("[SaveData] Save container corrupted, deleting it");
            Next::Call(Call::Dialog(
                DialogKind::DataCorruptedDeleted,
                AfterDialog::Delete,
            ))
        }
        (OperationKind::Load, OperationOutcome::Corrupted) if can_recover => {
            log::warn!("[SaveData] Save container corrupted, checking for backup");
            Next::Call(Call::CheckBackup)
        }
        (OperationKind::Load, OperationOutcome::NotFound) => {
            log::info!("[SaveData] No save data yet");
            op.outcome = OperationOutcome::Success;
            Next::Finish
        }
        (_, OperationOutcome::Busy | OperationOutcome::UserCanceled) => {
            log::warn!("[SaveData] Mount not completed: {}", failure);
            op.outcome = failure.outcome;
            Next::Finish
        }
        _ => fail(op, failure, AfterDialog::Finish),
    }
}

/// Record `GenericError` and surface `failure` through the error dialog
fn fail(op: &mut ActiveOperation, failure: DeviceFailure, after: AfterDialog) -> Next {
    log::error!(
        "[SaveData] {} '{}' failed: {}",
        op.kind().as_str(),
        op.operation.filename(),
        failure
    );
    op.outcome = OperationOutcome::GenericError;
    Next::Call(Call::Dialog(
        DialogKind::GenericError { code: failure.code },
        after,
    ))
}

fn unexpected(call: Call, output: &CallOutput) -> DeviceFailure {
    log::error!(
        "[SaveData] {} completed with unexpected output {:?}",
        call.kind().as_str(),
        output
    );
    DeviceFailure::internal()
}

fn missing_handle(call: Call) -> DeviceFailure {
    log::error!("[SaveData] {} requested without a mounted container", call.kind().as_str());
    DeviceFailure::internal()
}
