//! Save/load persistence against platform save containers
//!
//! Features:
//! - Ordered mount → configure → transfer → unmount protocol
//! - Bounded recovery from corruption and low space
//! - Single-flight device calls correlated by ticket
//! - FIFO scheduling of concurrent save/load requests
//! - Chunked transfers with progress

pub mod chunked;
pub mod controller;
pub mod dispatch;
pub mod outcome;
pub mod scheduler;

pub use chunked::{TransferProgress, read_chunked, write_chunked};
pub use controller::{
    ControllerBusy, ControllerState, Operation, OperationKind, OperationReport,
    SaveDataController,
};
pub use dispatch::{CallKind, DeviceEvent, DispatchQueue, EventSender, Ticket};
pub use outcome::{CODE_INTERNAL, CallOutput, CallResult, DeviceFailure, OperationOutcome};
pub use scheduler::{
    LoadCallback, RequestId, SaveCallback, SaveScheduler, ScheduleStatus, Scheduled,
};
