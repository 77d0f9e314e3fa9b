//! Event dispatch queue
//!
//! Device drivers complete their calls on whatever execution context they own
//! (driver threads, browser callbacks, the simulation step). They never touch
//! controller state: they append a [`DeviceEvent`] through an [`EventSender`],
//! and the controller pops at most one event per tick on the main context.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use super::outcome::CallResult;

/// Device call kinds, one per capability of [`crate::platform::SaveDevice`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    Mount,
    Configure,
    Transfer,
    Unmount,
    Delete,
    CheckBackup,
    RestoreBackup,
    OpenDialog,
}

impl CallKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallKind::Mount => "Mount",
            CallKind::Configure => "Configure",
            CallKind::Transfer => "Transfer",
            CallKind::Unmount => "Unmount",
            CallKind::Delete => "Delete",
            CallKind::CheckBackup => "CheckBackup",
            CallKind::RestoreBackup => "RestoreBackup",
            CallKind::OpenDialog => "OpenDialog",
        }
    }
}

/// Correlates one device call with its completion event.
///
/// `generation` identifies the operation attempt (it changes on every
/// operation start and every recovery retry), `sequence` the individual call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ticket {
    pub generation: u64,
    pub sequence: u64,
    pub kind: CallKind,
}

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{}.{}",
            self.kind.as_str(),
            self.generation,
            self.sequence
        )
    }
}

/// Completion notification posted by a device
#[derive(Debug)]
pub struct DeviceEvent {
    pub ticket: Ticket,
    pub result: CallResult,
}

impl DeviceEvent {
    pub fn new(ticket: Ticket, result: CallResult) -> Self {
        Self { ticket, result }
    }
}

type Shared = Arc<Mutex<VecDeque<DeviceEvent>>>;

/// Single-consumer FIFO of device completions
#[derive(Debug, Default)]
pub struct DispatchQueue {
    events: Shared,
}

impl DispatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append-only handle for producers
    pub fn sender(&self) -> EventSender {
        EventSender {
            events: Arc::clone(&self.events),
        }
    }

    /// Remove the oldest event
    pub fn pop(&self) -> Option<DeviceEvent> {
        self.events.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

/// Producer side of the dispatch queue.
///
/// Cloneable and `Send`, so drivers can complete calls from their own threads.
#[derive(Debug, Clone)]
pub struct EventSender {
    events: Shared,
}

impl EventSender {
    pub fn send(&self, event: DeviceEvent) {
        log::trace!("Queued completion for {}", event.ticket);
        self.events.lock().push_back(event);
    }

    /// Shorthand for `send(DeviceEvent::new(ticket, result))`
    pub fn complete(&self, ticket: Ticket, result: CallResult) {
        self.send(DeviceEvent::new(ticket, result));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::outcome::{CallOutput, DeviceFailure};

    fn ticket(sequence: u64) -> Ticket {
        Ticket {
            generation: 1,
            sequence,
            kind: CallKind::Delete,
        }
    }

    #[test]
    fn test_fifo_order() {
        let queue = DispatchQueue::new();
        let sender = queue.sender();

        sender.complete(ticket(1), Ok(CallOutput::Unit));
        sender.complete(ticket(2), Err(DeviceFailure::internal()));
        sender.complete(ticket(3), Ok(CallOutput::DialogClosed(0)));

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop().unwrap().ticket.sequence, 1);
        assert_eq!(queue.pop().unwrap().ticket.sequence, 2);
        assert_eq!(queue.pop().unwrap().ticket.sequence, 3);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_producers_on_other_threads() {
        let queue = DispatchQueue::new();
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let sender = queue.sender();
                std::thread::spawn(move || sender.complete(ticket(i), Ok(CallOutput::Unit)))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let mut seen: Vec<u64> = std::iter::from_fn(|| queue.pop())
            .map(|e| e.ticket.sequence)
            .collect();
        seen.sort();
        assert_eq!(seen, vec![0, 1, 2, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_ticket_display() {
        assert_eq!(ticket(7).to_string(), "Delete#1.7");
    }
}
