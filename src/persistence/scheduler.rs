//! Save request scheduler
//!
//! Serializes save and load requests against the single controller. Requests
//! run strictly in arrival order: nothing is dropped, merged or reordered,
//! even when filenames repeat.

use std::collections::VecDeque;
use std::fmt;

use super::controller::{Operation, OperationReport, SaveDataController};
use super::outcome::OperationOutcome;
use crate::platform::device::SaveDevice;
use crate::settings::Settings;

/// Enqueue order of a request within one scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleStatus {
    /// The controller picked the request up immediately
    Started,
    /// Queued behind other work; the callback fires once it has run
    Deferred,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scheduled {
    pub id: RequestId,
    pub status: ScheduleStatus,
}

pub type SaveCallback = Box<dyn FnOnce(OperationOutcome)>;
pub type LoadCallback = Box<dyn FnOnce(OperationOutcome, Vec<u8>)>;

enum Completion {
    Save(SaveCallback),
    Load(LoadCallback),
}

impl Completion {
    fn invoke(self, outcome: OperationOutcome, payload: Vec<u8>) {
        match self {
            Completion::Save(callback) => callback(outcome),
            Completion::Load(callback) => callback(outcome, payload),
        }
    }
}

struct Request {
    id: RequestId,
    operation: Operation,
    completion: Completion,
    busy_requeues: u32,
}

/// FIFO of save/load requests in front of one [`SaveDataController`]
pub struct SaveScheduler<D: SaveDevice> {
    controller: SaveDataController<D>,
    queue: VecDeque<Request>,
    in_flight: Option<Request>,
    next_id: u64,
    busy_requeue_limit: u32,
}

impl<D: SaveDevice> SaveScheduler<D> {
    pub fn new(controller: SaveDataController<D>, settings: &Settings) -> Self {
        Self {
            controller,
            queue: VecDeque::new(),
            in_flight: None,
            next_id: 1,
            busy_requeue_limit: settings.busy_requeue_limit,
        }
    }

    pub fn request_save(
        &mut self,
        payload: Vec<u8>,
        filename: &str,
        callback: impl FnOnce(OperationOutcome) + 'static,
    ) -> Scheduled {
        self.submit(
            Operation::save(filename, payload),
            Completion::Save(Box::new(callback)),
        )
    }

    pub fn request_load(
        &mut self,
        filename: &str,
        callback: impl FnOnce(OperationOutcome, Vec<u8>) + 'static,
    ) -> Scheduled {
        self.submit(
            Operation::load(filename),
            Completion::Load(Box::new(callback)),
        )
    }

    /// Advance one tick; invoke the finished request's callback and promote
    /// the next queued request.
    pub fn update(&mut self) {
        if let Some(report) = self.controller.update() {
            self.complete(report);
            self.promote();
        }
    }

    /// Withdraw a request that has not started yet.
    ///
    /// Its callback runs with `UserCanceled`. Returns false if the request is
    /// unknown, already running or already finished.
    pub fn cancel(&mut self, id: RequestId) -> bool {
        let Some(position) = self.queue.iter().position(|r| r.id == id) else {
            return false;
        };
        let Some(request) = self.queue.remove(position) else {
            return false;
        };

        log::info!(
            "[Scheduler] Canceled {} {} '{}'",
            request.id,
            request.operation.kind().as_str(),
            request.operation.filename()
        );
        request
            .completion
            .invoke(OperationOutcome::UserCanceled, Vec::new());
        true
    }

    /// Number of requests waiting behind the in-flight one
    pub fn pending_len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some() || !self.queue.is_empty()
    }

    pub fn in_flight(&self) -> Option<RequestId> {
        self.in_flight.as_ref().map(|r| r.id)
    }

    pub fn controller(&self) -> &SaveDataController<D> {
        &self.controller
    }

    pub fn controller_mut(&mut self) -> &mut SaveDataController<D> {
        &mut self.controller
    }

    fn submit(&mut self, operation: Operation, completion: Completion) -> Scheduled {
        let id = RequestId(self.next_id);
        self.next_id += 1;

        let request = Request {
            id,
            operation,
            completion,
            busy_requeues: 0,
        };

        if self.in_flight.is_none() && self.queue.is_empty() {
            self.start(request);
        } else {
            log::debug!(
                "[Scheduler] Deferred {} {} '{}' ({} ahead)",
                id,
                request.operation.kind().as_str(),
                request.operation.filename(),
                self.queue.len() + usize::from(self.in_flight.is_some())
            );
            self.queue.push_back(request);
        }

        let status = if self.in_flight() == Some(id) {
            ScheduleStatus::Started
        } else {
            ScheduleStatus::Deferred
        };
        Scheduled { id, status }
    }

    fn start(&mut self, request: Request) {
        match self.controller.begin(request.operation.clone()) {
            Ok(()) => {
                log::debug!("[Scheduler] Started {}", request.id);
                self.in_flight = Some(request);
            }
            Err(busy) => {
                log::error!("[Scheduler] {}", busy);
                self.queue.push_front(request);
            }
        }
    }

    fn complete(&mut self, report: OperationReport) {
        let Some(mut request) = self.in_flight.take() else {
            log::warn!(
                "[Scheduler] Report for '{}' with no request in flight",
                report.filename
            );
            return;
        };

        if report.outcome == OperationOutcome::Busy
            && request.busy_requeues < self.busy_requeue_limit
        {
            request.busy_requeues += 1;
            log::warn!(
                "[Scheduler] Device busy, requeued {} (attempt {} of {})",
                request.id,
                request.busy_requeues,
                self.busy_requeue_limit
            );
            self.queue.push_front(request);
            return;
        }

        log::debug!("[Scheduler] Finished {}: {}", request.id, report.outcome);
        request.completion.invoke(report.outcome, report.payload);
    }

    fn promote(&mut self) {
        if self.in_flight.is_some() {
            return;
        }
        if let Some(next) = self.queue.pop_front() {
            self.start(next);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::dispatch::{CallKind, DispatchQueue};
    use crate::persistence::outcome::DeviceFailure;
    use crate::sim::SimDevice;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn scheduler_with(sim_latency: Option<(u64, u32)>) -> (SaveScheduler<SimDevice>, SimDevice) {
        let queue = DispatchQueue::new();
        let sim = match sim_latency {
            Some((seed, max_ticks)) => SimDevice::with_latency(queue.sender(), seed, max_ticks),
            None => SimDevice::new(queue.sender()),
        };
        let settings = Settings::default();
        let controller = SaveDataController::new(sim.clone(), queue, &settings);
        (SaveScheduler::new(controller, &settings), sim)
    }

    fn drain(scheduler: &mut SaveScheduler<SimDevice>, sim: &SimDevice) {
        for _ in 0..5000 {
            if !scheduler.is_busy() {
                return;
            }
            sim.step();
            scheduler.update();
        }
        panic!("scheduler did not drain");
    }

    type Log = Rc<RefCell<Vec<(String, OperationOutcome)>>>;

    fn recorder(log: &Log, name: &str) -> impl FnOnce(OperationOutcome) + 'static {
        let log = Rc::clone(log);
        let name = name.to_string();
        move |outcome| log.borrow_mut().push((name, outcome))
    }

    #[test]
    fn test_fifo_fairness() {
        let (mut scheduler, sim) = scheduler_with(Some((3, 4)));
        let log: Log = Rc::default();

        let first = scheduler.request_save(vec![0], "inflight", recorder(&log, "inflight"));
        assert_eq!(first.status, ScheduleStatus::Started);
        for name in ["a", "b", "c"] {
            let scheduled = scheduler.request_save(vec![1], name, recorder(&log, name));
            assert_eq!(scheduled.status, ScheduleStatus::Deferred);
        }
        assert_eq!(scheduler.pending_len(), 3);

        drain(&mut scheduler, &sim);

        assert_eq!(sim.writes(), vec!["inflight", "a", "b", "c"]);
        let order: Vec<String> = log.borrow().iter().map(|(n, _)| n.clone()).collect();
        assert_eq!(order, vec!["inflight", "a", "b", "c"]);
        assert!(log
            .borrow()
            .iter()
            .all(|(_, o)| *o == OperationOutcome::Success));
    }

    #[test]
    fn test_repeated_filenames_are_not_merged() {
        let (mut scheduler, sim) = scheduler_with(None);
        let log: Log = Rc::default();

        for i in 0..3u8 {
            scheduler.request_save(vec![i], "slot", recorder(&log, "slot"));
        }
        drain(&mut scheduler, &sim);

        assert_eq!(sim.writes(), vec!["slot", "slot", "slot"]);
        assert_eq!(log.borrow().len(), 3);
        assert_eq!(sim.file("saves", "slot"), Some(vec![2]));
    }

    #[test]
    fn test_one_mount_at_a_time() {
        let (mut scheduler, sim) = scheduler_with(Some((11, 6)));
        let log: Log = Rc::default();

        for name in ["a", "b", "c", "d", "e"] {
            scheduler.request_save(vec![7; 3000], name, recorder(&log, name));
        }
        drain(&mut scheduler, &sim);

        assert_eq!(sim.peak_mounted(), 1);
        assert_eq!(log.borrow().len(), 5);
    }

    #[test]
    fn test_loads_share_the_queue() {
        let (mut scheduler, sim) = scheduler_with(None);
        let loaded = Rc::new(RefCell::new(None));

        scheduler.request_save(b"state".to_vec(), "profile1", |_| {});
        let sink = Rc::clone(&loaded);
        let scheduled = scheduler.request_load("profile1", move |outcome, data| {
            *sink.borrow_mut() = Some((outcome, data));
        });
        assert_eq!(scheduled.status, ScheduleStatus::Deferred);

        drain(&mut scheduler, &sim);

        assert_eq!(
            *loaded.borrow(),
            Some((OperationOutcome::Success, b"state".to_vec()))
        );
    }

    #[test]
    fn test_cancel_queued_request() {
        let (mut scheduler, sim) = scheduler_with(None);
        let log: Log = Rc::default();

        let running = scheduler.request_save(vec![1], "a", recorder(&log, "a"));
        let queued = scheduler.request_save(vec![2], "b", recorder(&log, "b"));

        assert!(!scheduler.cancel(running.id));
        assert!(scheduler.cancel(queued.id));
        assert!(!scheduler.cancel(queued.id));
        assert_eq!(
            log.borrow().as_slice(),
            &[("b".to_string(), OperationOutcome::UserCanceled)]
        );

        drain(&mut scheduler, &sim);
        assert_eq!(sim.writes(), vec!["a"]);
    }

    #[test]
    fn test_busy_is_requeued_then_succeeds() {
        let (mut scheduler, sim) = scheduler_with(None);
        let log: Log = Rc::default();
        sim.inject(CallKind::Mount, DeviceFailure::busy());
        sim.inject(CallKind::Mount, DeviceFailure::busy());

        scheduler.request_save(vec![1], "a", recorder(&log, "a"));
        drain(&mut scheduler, &sim);

        assert_eq!(
            log.borrow().as_slice(),
            &[("a".to_string(), OperationOutcome::Success)]
        );
        assert_eq!(sim.writes(), vec!["a"]);
    }

    #[test]
    fn test_busy_surfaces_after_limit() {
        let (mut scheduler, sim) = scheduler_with(None);
        let log: Log = Rc::default();
        let limit = Settings::default().busy_requeue_limit;
        for _ in 0..=limit {
            sim.inject(CallKind::Mount, DeviceFailure::busy());
        }

        scheduler.request_save(vec![1], "a", recorder(&log, "a"));
        scheduler.request_save(vec![2], "b", recorder(&log, "b"));
        drain(&mut scheduler, &sim);

        assert_eq!(
            log.borrow().as_slice(),
            &[
                ("a".to_string(), OperationOutcome::Busy),
                ("b".to_string(), OperationOutcome::Success),
            ]
        );
    }

    #[test]
    fn test_failure_does_not_stall_queue() {
        let (mut scheduler, sim) = scheduler_with(None);
        let log: Log = Rc::default();
        sim.inject(CallKind::Transfer, DeviceFailure::internal());

        scheduler.request_save(vec![1], "a", recorder(&log, "a"));
        scheduler.request_save(vec![2], "b", recorder(&log, "b"));
        drain(&mut scheduler, &sim);

        assert_eq!(
            log.borrow().as_slice(),
            &[
                ("a".to_string(), OperationOutcome::GenericError),
                ("b".to_string(), OperationOutcome::Success),
            ]
        );
    }
}
