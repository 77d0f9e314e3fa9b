//! In-memory save device
//!
//! Behaves like a console save-data service: one user, containers holding
//! named blobs, a backup slot per container, and completions that arrive a
//! seeded number of ticks after each call.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use rand::{Rng, SeedableRng};
use rand_pcg::Pcg32;

use super::faults::FaultPlan;
use crate::persistence::{
    CallKind, CallOutput, CallResult, DeviceEvent, DeviceFailure, EventSender, Ticket,
    read_chunked, write_chunked,
};
use crate::platform::device::{
    ContainerParams, DialogKind, DialogRequest, MountHandle, MountMode, MountRequest, SaveDevice,
    Transfer,
};

#[derive(Debug, Clone, Default)]
struct Container {
    files: BTreeMap<String, Vec<u8>>,
    params: Option<ContainerParams>,
    corrupted: bool,
}

#[derive(Debug)]
struct Mounted {
    id: u64,
    dir_name: String,
    writable: bool,
}

struct Latency {
    rng: Pcg32,
    max_ticks: u32,
}

struct SimState {
    events: EventSender,
    latency: Option<Latency>,
    tick: u64,
    delayed: Vec<(u64, DeviceEvent)>,

    containers: HashMap<String, Container>,
    backups: HashMap<String, Container>,
    mounted: Option<Mounted>,
    next_handle: u64,
    metadata: bool,
    capacity_blocks: Option<u64>,
    faults: FaultPlan,

    calls: Vec<CallKind>,
    dialogs: Vec<DialogKind>,
    writes: Vec<String>,
    peak_mounted: usize,
}

impl SimState {
    fn post(&mut self, ticket: Ticket, result: CallResult) {
        match &mut self.latency {
            None => self.events.complete(ticket, result),
            Some(latency) => {
                let delay = latency.rng.random_range(0..=latency.max_ticks);
                self.delayed
                    .push((self.tick + u64::from(delay), DeviceEvent::new(ticket, result)));
            }
        }
    }

    /// Record the call and apply scripted issue faults
    fn begin(&mut self, ticket: Ticket) -> Result<Option<DeviceFailure>, DeviceFailure> {
        self.calls.push(ticket.kind);
        if let Some(failure) = self.faults.take_issue(ticket.kind) {
            return Err(failure);
        }
        Ok(self.faults.take(ticket.kind))
    }

    fn check_handle(&self, handle: &MountHandle) -> Result<&Mounted, DeviceFailure> {
        match &self.mounted {
            Some(mounted) if mounted.id == handle.id() => Ok(mounted),
            _ => {
                log::error!("[Sim] Unknown mount handle {:?}", handle);
                Err(DeviceFailure::internal())
            }
        }
    }

    fn mount(&mut self, request: &MountRequest) -> CallResult {
        if self.mounted.is_some() {
            self.peak_mounted = self.peak_mounted.max(2);
            return Err(DeviceFailure::busy());
        }

        let writable = match request.mode {
            MountMode::ReadOnly => {
                if !self.containers.contains_key(&request.dir_name) {
                    return Err(DeviceFailure::not_found());
                }
                false
            }
            MountMode::ReadWrite { blocks } => {
                if !self.containers.contains_key(&request.dir_name) {
                    if let Some(capacity) = self.capacity_blocks.filter(|c| *c < blocks) {
                        return Err(DeviceFailure::no_free_space(blocks - capacity));
                    }
                    self.containers
                        .insert(request.dir_name.clone(), Container::default());
                }
                true
            }
        };

        if self
            .containers
            .get(&request.dir_name)
            .is_some_and(|c| c.corrupted)
        {
            return Err(DeviceFailure::corrupted());
        }

        let id = self.next_handle;
        self.next_handle += 1;
        self.mounted = Some(Mounted {
            id,
            dir_name: request.dir_name.clone(),
            writable,
        });
        self.peak_mounted = self.peak_mounted.max(1);
        Ok(CallOutput::Mounted(MountHandle::new(
            id,
            format!("/savedata{}", id),
        )))
    }

    fn configure(&mut self, handle: &MountHandle, params: &ContainerParams) -> CallResult {
        let dir_name = self.check_handle(handle)?.dir_name.clone();
        let container = self
            .containers
            .get_mut(&dir_name)
            .ok_or_else(DeviceFailure::internal)?;
        container.params = Some(params.clone());
        Ok(CallOutput::Unit)
    }

    fn transfer(&mut self, handle: &MountHandle, transfer: Transfer) -> CallResult {
        let mounted = self.check_handle(handle)?;
        let dir_name = mounted.dir_name.clone();
        let writable = mounted.writable;
        let container = self
            .containers
            .get_mut(&dir_name)
            .ok_or_else(DeviceFailure::internal)?;

        match transfer {
            Transfer::Write {
                filename,
                payload,
                chunk_size,
                progress,
            } => {
                if !writable {
                    return Err(DeviceFailure::internal());
                }
                let mut blob = Vec::with_capacity(payload.len());
                write_chunked(&mut blob, &payload, chunk_size, |p| progress.report(p))
                    .map_err(|e| DeviceFailure::from_io(&e))?;
                container.files.insert(filename.clone(), blob);
                self.writes.push(filename);
                Ok(CallOutput::Unit)
            }
            Transfer::Read {
                filename,
                chunk_size,
                progress,
            } => {
                let blob = container
                    .files
                    .get(&filename)
                    .ok_or_else(DeviceFailure::not_found)?;
                let data = read_chunked(&blob[..], blob.len(), chunk_size, |p| progress.report(p))
                    .map_err(|e| DeviceFailure::from_io(&e))?;
                Ok(CallOutput::Data(data))
            }
        }
    }

    fn unmount(&mut self, handle: &MountHandle, backup: bool) -> CallResult {
        self.check_handle(handle)?;
        let Some(mounted) = self.mounted.take() else {
            return Err(DeviceFailure::internal());
        };
        if backup {
            if let Some(container) = self.containers.get(&mounted.dir_name) {
                self.backups
                    .insert(mounted.dir_name.clone(), container.clone());
            }
        }
        Ok(CallOutput::Unit)
    }

    fn delete(&mut self, dir_name: &str) -> CallResult {
        if self.mounted.as_ref().is_some_and(|m| m.dir_name == dir_name) {
            return Err(DeviceFailure::busy());
        }
        match self.containers.remove(dir_name) {
            Some(_) => Ok(CallOutput::Unit),
            None => Err(DeviceFailure::not_found()),
        }
    }

    fn restore_backup(&mut self, dir_name: &str) -> CallResult {
        let mut restored = self
            .backups
            .get(dir_name)
            .cloned()
            .ok_or_else(DeviceFailure::not_found)?;
        restored.corrupted = false;
        self.containers.insert(dir_name.to_string(), restored);
        Ok(CallOutput::Unit)
    }
}

/// Deterministic [`SaveDevice`] for tests and demos.
///
/// Cloning yields another handle onto the same device, so a test can keep
/// one to inspect state while the controller owns the other.
#[derive(Clone)]
pub struct SimDevice {
    state: Rc<RefCell<SimState>>,
}

impl SimDevice {
    /// Completions are posted as soon as a call is made
    pub fn new(events: EventSender) -> Self {
        Self {
            state: Rc::new(RefCell::new(SimState {
                events,
                latency: None,
                tick: 0,
                delayed: Vec::new(),
                containers: HashMap::new(),
                backups: HashMap::new(),
                mounted: None,
                next_handle: 1,
                metadata: false,
                capacity_blocks: None,
                faults: FaultPlan::new(),
                calls: Vec::new(),
                dialogs: Vec::new(),
                writes: Vec::new(),
                peak_mounted: 0,
            })),
        }
    }

    /// Completions are held back for `0..=max_ticks` ticks, drawn from a
    /// PCG stream seeded with `seed`, and released by [`SimDevice::step`].
    pub fn with_latency(events: EventSender, seed: u64, max_ticks: u32) -> Self {
        let device = Self::new(events);
        device.state.borrow_mut().latency = Some(Latency {
            rng: Pcg32::seed_from_u64(seed),
            max_ticks,
        });
        device
    }

    pub fn with_metadata(self, enabled: bool) -> Self {
        self.state.borrow_mut().metadata = enabled;
        self
    }

    /// Refuse to create containers larger than `blocks`
    pub fn with_capacity(self, blocks: u64) -> Self {
        self.state.borrow_mut().capacity_blocks = Some(blocks);
        self
    }

    pub fn with_faults(self, plan: FaultPlan) -> Self {
        self.state.borrow_mut().faults = plan;
        self
    }

    /// Advance one tick, releasing completions that are due
    pub fn step(&self) {
        let mut state = self.state.borrow_mut();
        state.tick += 1;
        let tick = state.tick;

        let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut state.delayed)
            .into_iter()
            .partition(|(at, _)| *at <= tick);
        state.delayed = waiting;
        for (_, event) in due {
            state.events.send(event);
        }
    }

    /// Script a completion failure for the next call of `kind`
    pub fn inject(&self, kind: CallKind, failure: DeviceFailure) {
        self.state.borrow_mut().faults.push(kind, failure);
    }

    /// Script an issue-time failure for the next call of `kind`
    pub fn fail_on_issue(&self, kind: CallKind, failure: DeviceFailure) {
        self.state.borrow_mut().faults.push_issue(kind, failure);
    }

    /// Mark a container as corrupted until it is deleted or restored
    pub fn corrupt(&self, dir_name: &str) {
        if let Some(container) = self.state.borrow_mut().containers.get_mut(dir_name) {
            container.corrupted = true;
        }
    }

    /// Place a blob directly, creating the container without a backup
    pub fn insert_file(&self, dir_name: &str, filename: &str, data: Vec<u8>) {
        self.state
            .borrow_mut()
            .containers
            .entry(dir_name.to_string())
            .or_default()
            .files
            .insert(filename.to_string(), data);
    }

    pub fn file(&self, dir_name: &str, filename: &str) -> Option<Vec<u8>> {
        self.state
            .borrow()
            .containers
            .get(dir_name)
            .and_then(|c| c.files.get(filename).cloned())
    }

    pub fn params(&self, dir_name: &str) -> Option<ContainerParams> {
        self.state
            .borrow()
            .containers
            .get(dir_name)
            .and_then(|c| c.params.clone())
    }

    pub fn has_container(&self, dir_name: &str) -> bool {
        self.state.borrow().containers.contains_key(dir_name)
    }

    pub fn has_backup(&self, dir_name: &str) -> bool {
        self.state.borrow().backups.contains_key(dir_name)
    }

    pub fn is_mounted(&self) -> bool {
        self.state.borrow().mounted.is_some()
    }

    /// Most containers ever mounted at once; 2 means a mount overlapped
    pub fn peak_mounted(&self) -> usize {
        self.state.borrow().peak_mounted
    }

    /// Every call made, in order
    pub fn calls(&self) -> Vec<CallKind> {
        self.state.borrow().calls.clone()
    }

    pub fn dialogs(&self) -> Vec<DialogKind> {
        self.state.borrow().dialogs.clone()
    }

    /// Filenames of successful writes, in order
    pub fn writes(&self) -> Vec<String> {
        self.state.borrow().writes.clone()
    }

    /// Completions not yet released by [`SimDevice::step`]
    pub fn in_flight(&self) -> usize {
        self.state.borrow().delayed.len()
    }

    fn run(
        &self,
        ticket: Ticket,
        op: impl FnOnce(&mut SimState) -> CallResult,
    ) -> Result<(), DeviceFailure> {
        let mut state = self.state.borrow_mut();
        let result = match state.begin(ticket)? {
            Some(failure) => Err(failure),
            None => op(&mut *state),
        };
        state.post(ticket, result);
        Ok(())
    }
}

impl SaveDevice for SimDevice {
    fn name(&self) -> &str {
        "sim"
    }

    fn supports_metadata(&self) -> bool {
        self.state.borrow().metadata
    }

    fn mount(&mut self, ticket: Ticket, request: &MountRequest) -> Result<(), DeviceFailure> {
        self.run(ticket, |state| state.mount(request))
    }

    fn configure(
        &mut self,
        ticket: Ticket,
        handle: &MountHandle,
        params: &ContainerParams,
    ) -> Result<(), DeviceFailure> {
        self.run(ticket, |state| state.configure(handle, params))
    }

    fn transfer(
        &mut self,
        ticket: Ticket,
        handle: &MountHandle,
        transfer: Transfer,
    ) -> Result<(), DeviceFailure> {
        self.run(ticket, |state| state.transfer(handle, transfer))
    }

    fn unmount(
        &mut self,
        ticket: Ticket,
        handle: MountHandle,
        backup: bool,
    ) -> Result<(), DeviceFailure> {
        let mut state = self.state.borrow_mut();
        let fault = state.begin(ticket)?;
        // The handle is gone either way, so the mount is always released
        let result = state.unmount(&handle, backup && fault.is_none());
        let result = match fault {
            Some(failure) => Err(failure),
            None => result,
        };
        state.post(ticket, result);
        Ok(())
    }

    fn delete(
        &mut self,
        ticket: Ticket,
        _user_id: i32,
        dir_name: &str,
    ) -> Result<(), DeviceFailure> {
        self.run(ticket, |state| state.delete(dir_name))
    }

    fn check_backup(
        &mut self,
        ticket: Ticket,
        _user_id: i32,
        dir_name: &str,
    ) -> Result<(), DeviceFailure> {
        self.run(ticket, |state| {
            if state.backups.contains_key(dir_name) {
                Ok(CallOutput::Unit)
            } else {
                Err(DeviceFailure::not_found())
            }
        })
    }

    fn restore_backup(
        &mut self,
        ticket: Ticket,
        _user_id: i32,
        dir_name: &str,
    ) -> Result<(), DeviceFailure> {
        self.run(ticket, |state| state.restore_backup(dir_name))
    }

    fn open_dialog(&mut self, ticket: Ticket, request: &DialogRequest) -> Result<(), DeviceFailure> {
        self.run(ticket, |state| {
            log::info!("[Sim] Dialog: {}", request.message());
            state.dialogs.push(request.kind);
            Ok(CallOutput::DialogClosed(0))
        })
    }
}
