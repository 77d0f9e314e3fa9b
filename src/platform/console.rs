//! Console-style platform
//!
//! Saves and loads go through the request scheduler and the save-data
//! controller; identity, achievements and presence go straight to the
//! platform services.

use super::device::SaveDevice;
use super::{AchievementDone, LoadDone, OfflineServices, Platform, PlatformServices, SaveDone};
use crate::persistence::{DispatchQueue, OperationOutcome, SaveDataController, SaveScheduler};
use crate::settings::Settings;

pub struct ConsolePlatform<D: SaveDevice> {
    scheduler: SaveScheduler<D>,
    services: Box<dyn PlatformServices>,
    started: bool,
}

impl<D: SaveDevice> ConsolePlatform<D> {
    /// `queue` must be the queue `device` posts its completions to
    pub fn new(device: D, queue: DispatchQueue, settings: &Settings) -> Self {
        let controller = SaveDataController::new(device, queue, settings);
        #[cfg(not(target_arch = "wasm32"))]
        let controller = match settings.load_icon() {
            Some(icon) => controller.with_icon(icon),
            None => controller,
        };

        Self {
            scheduler: SaveScheduler::new(controller, settings),
            services: Box::new(OfflineServices::new(settings.user_id)),
            started: false,
        }
    }

    pub fn with_services(mut self, services: impl PlatformServices + 'static) -> Self {
        self.services = Box::new(services);
        self
    }

    pub fn scheduler(&self) -> &SaveScheduler<D> {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut SaveScheduler<D> {
        &mut self.scheduler
    }

    pub fn is_started(&self) -> bool {
        self.started
    }
}

/// Successful loads carry the payload; a missing save is an empty success
fn load_result(outcome: OperationOutcome, payload: Vec<u8>) -> (bool, Vec<u8>) {
    match outcome {
        OperationOutcome::Success => (true, payload),
        OperationOutcome::NotFound => (true, Vec::new()),
        _ => (false, Vec::new()),
    }
}

impl<D: SaveDevice> Platform for ConsolePlatform<D> {
    fn on_platform_start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        log::info!(
            "Platform started for user {} ({})",
            self.services.user_id(),
            self.scheduler.controller().device().name()
        );
    }

    fn on_platform_update(&mut self) {
        self.scheduler.update();
    }

    fn save_game_data(&mut self, payload: Vec<u8>, filename: &str, callback: SaveDone) {
        self.scheduler
            .request_save(payload, filename, move |outcome| callback(outcome.is_success()));
    }

    fn load_game_data(&mut self, filename: &str, callback: LoadDone) {
        let name = filename.to_string();
        self.scheduler.request_load(filename, move |outcome, payload| {
            let (success, payload) = load_result(outcome, payload);
            callback(success, payload, name)
        });
    }

    fn user_id(&self) -> i32 {
        self.services.user_id()
    }

    fn network_user_id(&self) -> String {
        self.services.network_user_id()
    }

    fn unique_id(&self) -> String {
        self.services.unique_id()
    }

    fn nickname(&self) -> String {
        self.services.nickname()
    }

    fn has_user_connected(&self) -> bool {
        self.services.has_user_connected()
    }

    fn has_internet_connection(&self) -> bool {
        self.services.has_internet_connection()
    }

    fn unlock_achievement(&mut self, id: i32, callback: Option<AchievementDone>) {
        let unlocked = self.services.unlock_achievement(id);
        if let Some(callback) = callback {
            callback(unlocked);
        }
    }

    fn set_presence(&mut self, id: &str, extra: &[String]) {
        self.services.set_presence(id, extra);
    }

    fn clear_presence(&mut self) {
        self.services.clear_presence();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{CallKind, DeviceFailure};
    use crate::sim::SimDevice;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn platform() -> (ConsolePlatform<SimDevice>, SimDevice) {
        let queue = DispatchQueue::new();
        let sim = SimDevice::new(queue.sender());
        (
            ConsolePlatform::new(sim.clone(), queue, &Settings::default()),
            sim,
        )
    }

    fn settle(platform: &mut ConsolePlatform<SimDevice>, sim: &SimDevice) {
        for _ in 0..1000 {
            if !platform.scheduler().is_busy() {
                return;
            }
            sim.step();
            platform.on_platform_update();
        }
        panic!("platform did not settle");
    }

    #[test]
    fn test_outcome_mapping() {
        assert_eq!(
            load_result(OperationOutcome::Success, vec![1]),
            (true, vec![1])
        );
        assert_eq!(
            load_result(OperationOutcome::NotFound, vec![1]),
            (true, vec![])
        );
        assert_eq!(
            load_result(OperationOutcome::Corrupted, vec![1]),
            (false, vec![])
        );
        assert_eq!(
            load_result(OperationOutcome::GenericError, vec![]),
            (false, vec![])
        );
    }

    #[test]
    fn test_save_and_load_through_callbacks() {
        let (mut platform, sim) = platform();
        let saved = Rc::new(RefCell::new(None));
        let loaded = Rc::new(RefCell::new(None));

        let sink = Rc::clone(&saved);
        platform.save_game_data(
            b"progress".to_vec(),
            "slot0",
            Box::new(move |ok| *sink.borrow_mut() = Some(ok)),
        );
        let sink = Rc::clone(&loaded);
        platform.load_game_data(
            "slot0",
            Box::new(move |ok, data, name| *sink.borrow_mut() = Some((ok, data, name))),
        );
        settle(&mut platform, &sim);

        assert_eq!(*saved.borrow(), Some(true));
        assert_eq!(
            *loaded.borrow(),
            Some((true, b"progress".to_vec(), "slot0".to_string()))
        );
    }

    #[test]
    fn test_failed_save_reports_false() {
        let (mut platform, sim) = platform();
        sim.inject(CallKind::Mount, DeviceFailure::no_free_space(10));
        let saved = Rc::new(RefCell::new(None));

        let sink = Rc::clone(&saved);
        platform.save_game_data(vec![1], "slot0", Box::new(move |ok| *sink.borrow_mut() = Some(ok)));
        settle(&mut platform, &sim);

        assert_eq!(*saved.borrow(), Some(false));
    }

    #[test]
    fn test_services_pass_through() {
        let (mut platform, _sim) = platform();
        let unlocked = Rc::new(RefCell::new(false));

        platform.on_platform_start();
        assert!(platform.is_started());
        assert_eq!(platform.user_id(), Settings::default().user_id);
        assert!(platform.has_user_connected());

        let sink = Rc::clone(&unlocked);
        platform.unlock_achievement(2, Some(Box::new(move |ok| *sink.borrow_mut() = ok)));
        assert!(*unlocked.borrow());
    }
}
