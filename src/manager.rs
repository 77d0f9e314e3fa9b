//! Application entry point for platform services
//!
//! Wraps one [`Platform`] and turns its save/load callbacks into
//! [`PlatformEvent`]s delivered to registered listeners during `update()`.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::platform::Platform;

/// Result of a save or load, as seen by listeners
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformEvent {
    pub success: bool,
    pub filename: String,
    /// Loaded bytes; empty for saves
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndKind {
    Save,
    Load,
}

type Listener = Box<dyn FnMut(&PlatformEvent)>;
type Outbox = Rc<RefCell<VecDeque<(EndKind, PlatformEvent)>>>;

pub struct PlatformManager {
    platform: Box<dyn Platform>,
    outbox: Outbox,
    save_listeners: Vec<Listener>,
    load_listeners: Vec<Listener>,
}

impl PlatformManager {
    pub fn new(platform: Box<dyn Platform>) -> Self {
        Self {
            platform,
            outbox: Rc::default(),
            save_listeners: Vec::new(),
            load_listeners: Vec::new(),
        }
    }

    pub fn start(&mut self) {
        self.platform.on_platform_start();
    }

    /// Tick the platform, then deliver finished saves and loads
    pub fn update(&mut self) {
        self.platform.on_platform_update();

        loop {
            let Some((kind, event)) = self.outbox.borrow_mut().pop_front() else {
                break;
            };
            let listeners = match kind {
                EndKind::Save => &mut self.save_listeners,
                EndKind::Load => &mut self.load_listeners,
            };
            for listener in listeners.iter_mut() {
                listener(&event);
            }
        }
    }

    pub fn on_game_save_end(&mut self, listener: impl FnMut(&PlatformEvent) + 'static) {
        self.save_listeners.push(Box::new(listener));
    }

    pub fn on_game_load_end(&mut self, listener: impl FnMut(&PlatformEvent) + 'static) {
        self.load_listeners.push(Box::new(listener));
    }

    /// Queue a save. Without a connected user it fails on the next update.
    pub fn request_game_save(&mut self, filename: &str, data: Vec<u8>) {
        if !self.platform.has_user_connected() {
            log::warn!("Save of '{}' skipped: no user connected", filename);
            self.outbox.borrow_mut().push_back((
                EndKind::Save,
                PlatformEvent {
                    success: false,
                    filename: filename.to_string(),
                    data: Vec::new(),
                },
            ));
            return;
        }

        let outbox = Rc::clone(&self.outbox);
        let name = filename.to_string();
        self.platform.save_game_data(
            data,
            filename,
            Box::new(move |success| {
                outbox.borrow_mut().push_back((
                    EndKind::Save,
                    PlatformEvent {
                        success,
                        filename: name,
                        data: Vec::new(),
                    },
                ));
            }),
        );
    }

    pub fn request_game_load(&mut self, filename: &str) {
        let outbox = Rc::clone(&self.outbox);
        self.platform.load_game_data(
            filename,
            Box::new(move |success, data, filename| {
                outbox.borrow_mut().push_back((
                    EndKind::Load,
                    PlatformEvent {
                        success,
                        filename,
                        data,
                    },
                ));
            }),
        );
    }

    pub fn user_id(&self) -> i32 {
        self.platform.user_id()
    }

    pub fn network_user_id(&self) -> String {
        self.platform.network_user_id()
    }

    pub fn unique_id(&self) -> String {
        self.platform.unique_id()
    }

    pub fn nickname(&self) -> String {
        self.platform.nickname()
    }

    pub fn has_user_connected(&self) -> bool {
        self.platform.has_user_connected()
    }

    pub fn has_internet_connection(&self) -> bool {
        self.platform.has_internet_connection()
    }

    pub fn unlock_achievement(&mut self, id: i32) {
        log::info!("Unlocking achievement {}", id);
        self.platform.unlock_achievement(id, None);
    }

    pub fn set_presence(&mut self, id: &str) {
        self.platform.set_presence(id, &[]);
    }

    pub fn clear_presence(&mut self) {
        self.platform.clear_presence();
    }

    pub fn platform(&self) -> &dyn Platform {
        self.platform.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::DispatchQueue;
    use crate::platform::{ConsolePlatform, OfflineServices, PlatformServices};
    use crate::settings::Settings;
    use crate::sim::SimDevice;

    /// Offline services with a switchable connection
    struct Disconnected(OfflineServices);

    impl PlatformServices for Disconnected {
        fn user_id(&self) -> i32 {
            self.0.user_id()
        }
        fn network_user_id(&self) -> String {
            self.0.network_user_id()
        }
        fn unique_id(&self) -> String {
            self.0.unique_id()
        }
        fn nickname(&self) -> String {
            self.0.nickname()
        }
        fn has_user_connected(&self) -> bool {
            false
        }
        fn has_internet_connection(&self) -> bool {
            false
        }
        fn unlock_achievement(&mut self, id: i32) -> bool {
            self.0.unlock_achievement(id)
        }
        fn set_presence(&mut self, id: &str, extra: &[String]) {
            self.0.set_presence(id, extra)
        }
        fn clear_presence(&mut self) {
            self.0.clear_presence()
        }
    }

    fn manager() -> (PlatformManager, SimDevice) {
        let queue = DispatchQueue::new();
        let sim = SimDevice::new(queue.sender());
        let platform = ConsolePlatform::new(sim.clone(), queue, &Settings::default());
        (PlatformManager::new(Box::new(platform)), sim)
    }

    fn tick(manager: &mut PlatformManager, sim: &SimDevice, ticks: usize) {
        for _ in 0..ticks {
            sim.step();
            manager.update();
        }
    }

    #[test]
    fn test_events_reach_listeners() {
        let (mut manager, sim) = manager();
        let events: Rc<RefCell<Vec<PlatformEvent>>> = Rc::default();

        let sink = Rc::clone(&events);
        manager.on_game_save_end(move |e| sink.borrow_mut().push(e.clone()));
        let sink = Rc::clone(&events);
        manager.on_game_load_end(move |e| sink.borrow_mut().push(e.clone()));

        manager.start();
        manager.request_game_save("slot", b"abc".to_vec());
        manager.request_game_load("slot");
        tick(&mut manager, &sim, 50);

        assert_eq!(
            *events.borrow(),
            vec![
                PlatformEvent {
                    success: true,
                    filename: "slot".into(),
                    data: Vec::new(),
                },
                PlatformEvent {
                    success: true,
                    filename: "slot".into(),
                    data: b"abc".to_vec(),
                },
            ]
        );
    }

    #[test]
    fn test_save_without_user_fails() {
        let queue = DispatchQueue::new();
        let sim = SimDevice::new(queue.sender());
        let platform = ConsolePlatform::new(sim.clone(), queue, &Settings::default())
            .with_services(Disconnected(OfflineServices::new(1)));
        let mut manager = PlatformManager::new(Box::new(platform));
        let results: Rc<RefCell<Vec<bool>>> = Rc::default();

        let sink = Rc::clone(&results);
        manager.on_game_save_end(move |e| sink.borrow_mut().push(e.success));
        manager.request_game_save("slot", vec![1]);
        tick(&mut manager, &sim, 5);

        assert_eq!(*results.borrow(), vec![false]);
        assert!(sim.calls().is_empty());
    }
}
