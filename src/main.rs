//! savebridge entry point
//!
//! Loads a small profile, bumps its visit counter and saves it back, ticking
//! the platform the way a game loop would.

use serde::{Deserialize, Serialize};

/// Demo payload
#[derive(Debug, Default, Serialize, Deserialize)]
struct Profile {
    visits: u64,
}

const PROFILE_FILE: &str = "profile";

/// Next profile to save after a load
fn next_profile(success: bool, data: &[u8]) -> Profile {
    if !success {
        log::warn!("Profile could not be loaded, starting over");
        return Profile::default();
    }
    if data.is_empty() {
        log::info!("No profile yet");
        return Profile::default();
    }
    match serde_json::from_slice::<Profile>(data) {
        Ok(profile) => profile,
        Err(e) => {
            log::warn!("Profile is unreadable ({}), starting over", e);
            Profile::default()
        }
    }
}

#[cfg(target_arch = "wasm32")]
use wasm_bindgen::prelude::*;

#[cfg(target_arch = "wasm32")]
mod web_demo {
    use std::cell::RefCell;
    use std::rc::Rc;
    use wasm_bindgen::prelude::*;

    use savebridge::platform::WebStorageDevice;
    use savebridge::{ConsolePlatform, DispatchQueue, PlatformManager, Settings};

    use super::{PROFILE_FILE, Profile, next_profile};

    struct Demo {
        manager: PlatformManager,
        /// Serialized profile waiting to be saved
        to_save: Rc<RefCell<Option<Vec<u8>>>>,
    }

    pub fn run() {
        console_error_panic_hook::set_once();
        console_log::init_with_level(log::Level::Info).expect("Failed to init logger");

        log::info!("savebridge starting...");

        let settings = Settings::load();
        let queue = DispatchQueue::new();
        let device = WebStorageDevice::new(queue.sender());
        let platform = ConsolePlatform::new(device, queue, &settings);
        let mut manager = PlatformManager::new(Box::new(platform));

        let to_save = Rc::new(RefCell::new(None));
        let sink = Rc::clone(&to_save);
        manager.on_game_load_end(move |event| {
            let mut profile: Profile = next_profile(event.success, &event.data);
            profile.visits += 1;
            log::info!("Visit #{}", profile.visits);
            if let Ok(bytes) = serde_json::to_vec(&profile) {
                *sink.borrow_mut() = Some(bytes);
            }
        });
        manager.on_game_save_end(|event| {
            log::info!("Saved '{}': {}", event.filename, event.success);
        });

        manager.start();
        manager.request_game_load(PROFILE_FILE);

        request_animation_frame(Rc::new(RefCell::new(Demo { manager, to_save })));
    }

    fn request_animation_frame(demo: Rc<RefCell<Demo>>) {
        let Some(window) = web_sys::window() else {
            log::error!("No window; stopping");
            return;
        };
        let closure = Closure::once(move |_time: f64| {
            demo_loop(demo);
        });
        let _ = window.request_animation_frame(closure.as_ref().unchecked_ref());
        closure.forget();
    }

    fn demo_loop(demo: Rc<RefCell<Demo>>) {
        {
            let mut d = demo.borrow_mut();
            d.manager.update();
            let pending = d.to_save.borrow_mut().take();
            if let Some(bytes) = pending {
                d.manager.request_game_save(PROFILE_FILE, bytes);
            }
        }

        request_animation_frame(demo);
    }
}

#[cfg(target_arch = "wasm32")]
#[wasm_bindgen(start)]
pub fn wasm_main() {
    web_demo::run();
}

#[cfg(not(target_arch = "wasm32"))]
fn main() {
    use std::cell::RefCell;
    use std::path::PathBuf;
    use std::rc::Rc;
    use std::time::Duration;

    use savebridge::platform::FileDevice;
    use savebridge::{ConsolePlatform, DispatchQueue, PlatformEvent, PlatformManager, Settings};

    const TICK: Duration = Duration::from_millis(16);
    const MAX_TICKS: usize = 60 * 30;

    env_logger::init();
    log::info!("savebridge (native) starting...");

    let settings = Settings::load();
    let root = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::temp_dir().join("savebridge"));
    log::info!("Saving under {}", root.display());

    let queue = DispatchQueue::new();
    let device = FileDevice::new(&root, queue.sender());
    let platform = ConsolePlatform::new(device, queue, &settings);
    let mut manager = PlatformManager::new(Box::new(platform));

    let loaded: Rc<RefCell<Option<PlatformEvent>>> = Rc::default();
    let saved: Rc<RefCell<Option<PlatformEvent>>> = Rc::default();
    let sink = Rc::clone(&loaded);
    manager.on_game_load_end(move |event| *sink.borrow_mut() = Some(event.clone()));
    let sink = Rc::clone(&saved);
    manager.on_game_save_end(move |event| *sink.borrow_mut() = Some(event.clone()));

    let wait = |manager: &mut PlatformManager, slot: &Rc<RefCell<Option<PlatformEvent>>>| {
        for _ in 0..MAX_TICKS {
            manager.update();
            if let Some(event) = slot.borrow_mut().take() {
                return Some(event);
            }
            std::thread::sleep(TICK);
        }
        None
    };

    manager.start();
    manager.request_game_load(PROFILE_FILE);
    let Some(event) = wait(&mut manager, &loaded) else {
        log::error!("Load did not finish");
        std::process::exit(1);
    };

    let mut profile = next_profile(event.success, &event.data);
    profile.visits += 1;
    let bytes = match serde_json::to_vec(&profile) {
        Ok(bytes) => bytes,
        Err(e) => {
            log::error!("Failed to serialize profile: {}", e);
            std::process::exit(1);
        }
    };

    manager.request_game_save(PROFILE_FILE, bytes);
    match wait(&mut manager, &saved) {
        Some(event) if event.success => {
            println!("Visit #{} saved to {}", profile.visits, root.display());
        }
        Some(_) => {
            log::error!("Save failed");
            std::process::exit(1);
        }
        None => {
            log::error!("Save did not finish");
            std::process::exit(1);
        }
    }
}

#[cfg(target_arch = "wasm32")]
fn main() {
    // WASM entry point is wasm_main, this is just to satisfy the compiler
}
