//! Platform abstraction layer
//!
//! Handles per-target differences for:
//! - Save containers (`SaveDevice` implementations)
//! - User identity and connectivity
//! - Achievements and rich presence
//!
//! Storage targets: directories on native (`fs`), LocalStorage on the web
//! (`web`), and the in-memory simulation in `crate::sim`.

pub mod console;
pub mod device;
#[cfg(not(target_arch = "wasm32"))]
pub mod fs;
#[cfg(target_arch = "wasm32")]
pub mod web;

use std::collections::BTreeSet;

pub use console::ConsolePlatform;
pub use device::{
    ContainerParams, DialogContext, DialogKind, DialogRequest, MountHandle, MountMode,
    MountRequest, SaveDevice, Transfer,
};
#[cfg(not(target_arch = "wasm32"))]
pub use fs::FileDevice;
#[cfg(target_arch = "wasm32")]
pub use web::WebStorageDevice;

/// `success`
pub type SaveDone = Box<dyn FnOnce(bool)>;
/// `success`, payload (empty when there is none), filename
pub type LoadDone = Box<dyn FnOnce(bool, Vec<u8>, String)>;
/// `success`
pub type AchievementDone = Box<dyn FnOnce(bool)>;

/// Application-facing platform surface
pub trait Platform {
    fn on_platform_start(&mut self);

    /// Called once per tick
    fn on_platform_update(&mut self);

    fn save_game_data(&mut self, payload: Vec<u8>, filename: &str, callback: SaveDone);
    fn load_game_data(&mut self, filename: &str, callback: LoadDone);

    fn user_id(&self) -> i32;
    fn network_user_id(&self) -> String;
    fn unique_id(&self) -> String;
    fn nickname(&self) -> String;

    fn has_user_connected(&self) -> bool;
    fn has_internet_connection(&self) -> bool;

    fn unlock_achievement(&mut self, id: i32, callback: Option<AchievementDone>);

    fn set_presence(&mut self, id: &str, extra: &[String]);
    fn clear_presence(&mut self);
}

/// Identity, achievements and presence, outside the save path
pub trait PlatformServices {
    fn user_id(&self) -> i32;
    fn network_user_id(&self) -> String;
    fn unique_id(&self) -> String;
    fn nickname(&self) -> String;

    fn has_user_connected(&self) -> bool;
    fn has_internet_connection(&self) -> bool;

    /// Returns whether the unlock was accepted
    fn unlock_achievement(&mut self, id: i32) -> bool;

    fn set_presence(&mut self, id: &str, extra: &[String]);
    fn clear_presence(&mut self);
}

/// Single local user with no network account
#[derive(Debug, Clone, Default)]
pub struct OfflineServices {
    user_id: i32,
    nickname: String,
    achievements: BTreeSet<i32>,
    presence: Option<(String, Vec<String>)>,
}

impl OfflineServices {
    pub fn new(user_id: i32) -> Self {
        Self {
            user_id,
            nickname: "Player".to_string(),
            ..Self::default()
        }
    }

    pub fn with_nickname(mut self, nickname: impl Into<String>) -> Self {
        self.nickname = nickname.into();
        self
    }

    pub fn achievements(&self) -> impl Iterator<Item = i32> + '_ {
        self.achievements.iter().copied()
    }

    pub fn presence(&self) -> Option<&str> {
        self.presence.as_ref().map(|(id, _)| id.as_str())
    }
}

impl PlatformServices for OfflineServices {
    fn user_id(&self) -> i32 {
        self.user_id
    }

    fn network_user_id(&self) -> String {
        String::new()
    }

    fn unique_id(&self) -> String {
        format!("local-{}", self.user_id)
    }

    fn nickname(&self) -> String {
        self.nickname.clone()
    }

    fn has_user_connected(&self) -> bool {
        true
    }

    fn has_internet_connection(&self) -> bool {
        false
    }

    fn unlock_achievement(&mut self, id: i32) -> bool {
        if self.achievements.insert(id) {
            log::info!("Achievement {} unlocked", id);
        }
        true
    }

    fn set_presence(&mut self, id: &str, extra: &[String]) {
        log::debug!("Presence: {} {:?}", id, extra);
        self.presence = Some((id.to_string(), extra.to_vec()));
    }

    fn clear_presence(&mut self) {
        self.presence = None;
    }
}
