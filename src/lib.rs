//! savebridge - Console-style save data controller
//!
//! Core modules:
//! - `persistence`: Save-data controller, request scheduler, dispatch queue
//! - `platform`: Platform façade and save devices (filesystem, LocalStorage)
//! - `sim`: Deterministic in-memory save device with scripted faults
//! - `manager`: Application entry point delivering save/load events
//! - `settings`: Data-driven container and scheduling configuration

pub mod manager;
pub mod persistence;
pub mod platform;
pub mod settings;
pub mod sim;

pub use manager::{PlatformEvent, PlatformManager};
pub use persistence::{
    DispatchQueue, OperationOutcome, SaveDataController, SaveScheduler,
};
pub use platform::{ConsolePlatform, Platform, SaveDevice};
pub use settings::{ContainerSettings, Settings, SettingsError};

/// Save-data configuration constants
pub mod consts {
    /// Bytes per chunked read/write
    pub const DEFAULT_CHUNK_SIZE: usize = 1000;

    /// Default container directory name
    pub const MOUNT_DIR_NAME: &str = "saves";
    pub const SAVE_TITLE: &str = "Save Data";

    /// Container block size in bytes
    pub const BLOCK_SIZE: u64 = 32 * 1024;
    /// Smallest container the platform will create
    pub const BLOCKS_MIN: u64 = 96;
    /// Minimum plus 2 MiB of payload space
    pub const DEFAULT_CONTAINER_BLOCKS: u64 = BLOCKS_MIN + (2 * 1024 * 1024) / BLOCK_SIZE;

    /// Corruption recoveries allowed per operation
    pub const MAX_RECOVERY_ATTEMPTS: u8 = 1;
}
