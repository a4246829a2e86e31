//! Core types shared across the EdgeTwin workspace.
//!
//! This crate holds the pieces every other crate leans on:
//! - `config`: defaults, environment overrides and TOML loading
//! - `error`: the workspace-level error type
//! - `eventbus`: a broadcast event bus with per-event metadata

pub mod config;
pub mod error;
pub mod event;
pub mod eventbus;

pub use config::TwinConfig;
pub use error::{Error, Result};
pub use event::EventMetadata;
pub use eventbus::{DEFAULT_CHANNEL_CAPACITY, EventBus, EventBusReceiver};

/// Re-exports commonly used types.
pub mod prelude {
    pub use crate::config::{
        EventSettings, IngestSettings, LivenessSettings, LoggingSettings, StatusSettings,
        TwinConfig, defaults, env_vars,
    };
    pub use crate::error::{Error, Result};
    pub use crate::event::EventMetadata;
    pub use crate::eventbus::{EventBus, EventBusReceiver};
}

/// Current time as unix milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
