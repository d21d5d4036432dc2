//! sessiond - concurrent session lifecycle orchestration.
//!
//! Keeps any number of sessions running side by side while exactly one
//! holds foreground focus. Every session marches through one state machine
//! (`Booting -> RunningLocked -> Unlocking -> Unlocked -> Stopping ->
//! Shutdown -> removed`); the [`Orchestrator`] drives the start, unlock,
//! stop, and foreground-switch workflows over a single shared registry.

pub mod config;
pub mod eviction;
pub mod journey;
pub mod orchestrator;
pub mod pending;
pub mod registry;
pub mod services;
pub mod state;
pub mod stop;
pub mod switch;
pub mod unlock;

pub use config::SessiondConfig;
pub use orchestrator::{Orchestrator, StartMode};
pub use registry::RunningFilter;
pub use state::{SessionId, SessionState};
pub use stop::{StopError, StopOutcome, StopRequest};
pub use switch::{SwitchError, SwitchObserver};
pub use unlock::UnlockListener;
