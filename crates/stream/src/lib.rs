//! Entity streaming: decides which registered definitions are materialized
//! in the game engine, for which players, at any moment.
//!
//! # Invariants
//! - Live entities of a class never exceed the engine's global ceiling, and
//!   no player sees more than the per-player ceiling.
//! - Occupied entities are never streamed out.
//! - Entities are created and destroyed only through the [`EngineBinding`].
//! - A respawn timer fires at most once and never after its definition is unregistered.
//! - `reload` keeps every definition registered under its original handle.
//! - A failed reload leaves every class exactly as it was.

mod budget;
mod class;
mod clock;
mod coordinator;
mod engine;
mod events;
mod respawn;
mod settings;

pub use budget::{PassStats, PassTimer};
pub use class::{Handle, NearbyEntity};
pub use clock::{Clock, ManualClock, SystemClock};
pub use coordinator::{PlayerStreamState, StreamError, StreamingCoordinator, UpdateReport};
pub use engine::{EngineBinding, EngineError, EngineHandle, SimulatedEngine, SimulatedEntity};
pub use events::{DespawnReason, EventBus, StreamEvent, StreamObserver};
pub use respawn::RespawnScheduler;
pub use settings::{ClassSettings, SettingsError, SettingsStore, StreamSettings};

pub fn crate_info() -> &'static str {
    "streamer-core v0.1.0"
}
