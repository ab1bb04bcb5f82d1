//! The seam between the streamer and the game engine.
//!
//! The coordinator never creates or destroys anything except through an
//! [`EngineBinding`]. [`SimulatedEngine`] is an in-memory binding used by the
//! CLI and the tests.

use std::collections::BTreeMap;

use streamer_common::{EntityClass, StreamableEntityInfo};

use crate::settings::SettingsStore;

/// Engine-side identifier of a materialized entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EngineHandle(pub u32);

/// Failures reported by the engine binding.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error("engine failed to create {class}: {reason}")]
    CreateFailed { class: EntityClass, reason: String },
}

/// Operations the streamer consumes from the game engine.
pub trait EngineBinding {
    /// Materialize an entity.
    fn spawn(&mut self, info: &StreamableEntityInfo) -> Result<EngineHandle, EngineError>;

    /// Remove a materialized entity. Unknown handles are ignored.
    fn destroy(&mut self, handle: EngineHandle);

    /// Number of players currently occupying the entity (drivers, passengers).
    fn occupant_count(&self, handle: EngineHandle) -> usize;

    /// Maximum number of live entities of `class`. Re-read on every pass.
    fn global_capacity(&self, class: EntityClass) -> usize;

    /// Maximum number of live entities of `class` visible to one player.
    fn per_player_capacity(&self, class: EntityClass) -> usize;
}

/// An entity materialized by the [`SimulatedEngine`].
#[derive(Debug, Clone)]
pub struct SimulatedEntity {
    pub info: StreamableEntityInfo,
    pub occupants: usize,
}

/// In-memory engine binding.
///
/// Ceilings come from the live [`SettingsStore`]. An optional hard limit per
/// class models engine-side exhaustion independent of the streamer's own
/// ceilings.
#[derive(Debug)]
pub struct SimulatedEngine {
    settings: SettingsStore,
    entities: BTreeMap<EngineHandle, SimulatedEntity>,
    next_handle: u32,
    hard_limits: BTreeMap<EntityClass, usize>,
    pending_failures: usize,
    spawned_total: u64,
    destroyed_total: u64,
}

impl SimulatedEngine {
    pub fn new(settings: SettingsStore) -> Self {
        Self {
            settings,
            entities: BTreeMap::new(),
            next_handle: 0,
            hard_limits: BTreeMap::new(),
            pending_failures: 0,
            spawned_total: 0,
            destroyed_total: 0,
        }
    }

    /// Refuse spawns of `class` once `limit` of them exist.
    pub fn with_hard_limit(mut self, class: EntityClass, limit: usize) -> Self {
        self.hard_limits.insert(class, limit);
        self
    }

    /// Make the next `count` spawn calls fail.
    pub fn fail_next_spawns(&mut self, count: usize) {
        self.pending_failures = count;
    }

    pub fn set_occupants(&mut self, handle: EngineHandle, occupants: usize) {
        if let Some(entity) = self.entities.get_mut(&handle) {
            entity.occupants = occupants;
        }
    }

    pub fn entity(&self, handle: EngineHandle) -> Option<&SimulatedEntity> {
        self.entities.get(&handle)
    }

    pub fn is_live(&self, handle: EngineHandle) -> bool {
        self.entities.contains_key(&handle)
    }

    pub fn live_count(&self, class: EntityClass) -> usize {
        self.entities
            .values()
            .filter(|e| e.info.class() == class)
            .count()
    }

    pub fn total_live(&self) -> usize {
        self.entities.len()
    }

    pub fn spawned_total(&self) -> u64 {
        self.spawned_total
    }

    pub fn destroyed_total(&self) -> u64 {
        self.destroyed_total
    }
}

impl EngineBinding for SimulatedEngine {
    fn spawn(&mut self, info: &StreamableEntityInfo) -> Result<EngineHandle, EngineError> {
        let class = info.class();
        if self.pending_failures > 0 {
            self.pending_failures -= 1;
            return Err(EngineError::CreateFailed {
                class,
                reason: "injected failure".into(),
            });
        }
        if let Some(limit) = self.hard_limits.get(&class) {
            if self.live_count(class) >= *limit {
                return Err(EngineError::CreateFailed {
                    class,
                    reason: format!("engine limit of {limit} reached"),
                });
            }
        }

        let handle = EngineHandle(self.next_handle);
        self.next_handle += 1;
        self.entities.insert(
            handle,
            SimulatedEntity {
                info: info.clone(),
                occupants: 0,
            },
        );
        self.spawned_total += 1;
        Ok(handle)
    }

    fn destroy(&mut self, handle: EngineHandle) {
        if self.entities.remove(&handle).is_some() {
            self.destroyed_total += 1;
        }
    }

    fn occupant_count(&self, handle: EngineHandle) -> usize {
        self.entities.get(&handle).map_or(0, |e| e.occupants)
    }

    fn global_capacity(&self, class: EntityClass) -> usize {
        self.settings.get().class(class).global_capacity
    }

    fn per_player_capacity(&self, class: EntityClass) -> usize {
        self.settings.get().class(class).per_player_capacity
    }
}
