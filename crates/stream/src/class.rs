use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use glam::{Vec2, Vec3};
use streamer_common::{EntityClass, Locality, PlayerId, StreamableEntityInfo, StreamingPlayer};
use streamer_grid::{GridError, GridRecord, SpatialGrid};

use crate::budget::PassStats;
use crate::engine::{EngineBinding, EngineHandle};
use crate::events::{DespawnReason, EventBus, StreamEvent};
use crate::respawn::RespawnScheduler;
use crate::settings::StreamSettings;

/// Identifies a registered definition. Handles are issued in registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(pub(crate) u64);

impl Handle {
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// A registered definition near a query point.
#[derive(Debug, Clone, Copy)]
pub struct NearbyEntity<'a> {
    pub handle: Handle,
    pub info: &'a StreamableEntityInfo,
    /// Planar distance to the query point.
    pub distance: f32,
}

pub(crate) enum CreateResult {
    Created,
    AlreadyLive,
    /// The definition no longer exists.
    Missing,
    Deferred,
    Failed,
}

pub(crate) struct PassOutcome {
    pub stats: PassStats,
    /// Live handles each evaluated player ended up with.
    pub visible: BTreeMap<PlayerId, BTreeSet<Handle>>,
}

/// Streaming state for one entity class.
///
/// Outdoor definitions live in the spatial grid. Definitions in any other
/// locality are kept in per-locality buckets and matched by a linear scan
/// against players in the same locality.
pub(crate) struct ClassStreamer {
    class: EntityClass,
    grid: SpatialGrid<Handle>,
    definitions: BTreeMap<Handle, StreamableEntityInfo>,
    localized: BTreeMap<Locality, BTreeSet<Handle>>,
    live: BTreeMap<Handle, EngineHandle>,
    respawns: RespawnScheduler,
}

impl ClassStreamer {
    pub fn new(
        class: EntityClass,
        world_size: f32,
        stream_distance: f32,
    ) -> Result<Self, GridError> {
        Ok(Self {
            class,
            grid: SpatialGrid::new(world_size, stream_distance)?,
            definitions: BTreeMap::new(),
            localized: BTreeMap::new(),
            live: BTreeMap::new(),
            respawns: RespawnScheduler::new(),
        })
    }

    pub fn grid(&self) -> &SpatialGrid<Handle> {
        &self.grid
    }

    pub fn stream_distance(&self) -> f32 {
        self.grid.cell_size()
    }

    pub fn definition(&self, handle: Handle) -> Option<&StreamableEntityInfo> {
        self.definitions.get(&handle)
    }

    pub fn definition_count(&self) -> usize {
        self.definitions.len()
    }

    pub fn engine_handle(&self, handle: Handle) -> Option<EngineHandle> {
        self.live.get(&handle).copied()
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn respawn_time(&self, handle: Handle) -> Option<Duration> {
        self.respawns.fire_time(handle)
    }

    pub fn register(
        &mut self,
        handle: Handle,
        info: StreamableEntityInfo,
    ) -> Result<(), GridError> {
        if info.locality == self.grid.locality() {
            self.grid
                .insert(GridRecord::new(handle, info.position, info.locality))?;
        } else {
            self.localized.entry(info.locality).or_default().insert(handle);
        }
        self.definitions.insert(handle, info);
        Ok(())
    }

    /// Forget a definition, tearing down its live entity and pending respawn.
    pub fn unregister<E: EngineBinding>(
        &mut self,
        handle: Handle,
        engine: &mut E,
        bus: &EventBus,
    ) -> bool {
        let Some(info) = self.definitions.remove(&handle) else {
            return false;
        };
        if !self.grid.remove(handle) {
            if let Some(bucket) = self.localized.get_mut(&info.locality) {
                bucket.remove(&handle);
                if bucket.is_empty() {
                    self.localized.remove(&info.locality);
                }
            }
        }
        self.respawns.cancel(handle);
        if let Some(engine_handle) = self.live.remove(&handle) {
            engine.destroy(engine_handle);
            self.despawned(bus, handle, engine_handle, DespawnReason::Unregistered);
        }
        true
    }

    /// Materialize a definition now, regardless of proximity, if capacity allows.
    pub fn create_now<E: EngineBinding>(
        &mut self,
        handle: Handle,
        engine: &mut E,
        bus: &EventBus,
    ) -> CreateResult {
        let global = engine.global_capacity(self.class);
        self.try_create(handle, engine, bus, global)
    }

    /// Handle an in-game destruction. Returns `false` if the entity was not live.
    pub fn report_destroyed<E: EngineBinding>(
        &mut self,
        handle: Handle,
        engine: &mut E,
        bus: &EventBus,
        now: Duration,
        default_delay: Duration,
    ) -> bool {
        let Some(engine_handle) = self.live.remove(&handle) else {
            return false;
        };
        engine.destroy(engine_handle);
        self.despawned(bus, handle, engine_handle, DespawnReason::Destroyed);

        let delay = self
            .definitions
            .get(&handle)
            .and_then(|info| info.respawn.delay(default_delay));
        if let Some(delay) = delay {
            self.respawns.schedule(handle, now + delay);
            tracing::debug!(class = %self.class, ?handle, ?delay, "respawn scheduled");
        }
        true
    }

    /// Recreate every definition whose respawn timer is due. Returns how many were created.
    pub fn fire_respawns<E: EngineBinding>(
        &mut self,
        now: Duration,
        engine: &mut E,
        bus: &EventBus,
    ) -> usize {
        let mut respawned = 0;
        for handle in self.respawns.pop_due(now) {
            match self.create_now(handle, engine, bus) {
                CreateResult::Created => respawned += 1,
                CreateResult::Deferred => {
                    tracing::debug!(
                        class = %self.class,
                        ?handle,
                        "respawn deferred, ceiling reached"
                    );
                }
                CreateResult::AlreadyLive | CreateResult::Missing | CreateResult::Failed => {}
            }
        }
        respawned
    }

    /// Run one streaming pass for the given players.
    pub fn evaluate<E: EngineBinding>(
        &mut self,
        players: &[StreamingPlayer],
        engine: &mut E,
        bus: &EventBus,
    ) -> PassOutcome {
        let _span = tracing::info_span!("stream_evaluate", class = %self.class).entered();
        let started = Instant::now();
        let global = engine.global_capacity(self.class);
        let per_player = engine.per_player_capacity(self.class);
        let mut stats = PassStats::new(self.class);

        // Closest distance from each candidate to any player.
        let mut priority: BTreeMap<Handle, f32> = BTreeMap::new();
        let mut wanted_by: BTreeMap<PlayerId, Vec<Handle>> = BTreeMap::new();
        for player in players {
            let found = self.candidates_for(player, per_player);
            for (handle, distance_sq) in &found {
                priority
                    .entry(*handle)
                    .and_modify(|best| *best = best.min(*distance_sq))
                    .or_insert(*distance_sq);
            }
            wanted_by.insert(player.id, found.into_iter().map(|(h, _)| h).collect());
        }

        // Occupied entities are never streamed out; they hold their slot.
        let pinned: BTreeSet<Handle> = self
            .live
            .iter()
            .filter(|(_, engine_handle)| engine.occupant_count(**engine_handle) > 0)
            .map(|(handle, _)| *handle)
            .collect();
        stats.protected = pinned.iter().filter(|h| !priority.contains_key(*h)).count();
        if pinned.len() > global {
            tracing::warn!(
                class = %self.class,
                pinned = pinned.len(),
                global,
                "occupied entities exceed the global ceiling"
            );
        }

        let mut ranked: Vec<(Handle, f32)> = priority
            .iter()
            .filter(|(handle, _)| !pinned.contains(*handle))
            .map(|(handle, distance_sq)| (*handle, *distance_sq))
            .collect();
        ranked.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        let slots = global.saturating_sub(pinned.len());
        stats.deferred = ranked.len().saturating_sub(slots);
        let wanted: Vec<Handle> = ranked.into_iter().take(slots).map(|(h, _)| h).collect();
        let keep: BTreeSet<Handle> = wanted.iter().chain(pinned.iter()).copied().collect();

        let doomed: Vec<(Handle, EngineHandle)> = self
            .live
            .iter()
            .filter(|(handle, _)| !keep.contains(*handle))
            .map(|(handle, engine_handle)| (*handle, *engine_handle))
            .collect();
        for (handle, engine_handle) in doomed {
            self.live.remove(&handle);
            engine.destroy(engine_handle);
            stats.destroyed += 1;
            tracing::debug!(class = %self.class, ?handle, "streamed out");
            self.despawned(bus, handle, engine_handle, DespawnReason::OutOfRange);
        }

        // Nearest first, so a full ceiling defers the farthest creations.
        for handle in wanted {
            match self.try_create(handle, engine, bus, global) {
                CreateResult::Created => stats.created += 1,
                CreateResult::Deferred => stats.deferred += 1,
                CreateResult::Failed => stats.failed += 1,
                CreateResult::AlreadyLive | CreateResult::Missing => {}
            }
        }

        let visible = wanted_by
            .into_iter()
            .map(|(player, handles)| {
                let live: BTreeSet<Handle> = handles
                    .into_iter()
                    .filter(|h| self.live.contains_key(h))
                    .collect();
                (player, live)
            })
            .collect();

        stats.live = self.live.len();
        stats.duration = started.elapsed();
        tracing::trace!(
            created = stats.created,
            destroyed = stats.destroyed,
            deferred = stats.deferred,
            protected = stats.protected,
            failed = stats.failed,
            live = stats.live,
            "stream pass complete"
        );

        PassOutcome { stats, visible }
    }

    /// Build a grid sized for `settings` holding every outdoor definition.
    /// The streamer itself is left untouched.
    pub fn prepare_grid(
        &self,
        settings: &StreamSettings,
    ) -> Result<SpatialGrid<Handle>, GridError> {
        let stream_distance = settings.class(self.class).stream_distance;
        let mut grid = SpatialGrid::new(settings.world_size, stream_distance)?
            .with_locality(self.grid.locality());
        for (handle, info) in &self.definitions {
            if info.locality == grid.locality() {
                grid.insert(GridRecord::new(*handle, info.position, info.locality))?;
            }
        }
        Ok(grid)
    }

    /// Swap in a grid built by [`Self::prepare_grid`]. Every live entity is
    /// destroyed and pending respawns are dropped; definitions keep their handles.
    pub fn commit_reload<E: EngineBinding>(
        &mut self,
        grid: SpatialGrid<Handle>,
        engine: &mut E,
        bus: &EventBus,
    ) -> usize {
        for (handle, engine_handle) in std::mem::take(&mut self.live) {
            engine.destroy(engine_handle);
            self.despawned(bus, handle, engine_handle, DespawnReason::Reload);
        }
        self.respawns.clear();
        let stream_distance = grid.cell_size();
        self.grid = grid;

        let definitions = self.definitions.len();
        tracing::info!(class = %self.class, definitions, stream_distance, "stream class reloaded");
        bus.emit(StreamEvent::Reloaded {
            class: self.class,
            definitions,
        });
        definitions
    }

    /// Up to `count` definitions closest to `point` in `locality`, nearest first.
    pub fn closest(&self, point: Vec3, locality: Locality, count: usize) -> Vec<NearbyEntity<'_>> {
        let planar = point.truncate();
        let found: Vec<(Handle, f32)> = if locality == self.grid.locality() {
            self.grid
                .closest(planar, count)
                .into_iter()
                .map(|n| (n.id, n.distance_sq))
                .collect()
        } else {
            let mut found = self.scan_locality(locality, planar);
            found.truncate(count);
            found
        };

        found
            .into_iter()
            .filter_map(|(handle, distance_sq)| {
                self.definitions.get(&handle).map(|info| NearbyEntity {
                    handle,
                    info,
                    distance: distance_sq.sqrt(),
                })
            })
            .collect()
    }

    /// Definitions a player should see, nearest first, capped at `per_player`.
    fn candidates_for(&self, player: &StreamingPlayer, per_player: usize) -> Vec<(Handle, f32)> {
        let planar = player.position.truncate();
        let mut found: Vec<(Handle, f32)> = if player.locality == self.grid.locality() {
            self.grid
                .closest(planar, per_player.saturating_add(self.respawns.len()))
                .into_iter()
                .map(|n| (n.id, n.distance_sq))
                .collect()
        } else {
            self.scan_locality(player.locality, planar)
        };

        let radius_sq = self.stream_distance() * self.stream_distance();
        found.retain(|(handle, distance_sq)| {
            *distance_sq <= radius_sq && !self.respawns.is_pending(*handle)
        });
        found.truncate(per_player);
        found
    }

    /// Every definition in a non-grid locality, nearest first.
    fn scan_locality(&self, locality: Locality, point: Vec2) -> Vec<(Handle, f32)> {
        let Some(bucket) = self.localized.get(&locality) else {
            return Vec::new();
        };
        let mut found: Vec<(Handle, f32)> = bucket
            .iter()
            .filter_map(|handle| {
                self.definitions
                    .get(handle)
                    .map(|info| (*handle, info.planar().distance_squared(point)))
            })
            .collect();
        found.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        found
    }

    fn try_create<E: EngineBinding>(
        &mut self,
        handle: Handle,
        engine: &mut E,
        bus: &EventBus,
        global: usize,
    ) -> CreateResult {
        if self.live.contains_key(&handle) {
            return CreateResult::AlreadyLive;
        }
        // Checked at the moment of creation, not when the pass decided on it.
        let Some(info) = self.definitions.get(&handle) else {
            return CreateResult::Missing;
        };
        if self.live.len() >= global {
            return CreateResult::Deferred;
        }

        match engine.spawn(info) {
            Ok(engine_handle) => {
                self.live.insert(handle, engine_handle);
                tracing::debug!(class = %self.class, ?handle, ?engine_handle, "streamed in");
                bus.emit(StreamEvent::EntityStreamed {
                    class: self.class,
                    handle,
                    engine: engine_handle,
                });
                CreateResult::Created
            }
            Err(err) => {
                tracing::warn!(
                    class = %self.class,
                    ?handle,
                    %err,
                    "engine create failed, retrying next pass"
                );
                CreateResult::Failed
            }
        }
    }

    fn despawned(
        &self,
        bus: &EventBus,
        handle: Handle,
        engine: EngineHandle,
        reason: DespawnReason,
    ) {
        bus.emit(StreamEvent::EntityDespawned {
            class: self.class,
            handle,
            engine,
            reason,
        });
    }
}

/// One [`ClassStreamer`] per entity class.
pub(crate) struct ClassSet {
    vehicles: ClassStreamer,
    objects: ClassStreamer,
    pickups: ClassStreamer,
}

impl ClassSet {
    pub fn new(settings: &StreamSettings) -> Result<Self, GridError> {
        let build = |class: EntityClass| {
            ClassStreamer::new(class, settings.world_size, settings.class(class).stream_distance)
        };
        Ok(Self {
            vehicles: build(EntityClass::Vehicle)?,
            objects: build(EntityClass::Object)?,
            pickups: build(EntityClass::Pickup)?,
        })
    }

    pub fn get(&self, class: EntityClass) -> &ClassStreamer {
        match class {
            EntityClass::Vehicle => &self.vehicles,
            EntityClass::Object => &self.objects,
            EntityClass::Pickup => &self.pickups,
        }
    }

    pub fn get_mut(&mut self, class: EntityClass) -> &mut ClassStreamer {
        match class {
            EntityClass::Vehicle => &mut self.vehicles,
            EntityClass::Object => &mut self.objects,
            EntityClass::Pickup => &mut self.pickups,
        }
    }
}
