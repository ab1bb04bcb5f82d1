use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::rc::Rc;
use std::time::{Duration, Instant};

use glam::Vec3;
use streamer_common::{EntityClass, Locality, PlayerId, StreamableEntityInfo, StreamingPlayer};
use streamer_grid::{GridError, SpatialGrid};

use crate::budget::{PassStats, PassTimer};
use crate::class::{ClassSet, CreateResult, Handle, NearbyEntity};
use crate::clock::{Clock, SystemClock};
use crate::engine::{EngineBinding, EngineHandle};
use crate::events::{EventBus, StreamObserver};
use crate::settings::{SettingsError, SettingsStore};

/// Errors surfaced to feature code.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("handle {0:?} is not registered")]
    InvalidHandle(Handle),
    #[error(transparent)]
    Grid(#[from] GridError),
    #[error(transparent)]
    Settings(#[from] SettingsError),
}

/// Per-player bookkeeping, kept until the player is removed.
#[derive(Debug, Clone, Default)]
pub struct PlayerStreamState {
    pub position: Vec3,
    pub locality: Locality,
    visible: BTreeMap<EntityClass, BTreeSet<Handle>>,
}

impl PlayerStreamState {
    /// Live entities of `class` streamed for this player in the last pass.
    pub fn visible(&self, class: EntityClass) -> Option<&BTreeSet<Handle>> {
        self.visible.get(&class)
    }

    pub fn visible_count(&self, class: EntityClass) -> usize {
        self.visible.get(&class).map_or(0, BTreeSet::len)
    }
}

/// Result of [`StreamingCoordinator::update`].
#[derive(Debug, Clone, Default)]
pub struct UpdateReport {
    /// Entities recreated by respawn timers.
    pub respawned: usize,
    /// One entry per class if a streaming pass ran, otherwise empty.
    pub passes: Vec<PassStats>,
}

/// Decides which registered definitions are live, for every entity class.
///
/// All mutation goes through `&mut self`, so two passes can never overlap and
/// an unregister can never interleave with a pass that is creating the same
/// entity.
pub struct StreamingCoordinator<E, C = SystemClock> {
    settings: SettingsStore,
    engine: E,
    clock: C,
    classes: ClassSet,
    owners: HashMap<Handle, EntityClass>,
    players: BTreeMap<PlayerId, PlayerStreamState>,
    events: EventBus,
    next_handle: u64,
    last_evaluation: Option<Duration>,
    timer: PassTimer,
}

impl<E: EngineBinding> StreamingCoordinator<E> {
    /// Create a coordinator driven by the system clock.
    pub fn new(settings: SettingsStore, engine: E) -> Result<Self, StreamError> {
        Self::with_clock(settings, engine, SystemClock::new())
    }
}

impl<E: EngineBinding, C: Clock> StreamingCoordinator<E, C> {
    pub fn with_clock(settings: SettingsStore, engine: E, clock: C) -> Result<Self, StreamError> {
        let current = settings.get();
        current.validate()?;
        let classes = ClassSet::new(&current)?;
        Ok(Self {
            settings,
            engine,
            clock,
            classes,
            owners: HashMap::new(),
            players: BTreeMap::new(),
            events: EventBus::new(),
            next_handle: 0,
            last_evaluation: None,
            timer: PassTimer::default(),
        })
    }

    /// Register a definition. With `immediate`, the entity is created right
    /// away regardless of player proximity, capacity permitting.
    pub fn register(
        &mut self,
        info: StreamableEntityInfo,
        immediate: bool,
    ) -> Result<Handle, StreamError> {
        let class = info.class();
        let handle = Handle(self.next_handle);
        let streamer = self.classes.get_mut(class);
        streamer.register(handle, info)?;
        self.next_handle += 1;
        self.owners.insert(handle, class);
        tracing::debug!(%class, ?handle, immediate, "definition registered");

        if immediate {
            match streamer.create_now(handle, &mut self.engine, &self.events) {
                CreateResult::Deferred => {
                    tracing::debug!(
                        %class,
                        ?handle,
                        "immediate creation deferred, ceiling reached"
                    );
                }
                CreateResult::Failed => {
                    tracing::debug!(
                        %class,
                        ?handle,
                        "immediate creation failed, left to streaming"
                    );
                }
                CreateResult::Created | CreateResult::AlreadyLive | CreateResult::Missing => {}
            }
        }
        Ok(handle)
    }

    /// Remove a definition, destroying its live entity and cancelling any pending respawn.
    pub fn unregister(&mut self, handle: Handle) -> Result<(), StreamError> {
        let class = self
            .owners
            .remove(&handle)
            .ok_or(StreamError::InvalidHandle(handle))?;
        self.classes
            .get_mut(class)
            .unregister(handle, &mut self.engine, &self.events);
        for state in self.players.values_mut() {
            if let Some(visible) = state.visible.get_mut(&class) {
                visible.remove(&handle);
            }
        }
        tracing::debug!(%class, ?handle, "definition unregistered");
        Ok(())
    }

    /// Report that a live entity was destroyed in-game. Schedules its respawn
    /// per its policy. Returns `false` if the entity was not live.
    pub fn report_destroyed(&mut self, handle: Handle) -> Result<bool, StreamError> {
        let class = self.class_of(handle)?;
        let now = self.clock.now();
        let default_delay = self.settings.get().default_respawn_delay();
        let destroyed = self.classes.get_mut(class).report_destroyed(
            handle,
            &mut self.engine,
            &self.events,
            now,
            default_delay,
        );
        if destroyed {
            for state in self.players.values_mut() {
                if let Some(visible) = state.visible.get_mut(&class) {
                    visible.remove(&handle);
                }
            }
        }
        Ok(destroyed)
    }

    /// Recreate every definition whose respawn delay has elapsed.
    pub fn fire_respawns(&mut self) -> usize {
        let now = self.clock.now();
        EntityClass::ALL
            .into_iter()
            .map(|class| {
                self.classes
                    .get_mut(class)
                    .fire_respawns(now, &mut self.engine, &self.events)
            })
            .sum()
    }

    /// Run a streaming pass for every class.
    pub fn evaluate(&mut self, players: &[StreamingPlayer]) -> Vec<PassStats> {
        let started = Instant::now();
        let passes: Vec<PassStats> = EntityClass::ALL
            .into_iter()
            .map(|class| self.evaluate_class(class, players))
            .collect();
        self.timer.record(started.elapsed(), &passes);
        self.last_evaluation = Some(self.clock.now());
        passes
    }

    /// Run a streaming pass for one class.
    pub fn evaluate_class(&mut self, class: EntityClass, players: &[StreamingPlayer]) -> PassStats {
        let outcome = self
            .classes
            .get_mut(class)
            .evaluate(players, &mut self.engine, &self.events);

        for player in players {
            let state = self.players.entry(player.id).or_default();
            state.position = player.position;
            state.locality = player.locality;
        }
        for (id, state) in self.players.iter_mut() {
            let visible = outcome.visible.get(id).cloned().unwrap_or_default();
            state.visible.insert(class, visible);
        }
        outcome.stats
    }

    /// Fire due respawns, then run a streaming pass if the evaluation interval has elapsed.
    pub fn update(&mut self, players: &[StreamingPlayer]) -> UpdateReport {
        let respawned = self.fire_respawns();
        let now = self.clock.now();
        let interval = self.settings.get().evaluation_interval();
        let due = match self.last_evaluation {
            Some(last) => now.saturating_sub(last) >= interval,
            None => true,
        };
        let passes = if due { self.evaluate(players) } else { Vec::new() };
        UpdateReport { respawned, passes }
    }

    /// Rebuild one class from the current settings. Every definition stays
    /// registered under the same handle; all live entities are destroyed and
    /// come back through subsequent passes. On error nothing changes.
    pub fn reload(&mut self, class: EntityClass) -> Result<usize, StreamError> {
        let settings = self.settings.get();
        settings.validate()?;
        let grid = self.classes.get(class).prepare_grid(&settings)?;
        Ok(self.commit_reload(class, grid))
    }

    /// Rebuild every class. All new grids are built before any class is torn
    /// down, so either every class is reloaded or none is.
    pub fn reload_all(&mut self) -> Result<usize, StreamError> {
        let settings = self.settings.get();
        settings.validate()?;
        let mut grids = Vec::with_capacity(EntityClass::ALL.len());
        for class in EntityClass::ALL {
            grids.push((class, self.classes.get(class).prepare_grid(&settings)?));
        }
        Ok(grids
            .into_iter()
            .map(|(class, grid)| self.commit_reload(class, grid))
            .sum())
    }

    /// Forget a disconnected player.
    pub fn remove_player(&mut self, id: PlayerId) -> bool {
        self.players.remove(&id).is_some()
    }

    pub fn player(&self, id: PlayerId) -> Option<&PlayerStreamState> {
        self.players.get(&id)
    }

    /// Live entities of `class` streamed for `player` in the last pass.
    pub fn visible_to(&self, player: PlayerId, class: EntityClass) -> Option<&BTreeSet<Handle>> {
        self.players.get(&player).and_then(|s| s.visible(class))
    }

    /// Up to `count` registered definitions of `class` nearest to `point`,
    /// whether live or not.
    pub fn closest(
        &self,
        class: EntityClass,
        point: Vec3,
        locality: Locality,
        count: usize,
    ) -> Vec<NearbyEntity<'_>> {
        self.classes.get(class).closest(point, locality, count)
    }

    pub fn definition(&self, handle: Handle) -> Option<&StreamableEntityInfo> {
        let class = self.owners.get(&handle)?;
        self.classes.get(*class).definition(handle)
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.owners.contains_key(&handle)
    }

    pub fn is_live(&self, handle: Handle) -> bool {
        self.engine_handle(handle).is_some()
    }

    pub fn engine_handle(&self, handle: Handle) -> Option<EngineHandle> {
        let class = self.owners.get(&handle)?;
        self.classes.get(*class).engine_handle(handle)
    }

    /// When the pending respawn for `handle` fires, if any.
    pub fn respawn_time(&self, handle: Handle) -> Option<Duration> {
        let class = self.owners.get(&handle)?;
        self.classes.get(*class).respawn_time(handle)
    }

    pub fn live_count(&self, class: EntityClass) -> usize {
        self.classes.get(class).live_count()
    }

    pub fn definition_count(&self, class: EntityClass) -> usize {
        self.classes.get(class).definition_count()
    }

    pub fn grid(&self, class: EntityClass) -> &SpatialGrid<Handle> {
        self.classes.get(class).grid()
    }

    /// Add an event observer. Subscribing the same observer twice has no effect.
    pub fn subscribe(&mut self, observer: Rc<dyn StreamObserver>) -> bool {
        self.events.subscribe(observer)
    }

    pub fn unsubscribe(&mut self, observer: &Rc<dyn StreamObserver>) -> bool {
        self.events.unsubscribe(observer)
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Durations of recent full passes.
    pub fn pass_timer(&self) -> &PassTimer {
        &self.timer
    }

    fn commit_reload(&mut self, class: EntityClass, grid: SpatialGrid<Handle>) -> usize {
        let definitions = self
            .classes
            .get_mut(class)
            .commit_reload(grid, &mut self.engine, &self.events);
        for state in self.players.values_mut() {
            state.visible.remove(&class);
        }
        definitions
    }

    fn class_of(&self, handle: Handle) -> Result<EntityClass, StreamError> {
        self.owners
            .get(&handle)
            .copied()
            .ok_or(StreamError::InvalidHandle(handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::engine::SimulatedEngine;
    use crate::events::tests::Recorder;
    use crate::events::{DespawnReason, StreamEvent};
    use crate::settings::{ClassSettings, StreamSettings};
    use proptest::prelude::*;
    use streamer_common::RespawnPolicy;

    type TestCoordinator = StreamingCoordinator<SimulatedEngine, ManualClock>;

    fn settings(global: usize, per_player: usize) -> SettingsStore {
        let class = |stream_distance| ClassSettings {
            stream_distance,
            global_capacity: global,
            per_player_capacity: per_player,
        };
        SettingsStore::new(StreamSettings {
            world_size: 1000.0,
            vehicles: class(100.0),
            objects: class(100.0),
            pickups: class(50.0),
            default_respawn_delay_secs: 30,
            evaluation_interval_ms: 1000,
        })
        .unwrap()
    }

    fn coordinator(global: usize, per_player: usize) -> (TestCoordinator, ManualClock) {
        let settings = settings(global, per_player);
        let clock = ManualClock::new();
        let engine = SimulatedEngine::new(settings.clone());
        let coordinator =
            StreamingCoordinator::with_clock(settings, engine, clock.clone()).unwrap();
        (coordinator, clock)
    }

    fn player(id: u32, x: f32, y: f32) -> StreamingPlayer {
        StreamingPlayer::outdoors(PlayerId(id), Vec3::new(x, y, 0.0))
    }

    fn vehicle(x: f32, y: f32) -> StreamableEntityInfo {
        StreamableEntityInfo::vehicle(411, Vec3::new(x, y, 0.0))
    }

    fn vehicle_pass(coordinator: &mut TestCoordinator, players: &[StreamingPlayer]) -> PassStats {
        coordinator.evaluate_class(EntityClass::Vehicle, players)
    }

    #[test]
    fn register_stores_definition_in_grid() {
        let (mut c, _) = coordinator(10, 10);
        let handle = c.register(vehicle(10.0, 20.0), false).unwrap();
        assert!(c.contains(handle));
        assert!(!c.is_live(handle));
        assert_eq!(c.grid(EntityClass::Vehicle).len(), 1);
        assert_eq!(c.definition(handle).unwrap().position, Vec3::new(10.0, 20.0, 0.0));
        assert_eq!(c.definition_count(EntityClass::Object), 0);
    }

    #[test]
    fn out_of_bounds_registration_is_rejected() {
        let (mut c, _) = coordinator(10, 10);
        let err = c.register(vehicle(500.0, 0.0), false).unwrap_err();
        assert!(matches!(err, StreamError::Grid(GridError::OutOfBounds { .. })));
        assert_eq!(c.definition_count(EntityClass::Vehicle), 0);
    }

    #[test]
    fn evaluate_streams_in_nearby_entities_only() {
        let (mut c, _) = coordinator(10, 10);
        let near = c.register(vehicle(10.0, 0.0), false).unwrap();
        let edge = c.register(vehicle(90.0, 0.0), false).unwrap();
        let far = c.register(vehicle(150.0, 0.0), false).unwrap();

        let stats = vehicle_pass(&mut c, &[player(1, 0.0, 0.0)]);
        assert_eq!(stats.created, 2);
        assert!(c.is_live(near));
        assert!(c.is_live(edge));
        assert!(!c.is_live(far));
        assert_eq!(c.engine().live_count(EntityClass::Vehicle), 2);
    }

    #[test]
    fn evaluate_streams_out_when_players_leave() {
        let (mut c, _) = coordinator(10, 10);
        let handle = c.register(vehicle(10.0, 0.0), false).unwrap();
        vehicle_pass(&mut c, &[player(1, 0.0, 0.0)]);
        assert!(c.is_live(handle));

        let stats = vehicle_pass(&mut c, &[player(1, 400.0, 400.0)]);
        assert_eq!(stats.destroyed, 1);
        assert!(!c.is_live(handle));
        assert_eq!(c.engine().total_live(), 0);
    }

    #[test]
    fn global_ceiling_prefers_nearest() {
        let (mut c, _) = coordinator(2, 10);
        let handles: Vec<Handle> = [10.0, 20.0, 30.0, 40.0]
            .into_iter()
            .map(|x| c.register(vehicle(x, 0.0), false).unwrap())
            .collect();

        let stats = vehicle_pass(&mut c, &[player(1, 0.0, 0.0)]);
        assert_eq!(stats.created, 2);
        assert_eq!(stats.deferred, 2);
        assert_eq!(stats.live, 2);
        assert!(c.is_live(handles[0]));
        assert!(c.is_live(handles[1]));
        assert!(!c.is_live(handles[2]));
    }

    #[test]
    fn global_ceiling_ranks_across_players() {
        let (mut c, _) = coordinator(3, 10);
        let a_near = c.register(vehicle(5.0, 0.0), false).unwrap();
        let a_far = c.register(vehicle(50.0, 0.0), false).unwrap();
        let b_near = c.register(vehicle(302.0, 0.0), false).unwrap();
        let b_mid = c.register(vehicle(340.0, 0.0), false).unwrap();

        vehicle_pass(&mut c, &[player(1, 0.0, 0.0), player(2, 300.0, 0.0)]);
        assert!(c.is_live(a_near));
        assert!(c.is_live(b_near));
        assert!(c.is_live(b_mid));
        assert!(!c.is_live(a_far));
    }

    #[test]
    fn per_player_ceiling_limits_visibility() {
        let (mut c, _) = coordinator(10, 2);
        for x in [10.0, 20.0, 30.0, 40.0] {
            c.register(vehicle(x, 0.0), false).unwrap();
        }
        vehicle_pass(&mut c, &[player(1, 0.0, 0.0)]);
        assert_eq!(c.visible_to(PlayerId(1), EntityClass::Vehicle).unwrap().len(), 2);
        assert_eq!(c.live_count(EntityClass::Vehicle), 2);
    }

    #[test]
    fn occupied_entities_are_never_streamed_out() {
        let (mut c, _) = coordinator(5, 5);
        let handle = c.register(vehicle(10.0, 0.0), false).unwrap();
        vehicle_pass(&mut c, &[player(1, 0.0, 0.0)]);
        let engine_handle = c.engine_handle(handle).unwrap();
        c.engine_mut().set_occupants(engine_handle, 1);

        let stats = vehicle_pass(&mut c, &[player(1, 400.0, 400.0)]);
        assert_eq!(stats.protected, 1);
        assert_eq!(stats.destroyed, 0);
        assert!(c.is_live(handle));

        c.engine_mut().set_occupants(engine_handle, 0);
        let stats = vehicle_pass(&mut c, &[player(1, 400.0, 400.0)]);
        assert_eq!(stats.destroyed, 1);
        assert!(!c.is_live(handle));
    }

    #[test]
    fn immediate_registration_creates_without_players() {
        let (mut c, _) = coordinator(5, 5);
        let recorder = Rc::new(Recorder::default());
        c.subscribe(recorder.clone());

        let handle = c.register(vehicle(10.0, 0.0), true).unwrap();
        assert!(c.is_live(handle));
        let engine = c.engine_handle(handle).unwrap();
        assert_eq!(
            recorder.events.borrow().as_slice(),
            &[StreamEvent::EntityStreamed {
                class: EntityClass::Vehicle,
                handle,
                engine,
            }]
        );

        // Nobody is near, so the next pass streams it out.
        vehicle_pass(&mut c, &[]);
        assert!(!c.is_live(handle));
    }

    #[test]
    fn immediate_registration_respects_global_ceiling() {
        let (mut c, _) = coordinator(1, 5);
        let first = c.register(vehicle(10.0, 0.0), true).unwrap();
        let second = c.register(vehicle(20.0, 0.0), true).unwrap();
        assert!(c.is_live(first));
        assert!(!c.is_live(second));
        assert!(c.contains(second));
    }

    #[test]
    fn unregister_destroys_live_entity() {
        let (mut c, _) = coordinator(5, 5);
        let recorder = Rc::new(Recorder::default());
        c.subscribe(recorder.clone());
        let handle = c.register(vehicle(10.0, 0.0), false).unwrap();
        vehicle_pass(&mut c, &[player(1, 0.0, 0.0)]);
        let engine = c.engine_handle(handle).unwrap();

        c.unregister(handle).unwrap();
        assert!(!c.contains(handle));
        assert!(!c.engine().is_live(engine));
        assert!(c.grid(EntityClass::Vehicle).is_empty());
        assert!(c.visible_to(PlayerId(1), EntityClass::Vehicle).unwrap().is_empty());
        assert_eq!(
            recorder.events.borrow().last(),
            Some(&StreamEvent::EntityDespawned {
                class: EntityClass::Vehicle,
                handle,
                engine,
                reason: DespawnReason::Unregistered,
            })
        );
    }

    #[test]
    fn stale_handles_are_rejected() {
        let (mut c, _) = coordinator(5, 5);
        let handle = c.register(vehicle(10.0, 0.0), false).unwrap();
        c.unregister(handle).unwrap();
        assert!(matches!(c.unregister(handle), Err(StreamError::InvalidHandle(h)) if h == handle));
        assert!(matches!(c.report_destroyed(handle), Err(StreamError::InvalidHandle(_))));
    }

    #[test]
    fn destroyed_entity_respawns_once_after_delay() {
        let (mut c, clock) = coordinator(5, 5);
        let info = vehicle(10.0, 0.0).with_respawn(RespawnPolicy::After(Duration::from_secs(15)));
        let handle = c.register(info, false).unwrap();
        let near = [player(1, 0.0, 0.0)];
        vehicle_pass(&mut c, &near);

        assert!(c.report_destroyed(handle).unwrap());
        assert!(!c.is_live(handle));
        assert_eq!(c.respawn_time(handle), Some(Duration::from_secs(15)));

        // Streaming does not bring it back while the timer is pending.
        vehicle_pass(&mut c, &near);
        assert!(!c.is_live(handle));

        clock.advance(Duration::from_secs(14));
        assert_eq!(c.fire_respawns(), 0);
        clock.advance(Duration::from_secs(1));
        assert_eq!(c.fire_respawns(), 1);
        assert!(c.is_live(handle));
        assert_eq!(c.fire_respawns(), 0);
        assert_eq!(c.engine().spawned_total(), 2);
    }

    #[test]
    fn respawn_ignores_proximity() {
        let (mut c, clock) = coordinator(5, 5);
        let info = vehicle(10.0, 0.0).with_respawn(RespawnPolicy::After(Duration::from_secs(1)));
        let handle = c.register(info.clone(), true).unwrap();
        c.report_destroyed(handle).unwrap();
        clock.advance(Duration::from_secs(1));
        assert_eq!(c.fire_respawns(), 1);
        let engine = c.engine_handle(handle).unwrap();
        assert_eq!(c.engine().entity(engine).unwrap().info.position, info.position);
    }

    #[test]
    fn unregister_cancels_pending_respawn() {
        let (mut c, clock) = coordinator(5, 5);
        let info = vehicle(10.0, 0.0).with_respawn(RespawnPolicy::After(Duration::from_secs(15)));
        let handle = c.register(info, true).unwrap();
        c.report_destroyed(handle).unwrap();
        c.unregister(handle).unwrap();

        clock.advance(Duration::from_secs(60));
        assert_eq!(c.fire_respawns(), 0);
        assert_eq!(c.engine().spawned_total(), 1);
    }

    #[test]
    fn never_policy_does_not_schedule() {
        let (mut c, _) = coordinator(5, 5);
        let info = vehicle(10.0, 0.0).with_respawn(RespawnPolicy::from_secs(-1));
        let handle = c.register(info, false).unwrap();
        let near = [player(1, 0.0, 0.0)];
        vehicle_pass(&mut c, &near);

        c.report_destroyed(handle).unwrap();
        assert_eq!(c.respawn_time(handle), None);
        // An ordinary candidate again on the next pass.
        vehicle_pass(&mut c, &near);
        assert!(c.is_live(handle));
    }

    #[test]
    fn default_policy_uses_settings_delay() {
        let (mut c, clock) = coordinator(5, 5);
        clock.set(Duration::from_secs(100));
        let handle = c.register(vehicle(10.0, 0.0), true).unwrap();
        c.report_destroyed(handle).unwrap();
        assert_eq!(c.respawn_time(handle), Some(Duration::from_secs(130)));
    }

    #[test]
    fn report_destroyed_on_dormant_entity_is_noop() {
        let (mut c, _) = coordinator(5, 5);
        let handle = c.register(vehicle(10.0, 0.0), false).unwrap();
        assert!(!c.report_destroyed(handle).unwrap());
        assert_eq!(c.respawn_time(handle), None);
    }

    #[test]
    fn respawn_at_full_ceiling_falls_back_to_streaming() {
        let (mut c, clock) = coordinator(1, 5);
        let first = c
            .register(
                vehicle(10.0, 0.0).with_respawn(RespawnPolicy::After(Duration::from_secs(5))),
                false,
            )
            .unwrap();
        let second = c.register(vehicle(20.0, 0.0), false).unwrap();
        let near = [player(1, 0.0, 0.0)];

        vehicle_pass(&mut c, &near);
        assert!(c.is_live(first));
        c.report_destroyed(first).unwrap();
        vehicle_pass(&mut c, &near);
        assert!(c.is_live(second));

        clock.advance(Duration::from_secs(5));
        assert_eq!(c.fire_respawns(), 0);
        assert_eq!(c.live_count(EntityClass::Vehicle), 1);

        vehicle_pass(&mut c, &near);
        assert!(c.is_live(first));
        assert!(!c.is_live(second));
    }

    #[test]
    fn engine_failures_are_retried_next_pass() {
        let (mut c, _) = coordinator(5, 5);
        let handle = c.register(vehicle(10.0, 0.0), false).unwrap();
        c.engine_mut().fail_next_spawns(1);
        let near = [player(1, 0.0, 0.0)];

        let stats = vehicle_pass(&mut c, &near);
        assert_eq!(stats.failed, 1);
        assert!(!c.is_live(handle));

        let stats = vehicle_pass(&mut c, &near);
        assert_eq!(stats.created, 1);
        assert!(c.is_live(handle));
    }

    #[test]
    fn reload_rebuilds_grid_and_keeps_definitions() {
        let (mut c, _) = coordinator(10, 10);
        let recorder = Rc::new(Recorder::default());
        c.subscribe(recorder.clone());
        let handles: Vec<Handle> = [10.0, 20.0, 300.0]
            .into_iter()
            .map(|x| c.register(vehicle(x, 0.0), false).unwrap())
            .collect();
        let indoor = c
            .register(vehicle(0.0, 0.0).with_locality(Locality::new(1, 0)), false)
            .unwrap();
        vehicle_pass(&mut c, &[player(1, 0.0, 0.0)]);
        assert_eq!(c.live_count(EntityClass::Vehicle), 2);

        c.settings().update(|s| s.vehicles.stream_distance = 200.0).unwrap();
        assert_eq!(c.reload(EntityClass::Vehicle).unwrap(), 4);

        let grid = c.grid(EntityClass::Vehicle);
        assert_eq!(grid.cell_size(), 200.0);
        assert_eq!(grid.width(), 5);
        assert_eq!(grid.len(), 3);
        for (handle, x) in handles.iter().zip([10.0, 20.0, 300.0]) {
            assert_eq!(grid.position(*handle), Some(Vec3::new(x, 0.0, 0.0)));
            assert!(c.contains(*handle));
        }
        assert!(c.contains(indoor));
        assert_eq!(c.live_count(EntityClass::Vehicle), 0);
        assert_eq!(c.engine().total_live(), 0);
        assert_eq!(
            recorder.events.borrow().last(),
            Some(&StreamEvent::Reloaded {
                class: EntityClass::Vehicle,
                definitions: 4,
            })
        );

        // The wider stream distance now reaches the third vehicle.
        vehicle_pass(&mut c, &[player(1, 150.0, 0.0)]);
        assert_eq!(c.live_count(EntityClass::Vehicle), 3);
    }

    fn car_and_distant_object(c: &mut TestCoordinator) -> (Handle, Handle) {
        let car = c.register(vehicle(10.0, 0.0), false).unwrap();
        let object = StreamableEntityInfo::object(1337, Vec3::new(350.0, 0.0, 0.0));
        let object = c.register(object, false).unwrap();
        vehicle_pass(c, &[player(1, 0.0, 0.0)]);
        (car, object)
    }

    #[test]
    fn failed_reload_all_leaves_every_class_untouched() {
        let (mut c, _) = coordinator(5, 5);
        let (car, object) = car_and_distant_object(&mut c);
        let engine = c.engine_handle(car).unwrap();
        let recorder = Rc::new(Recorder::default());
        c.subscribe(recorder.clone());

        // The object no longer fits once the world shrinks.
        c.settings().update(|s| s.world_size = 600.0).unwrap();
        let err = c.reload_all().unwrap_err();
        assert!(matches!(err, StreamError::Grid(GridError::OutOfBounds { .. })));

        assert_eq!(c.engine_handle(car), Some(engine));
        assert!(c.engine().is_live(engine));
        assert_eq!(c.grid(EntityClass::Vehicle).width(), 10);
        assert_eq!(c.grid(EntityClass::Object).width(), 10);
        assert!(c.grid(EntityClass::Object).contains(object));
        assert_eq!(c.player(PlayerId(1)).unwrap().visible_count(EntityClass::Vehicle), 1);
        assert!(recorder.events.borrow().is_empty());
    }

    #[test]
    fn failed_class_reload_leaves_it_streaming() {
        let (mut c, _) = coordinator(5, 5);
        let (car, object) = car_and_distant_object(&mut c);
        c.settings().update(|s| s.world_size = 600.0).unwrap();

        assert!(c.reload(EntityClass::Object).is_err());
        assert_eq!(c.grid(EntityClass::Object).width(), 10);
        assert!(c.grid(EntityClass::Object).contains(object));
        assert!(c.is_live(car));

        // Vehicles fit the smaller world on their own.
        assert_eq!(c.reload(EntityClass::Vehicle).unwrap(), 1);
        assert_eq!(c.grid(EntityClass::Vehicle).width(), 6);
        assert!(!c.is_live(car));
    }

    #[test]
    fn unbounded_per_player_ceiling_with_pending_respawn() {
        let (mut c, _) = coordinator(5, usize::MAX);
        let info = vehicle(10.0, 0.0).with_respawn(RespawnPolicy::After(Duration::from_secs(30)));
        let wrecked = c.register(info, true).unwrap();
        let other = c.register(vehicle(20.0, 0.0), false).unwrap();
        c.report_destroyed(wrecked).unwrap();

        let stats = vehicle_pass(&mut c, &[player(1, 0.0, 0.0)]);
        assert_eq!(stats.created, 1);
        assert!(c.is_live(other));
        assert!(!c.is_live(wrecked));
    }

    #[test]
    fn engine_receives_definition_unchanged() {
        let (mut c, _) = coordinator(5, 5);
        let info = vehicle(10.0, 0.0).with_rotation(270.0);
        let handle = c.register(info.clone(), true).unwrap();
        let engine = c.engine_handle(handle).unwrap();
        assert_eq!(c.engine().entity(engine).unwrap().info, info);
    }

    #[test]
    fn reload_cancels_pending_respawns() {
        let (mut c, clock) = coordinator(5, 5);
        let info = vehicle(10.0, 0.0).with_respawn(RespawnPolicy::After(Duration::from_secs(5)));
        let handle = c.register(info, true).unwrap();
        c.report_destroyed(handle).unwrap();

        c.reload_all().unwrap();
        assert_eq!(c.respawn_time(handle), None);
        clock.advance(Duration::from_secs(5));
        assert_eq!(c.fire_respawns(), 0);
        vehicle_pass(&mut c, &[player(1, 0.0, 0.0)]);
        assert!(c.is_live(handle));
    }

    #[test]
    fn interior_definitions_stream_only_for_same_locality() {
        let (mut c, _) = coordinator(5, 5);
        let interior = Locality::new(3, 0);
        let handle = c
            .register(vehicle(10.0, 0.0).with_locality(interior), false)
            .unwrap();
        assert!(c.grid(EntityClass::Vehicle).is_empty());

        vehicle_pass(&mut c, &[player(1, 0.0, 0.0)]);
        assert!(!c.is_live(handle));

        let inside = StreamingPlayer {
            locality: interior,
            ..player(1, 0.0, 0.0)
        };
        vehicle_pass(&mut c, &[inside]);
        assert!(c.is_live(handle));

        let nearby = c.closest(EntityClass::Vehicle, Vec3::ZERO, interior, 5);
        assert_eq!(nearby.len(), 1);
        assert_eq!(nearby[0].handle, handle);
        assert_eq!(nearby[0].distance, 10.0);

        c.unregister(handle).unwrap();
        assert!(c.closest(EntityClass::Vehicle, Vec3::ZERO, interior, 5).is_empty());
    }

    #[test]
    fn closest_query_ignores_liveness() {
        let (mut c, _) = coordinator(5, 5);
        let a = c.register(vehicle(30.0, 40.0), false).unwrap();
        let b = c.register(vehicle(3.0, 4.0), false).unwrap();
        let nearby = c.closest(EntityClass::Vehicle, Vec3::ZERO, Locality::OUTDOORS, 10);
        let handles: Vec<Handle> = nearby.iter().map(|n| n.handle).collect();
        assert_eq!(handles, vec![b, a]);
        assert_eq!(nearby[0].distance, 5.0);
        assert_eq!(nearby[1].distance, 50.0);
    }

    #[test]
    fn classes_are_streamed_independently() {
        let (mut c, _) = coordinator(5, 5);
        let car = c.register(vehicle(10.0, 0.0), false).unwrap();
        let pickup = c
            .register(StreamableEntityInfo::pickup(1242, 2, Vec3::new(60.0, 0.0, 0.0)), false)
            .unwrap();
        let object = c
            .register(StreamableEntityInfo::object(1337, Vec3::new(20.0, 0.0, 0.0)), false)
            .unwrap();

        let passes = c.evaluate(&[player(1, 0.0, 0.0)]);
        assert_eq!(passes.len(), 3);
        assert!(c.is_live(car));
        assert!(c.is_live(object));
        // Pickups stream within 50 units only.
        assert!(!c.is_live(pickup));
        assert_eq!(c.pass_timer().count(), 1);
        assert!(c.pass_timer().slowest_class().is_some());
    }

    #[test]
    fn players_are_tracked_until_removed() {
        let (mut c, _) = coordinator(5, 5);
        c.register(vehicle(10.0, 0.0), false).unwrap();
        c.evaluate(&[player(7, 1.0, 2.0)]);

        let state = c.player(PlayerId(7)).unwrap();
        assert_eq!(state.position, Vec3::new(1.0, 2.0, 0.0));
        assert_eq!(state.visible_count(EntityClass::Vehicle), 1);

        assert!(c.remove_player(PlayerId(7)));
        assert!(!c.remove_player(PlayerId(7)));
        assert!(c.player(PlayerId(7)).is_none());
    }

    #[test]
    fn update_honours_evaluation_interval() {
        let (mut c, clock) = coordinator(5, 5);
        let players = [player(1, 0.0, 0.0)];
        assert_eq!(c.update(&players).passes.len(), 3);
        assert!(c.update(&players).passes.is_empty());
        clock.advance(Duration::from_millis(999));
        assert!(c.update(&players).passes.is_empty());
        clock.advance(Duration::from_millis(1));
        assert_eq!(c.update(&players).passes.len(), 3);
    }

    #[test]
    fn update_fires_due_respawns() {
        let (mut c, clock) = coordinator(5, 5);
        let info = vehicle(10.0, 0.0).with_respawn(RespawnPolicy::After(Duration::from_secs(2)));
        let handle = c.register(info, true).unwrap();
        c.report_destroyed(handle).unwrap();
        clock.advance(Duration::from_secs(2));
        assert_eq!(c.update(&[]).respawned, 1);
    }

    #[test]
    fn lowered_ceiling_applies_on_next_pass() {
        let (mut c, _) = coordinator(5, 5);
        for x in [10.0, 20.0, 30.0] {
            c.register(vehicle(x, 0.0), false).unwrap();
        }
        let near = [player(1, 0.0, 0.0)];
        vehicle_pass(&mut c, &near);
        assert_eq!(c.live_count(EntityClass::Vehicle), 3);

        c.settings().update(|s| s.vehicles.global_capacity = 1).unwrap();
        let stats = vehicle_pass(&mut c, &near);
        assert_eq!(stats.destroyed, 2);
        assert_eq!(c.live_count(EntityClass::Vehicle), 1);
    }

    proptest! {
        #[test]
        fn ceilings_are_never_exceeded(
            vehicles in proptest::collection::vec((-490.0f32..490.0, -490.0f32..490.0), 0..80),
            walks in proptest::collection::vec(
                proptest::collection::vec((-490.0f32..490.0, -490.0f32..490.0), 1..6),
                1..4,
            ),
            global in 0usize..20,
            per_player in 0usize..10,
        ) {
            let (mut c, _) = coordinator(global, per_player);
            for (x, y) in &vehicles {
                c.register(vehicle(*x, *y), false).unwrap();
            }
            for positions in &walks {
                let players: Vec<StreamingPlayer> = positions
                    .iter()
                    .enumerate()
                    .map(|(i, (x, y))| player(i as u32, *x, *y))
                    .collect();
                let stats = vehicle_pass(&mut c, &players);
                prop_assert!(stats.live <= global);
                prop_assert_eq!(c.engine().live_count(EntityClass::Vehicle), stats.live);
                for p in &players {
                    let visible = c.visible_to(p.id, EntityClass::Vehicle).map_or(0, BTreeSet::len);
                    prop_assert!(visible <= per_player);
                }
            }
        }
    }
}
