use std::rc::Rc;

use streamer_common::EntityClass;

use crate::class::Handle;
use crate::engine::EngineHandle;

/// Why a live entity was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DespawnReason {
    /// No player is near enough any more, or it lost out to closer entities.
    OutOfRange,
    /// The definition was unregistered.
    Unregistered,
    /// Reported destroyed in-game (wrecked, picked up).
    Destroyed,
    /// Torn down as part of a reload.
    Reload,
}

/// Notifications about live entity changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    EntityStreamed {
        class: EntityClass,
        handle: Handle,
        engine: EngineHandle,
    },
    EntityDespawned {
        class: EntityClass,
        handle: Handle,
        engine: EngineHandle,
        reason: DespawnReason,
    },
    /// The class was rebuilt; every definition is registered again and none is live.
    Reloaded {
        class: EntityClass,
        definitions: usize,
    },
}

/// Receiver of [`StreamEvent`]s.
pub trait StreamObserver {
    fn on_event(&self, event: &StreamEvent);
}

/// Subscriber list. Each observer is held at most once.
#[derive(Default)]
pub struct EventBus {
    observers: Vec<Rc<dyn StreamObserver>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an observer. Returns `false` if it was already subscribed.
    pub fn subscribe(&mut self, observer: Rc<dyn StreamObserver>) -> bool {
        if self.observers.iter().any(|o| Rc::ptr_eq(o, &observer)) {
            return false;
        }
        self.observers.push(observer);
        true
    }

    /// Remove an observer. Returns whether it was subscribed.
    pub fn unsubscribe(&mut self, observer: &Rc<dyn StreamObserver>) -> bool {
        let before = self.observers.len();
        self.observers.retain(|o| !Rc::ptr_eq(o, observer));
        self.observers.len() != before
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    pub fn emit(&self, event: StreamEvent) {
        tracing::trace!(?event, "stream event");
        for observer in &self.observers {
            observer.on_event(&event);
        }
    }
}
