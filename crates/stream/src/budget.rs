use std::collections::VecDeque;
use std::time::Duration;

use streamer_common::EntityClass;

/// Outcome of one streaming pass over one entity class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassStats {
    pub class: EntityClass,
    /// Entities materialized this pass.
    pub created: usize,
    /// Entities torn down this pass.
    pub destroyed: usize,
    /// Wanted entities left unmaterialized because the global ceiling was reached.
    pub deferred: usize,
    /// Out-of-range entities kept because they are occupied.
    pub protected: usize,
    /// Creations the engine refused; retried next pass.
    pub failed: usize,
    /// Live entities after the pass.
    pub live: usize,
    pub duration: Duration,
}

impl PassStats {
    pub fn new(class: EntityClass) -> Self {
        Self {
            class,
            created: 0,
            destroyed: 0,
            deferred: 0,
            protected: 0,
            failed: 0,
            live: 0,
            duration: Duration::ZERO,
        }
    }
}

/// Durations of one full pass, in total and per class.
#[derive(Debug, Clone, Copy, Default)]
struct PassSample {
    total: Duration,
    per_class: [Duration; 3],
}

fn class_slot(class: EntityClass) -> usize {
    match class {
        EntityClass::Vehicle => 0,
        EntityClass::Object => 1,
        EntityClass::Pickup => 2,
    }
}

/// Bounded history of recent full passes. The oldest sample is dropped once
/// `capacity` passes have been recorded.
#[derive(Debug)]
pub struct PassTimer {
    samples: VecDeque<PassSample>,
    capacity: usize,
}

impl PassTimer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record one full pass, splitting its time by the classes in `passes`.
    pub fn record(&mut self, total: Duration, passes: &[PassStats]) {
        let mut sample = PassSample {
            total,
            ..PassSample::default()
        };
        for stats in passes {
            sample.per_class[class_slot(stats.class)] += stats.duration;
        }
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn count(&self) -> usize {
        self.samples.len()
    }

    pub fn average(&self) -> Duration {
        self.mean(|s| s.total)
    }

    pub fn max(&self) -> Duration {
        self.samples.iter().map(|s| s.total).max().unwrap_or(Duration::ZERO)
    }

    pub fn min(&self) -> Duration {
        self.samples.iter().map(|s| s.total).min().unwrap_or(Duration::ZERO)
    }

    /// Mean time spent on `class` per recorded pass.
    pub fn class_average(&self, class: EntityClass) -> Duration {
        let slot = class_slot(class);
        self.mean(|s| s.per_class[slot])
    }

    pub fn class_max(&self, class: EntityClass) -> Duration {
        let slot = class_slot(class);
        self.samples
            .iter()
            .map(|s| s.per_class[slot])
            .max()
            .unwrap_or(Duration::ZERO)
    }

    /// The class with the highest mean pass time, once anything is recorded.
    pub fn slowest_class(&self) -> Option<EntityClass> {
        if self.samples.is_empty() {
            return None;
        }
        EntityClass::ALL
            .into_iter()
            .max_by_key(|class| self.class_average(*class))
    }

    fn mean(&self, pick: impl Fn(&PassSample) -> Duration) -> Duration {
        if self.samples.is_empty() {
            return Duration::ZERO;
        }
        self.samples.iter().map(pick).sum::<Duration>() / self.samples.len() as u32
    }
}

impl Default for PassTimer {
    fn default() -> Self {
        Self::new(64)
    }
}
