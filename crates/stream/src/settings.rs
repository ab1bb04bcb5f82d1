//! Live streaming settings.
//!
//! Settings are read from YAML or JSON at startup and can be changed while
//! running through [`SettingsStore::update`]. Ceilings and the default
//! respawn delay take effect on the next read; a new `stream_distance` only
//! takes effect after the coordinator reloads the affected class.

use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use streamer_common::EntityClass;

/// Errors from loading or validating settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported settings format: {0}")]
    UnsupportedFormat(String),
    #[error("invalid settings: {0}")]
    Invalid(String),
}

/// Per entity class streaming parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassSettings {
    /// Radius within which an entity may be live for a player. Also the grid cell size.
    pub stream_distance: f32,
    /// Maximum number of live entities of this class.
    pub global_capacity: usize,
    /// Maximum number of live entities of this class visible to one player.
    pub per_player_capacity: usize,
}

/// Streaming configuration for all entity classes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    /// Side length of the square world, centered on the origin.
    pub world_size: f32,
    pub vehicles: ClassSettings,
    pub objects: ClassSettings,
    pub pickups: ClassSettings,
    /// Respawn delay for definitions using `RespawnPolicy::Default`.
    pub default_respawn_delay_secs: u64,
    /// Minimum time between two periodic streaming passes.
    pub evaluation_interval_ms: u64,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            world_size: 6000.0,
            vehicles: ClassSettings {
                stream_distance: 300.0,
                global_capacity: 1000,
                per_player_capacity: 40,
            },
            objects: ClassSettings {
                stream_distance: 300.0,
                global_capacity: 2000,
                per_player_capacity: 400,
            },
            pickups: ClassSettings {
                stream_distance: 100.0,
                global_capacity: 4096,
                per_player_capacity: 100,
            },
            default_respawn_delay_secs: 180,
            evaluation_interval_ms: 1000,
        }
    }
}

impl StreamSettings {
    /// Load settings from a `.yaml`/`.yml` or `.json` file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let settings: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&text)?,
            Some("json") => serde_json::from_str(&text)?,
            other => {
                return Err(SettingsError::UnsupportedFormat(
                    other.unwrap_or("<none>").to_string(),
                ));
            }
        };
        settings.validate()?;
        tracing::info!(path = %path.display(), "loaded stream settings");
        Ok(settings)
    }

    pub fn class(&self, class: EntityClass) -> &ClassSettings {
        match class {
            EntityClass::Vehicle => &self.vehicles,
            EntityClass::Object => &self.objects,
            EntityClass::Pickup => &self.pickups,
        }
    }

    pub fn default_respawn_delay(&self) -> Duration {
        Duration::from_secs(self.default_respawn_delay_secs)
    }

    pub fn evaluation_interval(&self) -> Duration {
        Duration::from_millis(self.evaluation_interval_ms)
    }

    /// Check that every class can build a grid over the configured world.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if !(self.world_size.is_finite() && self.world_size > 0.0) {
            return Err(SettingsError::Invalid(format!(
                "world_size must be positive, got {}",
                self.world_size
            )));
        }
        for class in EntityClass::ALL {
            let distance = self.class(class).stream_distance;
            if !(distance.is_finite() && distance > 0.0) {
                return Err(SettingsError::Invalid(format!(
                    "{class} stream_distance must be positive, got {distance}"
                )));
            }
            let ratio = f64::from(self.world_size) / f64::from(distance);
            if ratio < 1.0 || (ratio - ratio.round()).abs() > 1e-6 {
                return Err(SettingsError::Invalid(format!(
                    "{class} stream_distance {distance} does not divide world_size {}",
                    self.world_size
                )));
            }
        }
        Ok(())
    }
}

/// Shared handle on the live settings.
///
/// Cloning the store shares the underlying settings; every reader observes
/// updates immediately.
#[derive(Debug, Clone, Default)]
pub struct SettingsStore {
    inner: Rc<RefCell<StreamSettings>>,
}

impl SettingsStore {
    pub fn new(settings: StreamSettings) -> Result<Self, SettingsError> {
        settings.validate()?;
        Ok(Self {
            inner: Rc::new(RefCell::new(settings)),
        })
    }

    /// Current settings.
    pub fn get(&self) -> StreamSettings {
        *self.inner.borrow()
    }

    /// Apply a change. The change is discarded if the result does not validate.
    pub fn update(&self, change: impl FnOnce(&mut StreamSettings)) -> Result<(), SettingsError> {
        let mut next = self.get();
        change(&mut next);
        next.validate()?;
        *self.inner.borrow_mut() = next;
        tracing::debug!("stream settings updated");
        Ok(())
    }
}
