use std::fmt;
use std::time::Duration;

use glam::{Vec2, Vec3};
use serde::{Deserialize, Serialize};

/// Category of streamable object. Each class has its own grid, ceilings and live set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityClass {
    Vehicle,
    Object,
    Pickup,
}

impl EntityClass {
    pub const ALL: [EntityClass; 3] = [Self::Vehicle, Self::Object, Self::Pickup];

    pub fn name(self) -> &'static str {
        match self {
            Self::Vehicle => "vehicle",
            Self::Object => "object",
            Self::Pickup => "pickup",
        }
    }
}

impl fmt::Display for EntityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Interior / virtual world partition. Entities are only compared against
/// players sharing the same locality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Locality {
    pub interior: u32,
    pub virtual_world: u32,
}

impl Locality {
    /// The default outdoor partition, the only one served by spatial grids.
    pub const OUTDOORS: Locality = Locality {
        interior: 0,
        virtual_world: 0,
    };

    pub fn new(interior: u32, virtual_world: u32) -> Self {
        Self {
            interior,
            virtual_world,
        }
    }

    pub fn is_outdoors(self) -> bool {
        self == Self::OUTDOORS
    }
}

/// Identifier of a connected player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlayerId(pub u32);

/// Snapshot of a player taken at the start of a streaming pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StreamingPlayer {
    pub id: PlayerId,
    pub position: Vec3,
    #[serde(default)]
    pub locality: Locality,
}

impl StreamingPlayer {
    pub fn outdoors(id: PlayerId, position: Vec3) -> Self {
        Self {
            id,
            position,
            locality: Locality::OUTDOORS,
        }
    }
}

/// What happens after a live entity is destroyed in-game.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RespawnPolicy {
    /// Never recreated automatically. Equivalent to a respawn delay of -1.
    Never,
    /// Recreated after the settings store's default respawn delay.
    #[default]
    Default,
    /// Recreated after the given delay.
    After(Duration),
}

impl RespawnPolicy {
    /// Build a policy from a delay in seconds where `-1` means "never".
    pub fn from_secs(delay: i64) -> Self {
        if delay < 0 {
            Self::Never
        } else {
            Self::After(Duration::from_secs(delay as u64))
        }
    }

    /// Resolve the concrete delay, given the configured default.
    pub fn delay(self, default: Duration) -> Option<Duration> {
        match self {
            Self::Never => None,
            Self::Default => Some(default),
            Self::After(d) => Some(d),
        }
    }
}

/// Class-specific data carried through the streamer untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntityPayload {
    Vehicle {
        model: u16,
        primary_color: u8,
        secondary_color: u8,
        #[serde(default)]
        paintjob: Option<u8>,
    },
    Object {
        model: u32,
        /// Euler rotation in degrees.
        rotation: Vec3,
        #[serde(default)]
        draw_distance: f32,
    },
    Pickup {
        model: u32,
        pickup_type: u8,
    },
}

impl EntityPayload {
    pub fn class(&self) -> EntityClass {
        match self {
            Self::Vehicle { .. } => EntityClass::Vehicle,
            Self::Object { .. } => EntityClass::Object,
            Self::Pickup { .. } => EntityClass::Pickup,
        }
    }

    pub fn model(&self) -> u32 {
        match self {
            Self::Vehicle { model, .. } => u32::from(*model),
            Self::Object { model, .. } | Self::Pickup { model, .. } => *model,
        }
    }
}

/// Everything needed to materialize one entity.
///
/// Produced by feature code and consumed by the streamer; never modified
/// after registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamableEntityInfo {
    /// Position in world units. Only `x` and `y` participate in distance checks.
    pub position: Vec3,
    /// Heading in degrees.
    #[serde(default)]
    pub rotation: f32,
    #[serde(default)]
    pub locality: Locality,
    #[serde(default)]
    pub respawn: RespawnPolicy,
    pub payload: EntityPayload,
}

impl StreamableEntityInfo {
    pub fn new(position: Vec3, payload: EntityPayload) -> Self {
        Self {
            position,
            rotation: 0.0,
            locality: Locality::OUTDOORS,
            respawn: RespawnPolicy::Default,
            payload,
        }
    }

    pub fn vehicle(model: u16, position: Vec3) -> Self {
        Self::new(
            position,
            EntityPayload::Vehicle {
                model,
                primary_color: 0,
                secondary_color: 0,
                paintjob: None,
            },
        )
    }

    pub fn object(model: u32, position: Vec3) -> Self {
        Self::new(
            position,
            EntityPayload::Object {
                model,
                rotation: Vec3::ZERO,
                draw_distance: 0.0,
            },
        )
    }

    pub fn pickup(model: u32, pickup_type: u8, position: Vec3) -> Self {
        Self::new(position, EntityPayload::Pickup { model, pickup_type })
    }

    pub fn with_locality(mut self, locality: Locality) -> Self {
        self.locality = locality;
        self
    }

    pub fn with_respawn(mut self, respawn: RespawnPolicy) -> Self {
        self.respawn = respawn;
        self
    }

    pub fn with_rotation(mut self, rotation: f32) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn class(&self) -> EntityClass {
        self.payload.class()
    }

    /// Position projected onto the ground plane.
    pub fn planar(&self) -> Vec2 {
        self.position.truncate()
    }
}
