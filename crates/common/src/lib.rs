//! Shared types for the entity streamer.
//!
//! # Invariants
//! - Definitions are immutable once handed to the streamer.
//! - The entity class of a definition is derived from its payload, never stored twice.

mod types;

pub use types::{
    EntityClass, EntityPayload, Locality, PlayerId, RespawnPolicy, StreamableEntityInfo,
    StreamingPlayer,
};
