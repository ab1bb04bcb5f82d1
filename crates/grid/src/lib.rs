//! Spatial index: a static-resolution uniform grid over a square world.
//!
//! # Invariants
//! - Every stored record lies inside `[-W/2, W/2)` on both axes.
//! - Cell size equals the owning class's streaming distance, so a 3×3 block
//!   around the query cell covers everything within streaming range.
//! - The grid never inspects payloads; records are keyed by an opaque id.

mod grid;

pub use grid::{GridError, GridRecord, Nearest, SpatialGrid, coordinate_to_cell_index};
