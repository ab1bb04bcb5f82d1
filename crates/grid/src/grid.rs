use std::collections::HashMap;
use std::hash::Hash;

use glam::{Vec2, Vec3};
use streamer_common::Locality;

/// Errors from grid construction and insertion.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GridError {
    #[error("invalid grid dimensions: world size {world_size}, stream distance {stream_distance}")]
    InvalidDimensions { world_size: f32, stream_distance: f32 },
    #[error("stream distance {stream_distance} does not evenly divide world size {world_size}")]
    NonIntegralCellCount { world_size: f32, stream_distance: f32 },
    #[error("position ({x}, {y}) lies outside the grid bounds of ±{half_extent}")]
    OutOfBounds { x: f32, y: f32, half_extent: f32 },
    #[error("locality {actual:?} is not served by this grid (serves {expected:?})")]
    InvalidLocality { expected: Locality, actual: Locality },
}

/// One entry to be stored in a [`SpatialGrid`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridRecord<Id> {
    pub id: Id,
    /// Only `x` and `y` are used; `z` is carried along.
    pub position: Vec3,
    pub locality: Locality,
}

impl<Id> GridRecord<Id> {
    pub fn new(id: Id, position: Vec3, locality: Locality) -> Self {
        Self {
            id,
            position,
            locality,
        }
    }

    pub fn outdoors(id: Id, position: Vec3) -> Self {
        Self::new(id, position, Locality::OUTDOORS)
    }
}

/// A query result: record id plus squared planar distance to the query point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Nearest<Id> {
    pub id: Id,
    pub distance_sq: f32,
}

#[derive(Debug, Clone, Copy)]
struct Placement {
    position: Vec3,
    cell: usize,
    /// Insertion sequence, used as the tie-break between equal distances.
    seq: u64,
}

/// Map a coordinate onto a cell index along one axis: `clamp(floor((c + W/2) / cell_size))`.
pub fn coordinate_to_cell_index(
    coordinate: f32,
    world_size: f32,
    cell_size: f32,
    width: usize,
) -> usize {
    let raw = ((coordinate + world_size / 2.0) / cell_size).floor();
    if raw <= 0.0 {
        0
    } else {
        (raw as usize).min(width.saturating_sub(1))
    }
}

/// Uniform `C × C` grid over a square world of side `W`, centered on the origin.
///
/// `C = W / stream_distance` must be a whole number. Records are bucketed by
/// the cell containing their planar position; `closest` only ever looks at the
/// 3×3 block of cells around the query point.
#[derive(Debug, Clone)]
pub struct SpatialGrid<Id> {
    world_size: f32,
    cell_size: f32,
    width: usize,
    locality: Locality,
    cells: Vec<Vec<Id>>,
    records: HashMap<Id, Placement>,
    next_seq: u64,
}

impl<Id> SpatialGrid<Id>
where
    Id: Copy + Eq + Hash,
{
    /// Create a grid serving the outdoor partition.
    pub fn new(world_size: f32, stream_distance: f32) -> Result<Self, GridError> {
        if !(world_size.is_finite() && stream_distance.is_finite())
            || world_size <= 0.0
            || stream_distance <= 0.0
            || stream_distance > world_size
        {
            return Err(GridError::InvalidDimensions {
                world_size,
                stream_distance,
            });
        }

        let ratio = f64::from(world_size) / f64::from(stream_distance);
        if (ratio - ratio.round()).abs() > 1e-6 {
            return Err(GridError::NonIntegralCellCount {
                world_size,
                stream_distance,
            });
        }
        let width = ratio.round() as usize;

        tracing::debug!(world_size, stream_distance, width, "spatial grid created");
        Ok(Self {
            world_size,
            cell_size: stream_distance,
            width,
            locality: Locality::OUTDOORS,
            cells: vec![Vec::new(); width * width],
            records: HashMap::new(),
            next_seq: 0,
        })
    }

    /// Serve a different partition than the outdoor default.
    pub fn with_locality(mut self, locality: Locality) -> Self {
        self.locality = locality;
        self
    }

    /// Number of cells along each axis.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Side length of one cell, equal to the streaming distance.
    pub fn cell_size(&self) -> f32 {
        self.cell_size
    }

    pub fn locality(&self) -> Locality {
        self.locality
    }

    /// Number of records stored.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, id: Id) -> bool {
        self.records.contains_key(&id)
    }

    /// Stored position of a record.
    pub fn position(&self, id: Id) -> Option<Vec3> {
        self.records.get(&id).map(|p| p.position)
    }

    /// Number of non-empty cells.
    pub fn occupied_cells(&self) -> usize {
        self.cells.iter().filter(|c| !c.is_empty()).count()
    }

    /// Cell coordinates containing `point`, or `None` outside the bounds.
    pub fn cell_of(&self, point: Vec2) -> Option<(usize, usize)> {
        if !self.in_bounds(point.x) || !self.in_bounds(point.y) {
            return None;
        }
        Some((self.axis_index(point.x), self.axis_index(point.y)))
    }

    /// Insert a record. Returns `Ok(false)` if the id was already present,
    /// in which case the grid is left unchanged.
    pub fn insert(&mut self, record: GridRecord<Id>) -> Result<bool, GridError> {
        if record.locality != self.locality {
            return Err(GridError::InvalidLocality {
                expected: self.locality,
                actual: record.locality,
            });
        }
        let (cx, cy) = self
            .cell_of(record.position.truncate())
            .ok_or(GridError::OutOfBounds {
                x: record.position.x,
                y: record.position.y,
                half_extent: self.world_size / 2.0,
            })?;

        if self.records.contains_key(&record.id) {
            return Ok(false);
        }

        let cell = cy * self.width + cx;
        self.cells[cell].push(record.id);
        self.records.insert(
            record.id,
            Placement {
                position: record.position,
                cell,
                seq: self.next_seq,
            },
        );
        self.next_seq += 1;
        Ok(true)
    }

    /// Remove a record. Returns whether it was present.
    pub fn remove(&mut self, id: Id) -> bool {
        let Some(placement) = self.records.remove(&id) else {
            return false;
        };
        let cell = &mut self.cells[placement.cell];
        if let Some(index) = cell.iter().position(|c| *c == id) {
            cell.swap_remove(index);
        }
        true
    }

    /// Up to `count` records closest to `point`, nearest first.
    ///
    /// Only the 3×3 block of cells around the point is searched; sparse
    /// regions and world edges yield fewer results. Points outside the grid
    /// bounds yield an empty list.
    pub fn closest(&self, point: Vec2, count: usize) -> Vec<Nearest<Id>> {
        if count == 0 {
            return Vec::new();
        }
        let Some((cx, cy)) = self.cell_of(point) else {
            return Vec::new();
        };

        let mut candidates: Vec<(Id, f32, u64)> = Vec::new();
        for y in cy.saturating_sub(1)..=(cy + 1).min(self.width - 1) {
            for x in cx.saturating_sub(1)..=(cx + 1).min(self.width - 1) {
                for id in &self.cells[y * self.width + x] {
                    if let Some(p) = self.records.get(id) {
                        let distance_sq = p.position.truncate().distance_squared(point);
                        candidates.push((*id, distance_sq, p.seq));
                    }
                }
            }
        }

        candidates.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.2.cmp(&b.2)));
        candidates.truncate(count);
        candidates
            .into_iter()
            .map(|(id, distance_sq, _)| Nearest { id, distance_sq })
            .collect()
    }

    fn in_bounds(&self, coordinate: f32) -> bool {
        let half = self.world_size / 2.0;
        coordinate >= -half && coordinate < half
    }

    fn axis_index(&self, coordinate: f32) -> usize {
        coordinate_to_cell_index(coordinate, self.world_size, self.cell_size, self.width)
    }
}
