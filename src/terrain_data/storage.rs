//! The interface to the source of the terrain data.

use crate::{
    math::Alignment,
    terrain_data::{ChunkData, LayerCollection, NodeId},
};
use anyhow::Result;
use bevy::prelude::*;

/// The extents of the terrain grid, measured in cells.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TerrainBounds {
    pub min_x: f32,
    pub max_x: f32,
    pub min_y: f32,
    pub max_y: f32,
}

impl TerrainBounds {
    pub fn new(min_x: f32, max_x: f32, min_y: f32, max_y: f32) -> Self {
        Self {
            min_x,
            max_x,
            min_y,
            max_y,
        }
    }

    pub fn size(&self) -> Vec2 {
        Vec2::new(self.max_x - self.min_x, self.max_y - self.min_y)
    }

    pub fn contains(&self, point: Vec2) -> bool {
        point.x >= self.min_x
            && point.x <= self.max_x
            && point.y >= self.min_y
            && point.y <= self.max_y
    }

    /// Whether the square region touches the bounds.
    pub fn intersects(&self, center: Vec2, size: f32) -> bool {
        let half_size = size / 2.0;

        !(center.x - half_size > self.max_x
            || center.x + half_size < self.min_x
            || center.y - half_size > self.max_y
            || center.y + half_size < self.min_y)
    }
}

/// The height reported for positions outside the terrain.
pub const NO_HEIGHT: f32 = f32::NAN;

/// Identifies a leaf node inside a batched layer request.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LayerTarget {
    pub node: NodeId,
    pub size: f32,
    pub center: Vec2,
}

/// Provides the terrain data.
///
/// Sizes and centers are given in grid cells, heights and positions in world units.
/// The fetching methods are called from worker threads, potentially concurrently,
/// so implementations have to be safe for concurrent reads.
pub trait Storage: Send + Sync + 'static {
    /// The extents of the grid in cells.
    fn bounds(&self) -> TerrainBounds;

    /// The minimum and maximum height inside the region,
    /// or `None` if there is no data for that region.
    fn min_max_heights(&self, size: f32, center: Vec2) -> Option<(f32, f32)>;

    /// Produces the vertex data of the region, using every `2^lod_level`-th vertex.
    fn fill_vertex_buffers(
        &self,
        lod_level: u32,
        size: f32,
        center: Vec2,
        alignment: Alignment,
    ) -> Result<ChunkData>;

    /// Produces the texture layers of all targets in one batch.
    fn blendmaps(&self, targets: &[LayerTarget], pack: bool) -> Result<Vec<LayerCollection>>;

    /// The terrain height below the world position,
    /// or [`NO_HEIGHT`] if the position lies outside the bounds.
    fn height_at(&self, world_position: Vec3) -> f32;

    /// The edge length of one cell in world units.
    fn cell_world_size(&self) -> f32;

    /// The number of vertices along the edge of one cell.
    fn cell_vertices(&self) -> u32;
}
