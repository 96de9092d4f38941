//! This module contains the data side of the terrain: the [`Quadtree`](quadtree::Quadtree)
//! that partitions the terrain into nodes, the [`LoadQueue`](load_queue::LoadQueue) that
//! streams node data from a [`Storage`](storage::Storage) on worker threads and the
//! [`BufferCache`](buffer_cache::BufferCache) that provides the index lists used to
//! render the streamed chunks.
//!
//! # Explanation
//! The quadtree is built once from the bounds reported by the storage.
//! Its leaves receive their texture layers in one batched request after construction.
//! Each frame the quadtree selects the nodes that should be rendered for the current
//! viewer position and requests the vertex data of newly selected nodes.
//! The requested data is produced on worker threads and handed back to the thread
//! owning the quadtree, which is the only one ever mutating it.

use bevy::prelude::*;
use bytemuck::cast_slice;
use derive_more::derive::Display;
use image::{DynamicImage, GenericImageView};

pub mod buffer_cache;
pub mod heightmap_storage;
pub mod load_queue;
pub mod quadtree;
pub mod storage;

/// The handle of a node inside the [`Quadtree`](quadtree::Quadtree) arena.
#[derive(Copy, Clone, Debug, Display, Hash, Eq, PartialEq, Ord, PartialOrd)]
#[display("node {_0}")]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// The quadrant a child covers within its parent.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub enum Quadrant {
    SouthWest,
    SouthEast,
    NorthWest,
    NorthEast,
}

impl Quadrant {
    pub const ALL: [Quadrant; 4] = [
        Quadrant::SouthWest,
        Quadrant::SouthEast,
        Quadrant::NorthWest,
        Quadrant::NorthEast,
    ];

    /// # Panics
    /// Panics if the index does not refer to one of the four quadrants.
    pub fn from_index(index: usize) -> Self {
        match Self::ALL.get(index) {
            Some(&quadrant) => quadrant,
            None => panic!("Invalid quadrant index: {index}."),
        }
    }

    pub fn index(self) -> usize {
        match self {
            Quadrant::SouthWest => 0,
            Quadrant::SouthEast => 1,
            Quadrant::NorthWest => 2,
            Quadrant::NorthEast => 3,
        }
    }

    /// The sign of the offset from the parent center to the child center.
    pub fn sign(self) -> Vec2 {
        match self {
            Quadrant::SouthWest => Vec2::new(-1.0, -1.0),
            Quadrant::SouthEast => Vec2::new(1.0, -1.0),
            Quadrant::NorthWest => Vec2::new(-1.0, 1.0),
            Quadrant::NorthEast => Vec2::new(1.0, 1.0),
        }
    }

    /// The quadrant of `position` relative to `center`.
    /// Positions on a dividing line count towards the south and west.
    pub fn of(position: Vec2, center: Vec2) -> Self {
        match (position.x > center.x, position.y > center.y) {
            (true, true) => Quadrant::NorthEast,
            (true, false) => Quadrant::SouthEast,
            (false, true) => Quadrant::NorthWest,
            (false, false) => Quadrant::SouthWest,
        }
    }
}

/// The four cardinal directions used to link neighbouring nodes.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub enum Direction {
    North,
    East,
    South,
    West,
}

impl Direction {
    pub const ALL: [Direction; 4] = [
        Direction::North,
        Direction::East,
        Direction::South,
        Direction::West,
    ];

    pub fn index(self) -> usize {
        match self {
            Direction::North => 0,
            Direction::East => 1,
            Direction::South => 2,
            Direction::West => 3,
        }
    }

    pub fn offset(self) -> Vec2 {
        match self {
            Direction::North => Vec2::Y,
            Direction::East => Vec2::X,
            Direction::South => Vec2::NEG_Y,
            Direction::West => Vec2::NEG_X,
        }
    }
}

/// The loading progress of the geometry of a node.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum LoadState {
    #[default]
    Unloaded,
    /// A chunk request was issued and its response has not been applied yet.
    Loading,
    Loaded,
    /// The storage failed to produce the chunk.
    Failed,
}

/// The vertex data of a single terrain chunk, as produced by the storage.
///
/// The vertices form a square grid of `vertices_per_side` x `vertices_per_side` vertices,
/// stored row by row, with positions relative to the center of the chunk.
#[derive(Clone, Debug, Default)]
pub struct ChunkData {
    pub vertices_per_side: u32,
    pub positions: Vec<[f32; 3]>,
    pub normals: Vec<[f32; 3]>,
    pub colours: Vec<[u8; 4]>,
}

impl ChunkData {
    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    pub fn position_bytes(&self) -> &[u8] {
        cast_slice(&self.positions)
    }

    pub fn normal_bytes(&self) -> &[u8] {
        cast_slice(&self.normals)
    }

    pub fn colour_bytes(&self) -> &[u8] {
        cast_slice(&self.colours)
    }
}

/// A ground texture layer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct LayerInfo {
    pub diffuse_map: String,
    pub normal_map: Option<String>,
}

impl LayerInfo {
    pub fn new(diffuse_map: impl Into<String>) -> Self {
        Self {
            diffuse_map: diffuse_map.into(),
            normal_map: None,
        }
    }
}

/// The texture layers of a leaf node together with their blend weights.
///
/// The first layer is the base layer and is always fully weighted.
/// Every further layer is blended on top using its blendmap.
/// When `packed`, four consecutive weights share one RGBA blendmap,
/// otherwise each layer has its own single channel blendmap.
#[derive(Clone, Debug, Default)]
pub struct LayerData {
    pub layers: Vec<LayerInfo>,
    pub blendmaps: Vec<DynamicImage>,
    pub packed: bool,
}

impl LayerData {
    /// The weight of the layer at the uv coordinate inside the node.
    pub fn weight(&self, layer_index: usize, uv: Vec2) -> f32 {
        if layer_index == 0 {
            return 1.0;
        }

        let blend_index = layer_index - 1;
        let (blendmap, channel) = if self.packed {
            (self.blendmaps.get(blend_index / 4), blend_index % 4)
        } else {
            (self.blendmaps.get(blend_index), 0)
        };

        let Some(blendmap) = blendmap else {
            return 0.0;
        };

        let (width, height) = blendmap.dimensions();
        if width == 0 || height == 0 {
            return 0.0;
        }

        let uv = uv.clamp(Vec2::ZERO, Vec2::ONE);
        let x = (uv.x * (width - 1) as f32).round() as u32;
        let y = (uv.y * (height - 1) as f32).round() as u32;

        blendmap.get_pixel(x, y)[channel] as f32 / u8::MAX as f32
    }
}

/// The layers of one leaf node, as returned by a batched layer request.
#[derive(Clone, Debug)]
pub struct LayerCollection {
    pub target: NodeId,
    pub data: LayerData,
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma, Rgba, RgbaImage};

    #[test]
    fn quadrant_lookup() {
        let center = Vec2::new(8.0, 8.0);

        assert_eq!(Quadrant::of(Vec2::new(12.0, 12.0), center), Quadrant::NorthEast);
        assert_eq!(Quadrant::of(Vec2::new(12.0, 4.0), center), Quadrant::SouthEast);
        assert_eq!(Quadrant::of(Vec2::new(4.0, 12.0), center), Quadrant::NorthWest);
        assert_eq!(Quadrant::of(Vec2::new(4.0, 4.0), center), Quadrant::SouthWest);

        for quadrant in Quadrant::ALL {
            assert_eq!(Quadrant::from_index(quadrant.index()), quadrant);
            assert_eq!(Quadrant::of(center + quadrant.sign(), center), quadrant);
        }
    }

    #[test]
    #[should_panic]
    fn invalid_quadrant() {
        Quadrant::from_index(4);
    }

    #[test]
    fn layer_weights() {
        let mut single = GrayImage::new(2, 2);
        single.put_pixel(1, 1, Luma([255]));

        let data = LayerData {
            layers: vec![LayerInfo::new("base"), LayerInfo::new("grass")],
            blendmaps: vec![DynamicImage::ImageLuma8(single)],
            packed: false,
        };

        assert_eq!(data.weight(0, Vec2::ZERO), 1.0);
        assert_eq!(data.weight(1, Vec2::ZERO), 0.0);
        assert_eq!(data.weight(1, Vec2::ONE), 1.0);
        assert_eq!(data.weight(2, Vec2::ONE), 0.0);

        let mut packed = RgbaImage::new(1, 1);
        packed.put_pixel(0, 0, Rgba([0, 255, 0, 0]));

        let data = LayerData {
            layers: vec![
                LayerInfo::new("base"),
                LayerInfo::new("grass"),
                LayerInfo::new("rock"),
            ],
            blendmaps: vec![DynamicImage::ImageRgba8(packed)],
            packed: true,
        };

        assert_eq!(data.weight(1, Vec2::ZERO), 0.0);
        assert_eq!(data.weight(2, Vec2::ZERO), 1.0);
    }
}
