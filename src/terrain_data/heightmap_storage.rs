//! A [`Storage`] backed by an in-memory heightmap.

use crate::{
    math::Alignment,
    terrain_data::{
        storage::{LayerTarget, Storage, TerrainBounds, NO_HEIGHT},
        ChunkData, LayerCollection, LayerData, LayerInfo,
    },
};
use anyhow::{ensure, Result};
use bevy::{math::FloatExt, prelude::*};
use image::{DynamicImage, GrayImage, Luma, Rgba, RgbaImage};
use itertools::{iproduct, Itertools};
use ndarray::Array2;

/// Terrain data held in memory.
///
/// The terrain consists of `cells` grid cells starting at `origin`.
/// Each cell edge is sampled by `cell_vertices` vertices, with neighbouring cells
/// sharing their border vertices. Cells can be marked as holes, in which case the
/// storage reports no data for them.
///
/// Arrays are indexed as `[[y, x]]`.
pub struct HeightmapStorage {
    origin: IVec2,
    cells: UVec2,
    cell_vertices: u32,
    cell_world_size: f32,
    alignment: Alignment,
    heights: Array2<f32>,
    present: Array2<bool>,
    base_layer: LayerInfo,
    layers: Vec<(LayerInfo, Array2<u8>)>,
}

impl HeightmapStorage {
    /// Samples the height function (in grid cells) at every vertex.
    pub fn from_fn(
        origin: IVec2,
        cells: UVec2,
        cell_vertices: u32,
        cell_world_size: f32,
        height: impl Fn(Vec2) -> f32,
    ) -> Self {
        assert!(cell_vertices >= 2, "A cell needs at least two vertices per edge.");

        let steps = cell_vertices - 1;
        let shape = (
            (cells.y * steps + 1) as usize,
            (cells.x * steps + 1) as usize,
        );

        let heights = Array2::from_shape_fn(shape, |(y, x)| {
            height(origin.as_vec2() + Vec2::new(x as f32, y as f32) / steps as f32)
        });

        Self {
            origin,
            cells,
            cell_vertices,
            cell_world_size,
            alignment: Alignment::XY,
            heights,
            present: Array2::from_elem((cells.y as usize, cells.x as usize), true),
            base_layer: LayerInfo::new("default"),
            layers: Vec::new(),
        }
    }

    pub fn with_alignment(mut self, alignment: Alignment) -> Self {
        self.alignment = alignment;
        self
    }

    pub fn with_base_layer(mut self, layer: LayerInfo) -> Self {
        self.base_layer = layer;
        self
    }

    /// Adds a layer blended on top of the previous ones, with weights in `[0, 1]`
    /// given by the function of the grid position.
    pub fn with_layer(mut self, layer: LayerInfo, weight: impl Fn(Vec2) -> f32) -> Self {
        let steps = self.steps() as f32;
        let origin = self.origin.as_vec2();

        let weights = Array2::from_shape_fn(self.heights.dim(), |(y, x)| {
            let weight = weight(origin + Vec2::new(x as f32, y as f32) / steps);
            (weight.clamp(0.0, 1.0) * u8::MAX as f32).round() as u8
        });

        self.layers.push((layer, weights));
        self
    }

    /// Removes the data of the cells in the region.
    pub fn add_hole(&mut self, min: IVec2, size: UVec2) {
        let start = (min - self.origin).max(IVec2::ZERO).as_uvec2();
        let end = (min - self.origin + size.as_ivec2())
            .max(IVec2::ZERO)
            .as_uvec2()
            .min(self.cells);

        for (y, x) in iproduct!(start.y..end.y, start.x..end.x) {
            self.present[[y as usize, x as usize]] = false;
        }
    }

    fn steps(&self) -> u32 {
        self.cell_vertices - 1
    }

    /// The local cell range `[start, end)` overlapped by the region, clamped to the data.
    fn cell_range(&self, size: f32, center: Vec2) -> (UVec2, UVec2) {
        let min = center - size / 2.0 - self.origin.as_vec2();
        let max = center + size / 2.0 - self.origin.as_vec2();

        let start = min.floor().max(Vec2::ZERO).as_uvec2().min(self.cells);
        let end = max.ceil().max(Vec2::ZERO).as_uvec2().min(self.cells);

        (start, end)
    }

    /// The first vertex of the region, in vertex coordinates relative to the origin.
    fn vertex_start(&self, size: f32, center: Vec2) -> IVec2 {
        ((center - size / 2.0 - self.origin.as_vec2()) * self.steps() as f32)
            .round()
            .as_ivec2()
    }

    fn vertex<T: Copy + Default>(array: &Array2<T>, vertex: IVec2) -> T {
        if vertex.x < 0 || vertex.y < 0 {
            return T::default();
        }

        array
            .get([vertex.y as usize, vertex.x as usize])
            .copied()
            .unwrap_or_default()
    }

    fn vertex_height(&self, vertex: IVec2) -> f32 {
        Self::vertex(&self.heights, vertex)
    }

    fn layer_data(&self, target: &LayerTarget, pack: bool) -> Result<LayerData> {
        ensure!(
            target.size > 0.0,
            "Invalid layer request for {} of size {}.",
            target.node,
            target.size
        );

        let start = self.vertex_start(target.size, target.center);
        let resolution = target.size as u32 * self.steps() + 1;
        let vertices = || iproduct!(0..resolution, 0..resolution);

        let used_layers = self
            .layers
            .iter()
            .filter(|(_, weights)| {
                vertices().any(|(y, x)| {
                    Self::vertex(weights, start + UVec2::new(x, y).as_ivec2()) > 0
                })
            })
            .collect_vec();

        let layers = std::iter::once(self.base_layer.clone())
            .chain(used_layers.iter().map(|(layer, _)| layer.clone()))
            .collect_vec();

        let weight = |weights: &Array2<u8>, x: u32, y: u32| {
            Self::vertex(weights, start + UVec2::new(x, y).as_ivec2())
        };

        let blendmaps = if pack {
            used_layers
                .chunks(4)
                .map(|chunk| {
                    let image = RgbaImage::from_fn(resolution, resolution, |x, y| {
                        let mut pixel = [0; 4];
                        for (channel, (_, weights)) in chunk.iter().enumerate() {
                            pixel[channel] = weight(weights, x, y);
                        }
                        Rgba(pixel)
                    });
                    DynamicImage::ImageRgba8(image)
                })
                .collect_vec()
        } else {
            used_layers
                .iter()
                .map(|(_, weights)| {
                    let image = GrayImage::from_fn(resolution, resolution, |x, y| {
                        Luma([weight(weights, x, y)])
                    });
                    DynamicImage::ImageLuma8(image)
                })
                .collect_vec()
        };

        Ok(LayerData {
            layers,
            blendmaps,
            packed: pack,
        })
    }
}

impl Storage for HeightmapStorage {
    fn bounds(&self) -> TerrainBounds {
        TerrainBounds::new(
            self.origin.x as f32,
            (self.origin.x + self.cells.x as i32) as f32,
            self.origin.y as f32,
            (self.origin.y + self.cells.y as i32) as f32,
        )
    }

    fn min_max_heights(&self, size: f32, center: Vec2) -> Option<(f32, f32)> {
        let (start, end) = self.cell_range(size, center);
        let steps = self.steps();

        iproduct!(start.y..end.y, start.x..end.x)
            .filter(|&(y, x)| self.present[[y as usize, x as usize]])
            .flat_map(|(y, x)| {
                iproduct!(0..=steps, 0..=steps).map(move |(vy, vx)| {
                    self.heights[[(y * steps + vy) as usize, (x * steps + vx) as usize]]
                })
            })
            .minmax()
            .into_option()
    }

    fn fill_vertex_buffers(
        &self,
        lod_level: u32,
        size: f32,
        center: Vec2,
        alignment: Alignment,
    ) -> Result<ChunkData> {
        let steps = self.steps();
        let intervals = size as u32 * steps;
        let stride = 1u32.checked_shl(lod_level).unwrap_or(u32::MAX);

        ensure!(
            intervals > 0 && stride <= intervals && intervals % stride == 0,
            "Can not sample a chunk of size {size} at lod {lod_level}."
        );

        let vertices_per_side = intervals / stride + 1;
        let vertex_count = (vertices_per_side * vertices_per_side) as usize;
        let start = self.vertex_start(size, center);
        let spacing = stride as f32 * self.cell_world_size / steps as f32;

        let mut positions = Vec::with_capacity(vertex_count);
        let mut normals = Vec::with_capacity(vertex_count);

        for (y, x) in iproduct!(0..vertices_per_side, 0..vertices_per_side) {
            let offset = UVec2::new(x, y) * stride;
            let vertex = start + offset.as_ivec2();
            let stride = stride as i32;

            let local = (offset.as_vec2() / steps as f32 - size / 2.0) * self.cell_world_size;
            let position = Vec3::new(local.x, local.y, self.vertex_height(vertex));

            let dx = self.vertex_height(vertex + IVec2::new(stride, 0))
                - self.vertex_height(vertex - IVec2::new(stride, 0));
            let dy = self.vertex_height(vertex + IVec2::new(0, stride))
                - self.vertex_height(vertex - IVec2::new(0, stride));
            let normal = Vec3::new(-dx, -dy, 2.0 * spacing).normalize();

            positions.push(alignment.convert_position(position).to_array());
            normals.push(alignment.convert_position(normal).to_array());
        }

        Ok(ChunkData {
            vertices_per_side,
            positions,
            normals,
            colours: vec![[u8::MAX; 4]; vertex_count],
        })
    }

    fn blendmaps(&self, targets: &[LayerTarget], pack: bool) -> Result<Vec<LayerCollection>> {
        targets
            .iter()
            .map(|target| {
                Ok(LayerCollection {
                    target: target.node,
                    data: self.layer_data(target, pack)?,
                })
            })
            .collect()
    }

    fn height_at(&self, world_position: Vec3) -> f32 {
        let grid = self.alignment.unconvert_position(world_position).truncate() / self.cell_world_size;

        if !self.bounds().contains(grid) {
            return NO_HEIGHT;
        }

        let vertex = (grid - self.origin.as_vec2()) * self.steps() as f32;

        let base = vertex.floor();
        let fraction = vertex - base;
        let base = base.as_ivec2();

        let height = |x: i32, y: i32| self.vertex_height(base.saturating_add(IVec2::new(x, y)));

        let bottom = height(0, 0).lerp(height(1, 0), fraction.x);
        let top = height(0, 1).lerp(height(1, 1), fraction.x);

        bottom.lerp(top, fraction.y)
    }

    fn cell_world_size(&self) -> f32 {
        self.cell_world_size
    }

    fn cell_vertices(&self) -> u32 {
        self.cell_vertices
    }
}

/// Wraps a storage and fails the chosen kinds of requests.
#[cfg(test)]
pub(crate) struct FailingStorage {
    pub inner: HeightmapStorage,
    pub chunks: bool,
    pub layers: bool,
}

#[cfg(test)]
impl Storage for FailingStorage {
    fn bounds(&self) -> TerrainBounds {
        self.inner.bounds()
    }

    fn min_max_heights(&self, size: f32, center: Vec2) -> Option<(f32, f32)> {
        self.inner.min_max_heights(size, center)
    }

    fn fill_vertex_buffers(
        &self,
        lod_level: u32,
        size: f32,
        center: Vec2,
        alignment: Alignment,
    ) -> Result<ChunkData> {
        ensure!(!self.chunks, "corrupted chunk at {center}");
        self.inner.fill_vertex_buffers(lod_level, size, center, alignment)
    }

    fn blendmaps(&self, targets: &[LayerTarget], pack: bool) -> Result<Vec<LayerCollection>> {
        ensure!(!self.layers, "corrupted blendmaps");
        self.inner.blendmaps(targets, pack)
    }

    fn height_at(&self, world_position: Vec3) -> f32 {
        self.inner.height_at(world_position)
    }

    fn cell_world_size(&self) -> f32 {
        self.inner.cell_world_size()
    }

    fn cell_vertices(&self) -> u32 {
        self.inner.cell_vertices()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terrain_data::NodeId;

    fn sloped() -> HeightmapStorage {
        HeightmapStorage::from_fn(IVec2::new(-4, 0), UVec2::new(8, 4), 3, 2.0, |p| p.x + 2.0 * p.y)
    }

    #[test]
    fn bounds_and_heights() {
        let storage = sloped();

        assert_eq!(storage.bounds(), TerrainBounds::new(-4.0, 4.0, 0.0, 4.0));
        assert_eq!(
            storage.min_max_heights(4.0, Vec2::new(-2.0, 2.0)),
            Some((-4.0, 8.0))
        );
        assert_eq!(storage.min_max_heights(4.0, Vec2::new(10.0, 2.0)), None);
    }

    #[test]
    fn holes_have_no_heights() {
        let mut storage = sloped();
        storage.add_hole(IVec2::new(-4, 0), UVec2::new(4, 4));

        assert_eq!(storage.min_max_heights(4.0, Vec2::new(-2.0, 2.0)), None);
        assert!(storage.min_max_heights(4.0, Vec2::new(2.0, 2.0)).is_some());
        assert!(storage.min_max_heights(8.0, Vec2::new(0.0, 2.0)).is_some());
    }

    #[test]
    fn vertex_buffers_follow_lod() {
        let storage = sloped();

        let full = storage
            .fill_vertex_buffers(0, 4.0, Vec2::new(-2.0, 2.0), Alignment::XY)
            .unwrap();
        assert_eq!(full.vertices_per_side, 9);
        assert_eq!(full.vertex_count(), 81);
        assert_eq!(full.normals.len(), 81);
        assert_eq!(full.colours.len(), 81);
        assert_eq!(full.positions[0], [-4.0, -4.0, -4.0]);
        assert_eq!(full.positions[80], [4.0, 4.0, 8.0]);
        assert_eq!(full.position_bytes().len(), 81 * 12);
        assert_eq!(full.normal_bytes().len(), 81 * 12);
        assert_eq!(full.colour_bytes().len(), 81 * 4);

        let coarse = storage
            .fill_vertex_buffers(2, 4.0, Vec2::new(-2.0, 2.0), Alignment::XY)
            .unwrap();
        assert_eq!(coarse.vertices_per_side, 3);
        assert_eq!(coarse.positions[8], full.positions[80]);

        assert!(storage
            .fill_vertex_buffers(4, 4.0, Vec2::new(-2.0, 2.0), Alignment::XY)
            .is_err());
    }

    #[test]
    fn flat_normals_point_up() {
        let storage = HeightmapStorage::from_fn(IVec2::ZERO, UVec2::splat(4), 5, 1.0, |_| 3.0);

        for alignment in [Alignment::XY, Alignment::XZ, Alignment::YZ] {
            let chunk = storage
                .fill_vertex_buffers(0, 2.0, Vec2::new(1.0, 1.0), alignment)
                .unwrap();
            let up = alignment.convert_position(Vec3::Z).to_array();

            // interior vertices only, the border samples heights outside the data
            let inner = chunk.vertices_per_side as usize + 1;
            assert_eq!(chunk.normals[inner], up);
        }
    }

    #[test]
    fn height_interpolates() {
        let storage = sloped().with_alignment(Alignment::XZ);

        let world = Alignment::XZ.convert_position(Vec3::new(1.5 * 2.0, 1.25 * 2.0, 0.0));
        assert!((storage.height_at(world) - 4.0).abs() < 1e-5);
    }

    #[test]
    fn no_height_outside_the_grid() {
        let storage = sloped();

        // the far corner of the grid still has data
        assert!((storage.height_at(Vec3::new(8.0, 8.0, 0.0)) - 12.0).abs() < 1e-5);

        assert!(storage.height_at(Vec3::new(8.5, 1.0, 0.0)).is_nan());
        assert!(storage.height_at(Vec3::new(-8.1, 1.0, 0.0)).is_nan());
        assert!(storage.height_at(Vec3::new(1.0e10, 1.0e10, 0.0)).is_nan());
        assert!(storage.height_at(Vec3::new(-1.0e10, 1.0, 0.0)).is_nan());
        assert!(storage.height_at(Vec3::splat(f32::NAN)).is_nan());
    }

    #[test]
    fn blendmaps_per_node() {
        let storage = sloped()
            .with_layer(LayerInfo::new("grass"), |p| if p.x < 0.0 { 1.0 } else { 0.0 })
            .with_layer(LayerInfo::new("rock"), |_| 0.5)
            .with_layer(LayerInfo::new("sand"), |_| 0.0);

        let targets = [
            LayerTarget {
                node: NodeId(1),
                size: 2.0,
                center: Vec2::new(-3.0, 1.0),
            },
            LayerTarget {
                node: NodeId(2),
                size: 2.0,
                center: Vec2::new(3.0, 1.0),
            },
        ];

        let collections = storage.blendmaps(&targets, false).unwrap();
        assert_eq!(collections.len(), 2);
        assert_eq!(collections[0].target, NodeId(1));
        assert_eq!(collections[0].data.layers.len(), 3);
        assert_eq!(collections[0].data.blendmaps.len(), 2);
        assert_eq!(collections[1].data.layers.len(), 2);
        assert_eq!(collections[1].data.layers[1], LayerInfo::new("rock"));
        assert_eq!(collections[0].data.weight(1, Vec2::ZERO), 1.0);

        let packed = storage.blendmaps(&targets, true).unwrap();
        assert_eq!(packed[0].data.blendmaps.len(), 1);
        assert_eq!(packed[0].data.weight(1, Vec2::ZERO), 1.0);
        assert!((packed[0].data.weight(2, Vec2::ZERO) - 0.5).abs() < 0.01);
    }
}
