use crate::terrain_data::Direction;
use bevy::utils::HashMap;
use itertools::iproduct;
use std::sync::Arc;

/// Builds and caches the triangle index lists of the terrain chunks.
///
/// All chunks share the same square vertex grid, so an index list only depends on
/// the level of detail difference to the four neighbouring chunks.
/// Edges bordering a coarser neighbour only use every `2^delta`-th edge vertex,
/// which matches the vertices of the neighbour and avoids cracks along the seam.
///
/// Vertices are expected row by row, so the vertex at `(x, y)` has the index `y * n + x`.
/// All triangles are wound counter-clockwise in grid space.
pub struct BufferCache {
    vertices_per_side: u32,
    max_delta: u32,
    index_buffers: HashMap<u32, Arc<[u32]>>,
}

impl BufferCache {
    pub fn new(vertices_per_side: u32) -> Self {
        assert!(
            vertices_per_side >= 2,
            "A chunk needs at least two vertices per side."
        );

        Self {
            vertices_per_side,
            max_delta: (vertices_per_side - 1).trailing_zeros(),
            index_buffers: HashMap::default(),
        }
    }

    pub fn vertices_per_side(&self) -> u32 {
        self.vertices_per_side
    }

    /// Packs the lod deltas (indexed by [`Direction::index`]) into a cache key.
    /// Deltas larger than the grid supports are clamped.
    pub fn flags(&self, deltas: [u32; 4]) -> u32 {
        deltas
            .iter()
            .enumerate()
            .map(|(index, &delta)| delta.min(self.max_delta).min(0xf) << (4 * index))
            .fold(0, |flags, delta| flags | delta)
    }

    fn deltas(flags: u32) -> [u32; 4] {
        [0, 1, 2, 3].map(|index| (flags >> (4 * index)) & 0xf)
    }

    /// The index list for the cache key, built on first use.
    pub fn index_buffer(&mut self, flags: u32) -> Arc<[u32]> {
        let vertices_per_side = self.vertices_per_side;

        self.index_buffers
            .entry(flags)
            .or_insert_with(|| build_indices(vertices_per_side, Self::deltas(flags)).into())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.index_buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index_buffers.is_empty()
    }
}

fn build_indices(n: u32, deltas: [u32; 4]) -> Vec<u32> {
    let last = n - 1;
    let index = |x: u32, y: u32| y * n + x;
    let stitched = deltas.iter().any(|&delta| delta > 0);

    // if any edge is stitched, the whole outer ring is built separately,
    // because stitching one edge affects the corners of the adjacent edges
    let (start, end) = if stitched { (1, last - 1) } else { (0, last) };

    let mut indices = Vec::with_capacity((last * last * 6) as usize);

    for (y, x) in iproduct!(start..end, start..end) {
        let (a, b, c, d) = (
            index(x, y),
            index(x + 1, y),
            index(x + 1, y + 1),
            index(x, y + 1),
        );

        // alternate the diagonals in a diamond pattern
        if (x + y) % 2 == 0 {
            indices.extend([a, b, c, a, c, d]);
        } else {
            indices.extend([a, b, d, b, c, d]);
        }
    }

    if !stitched {
        return indices;
    }

    for direction in Direction::ALL {
        let outer_step = 1 << deltas[direction.index()];

        // t runs along the edge, d points into the chunk, the mapping keeps the winding
        let edge = |t: u32, d: u32| match direction {
            Direction::South => index(t, d),
            Direction::East => index(last - d, t),
            Direction::North => index(last - t, last - d),
            Direction::West => index(d, last - t),
        };

        for t in (0..last).step_by(outer_step as usize) {
            let next = t + outer_step;
            let inner_start = t.clamp(1, last - 1);
            let inner_end = next.clamp(1, last - 1);

            indices.extend([edge(t, 0), edge(next, 0), edge(inner_end, 1)]);

            for i in inner_start..inner_end {
                indices.extend([edge(t, 0), edge(i + 1, 1), edge(i, 1)]);
            }
        }
    }

    indices
}
