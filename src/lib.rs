//! This crate streams height-field terrains of any size into a Bevy application.
//!
//! # Background
//! Terrains are usually too large to keep all of their geometry in memory at full resolution.
//! Instead the terrain is subdivided into a [`Quadtree`](terrain_data::quadtree::Quadtree),
//! whose nodes cover square regions of decreasing size.
//! Depending on the position of the viewer, each frame a set of nodes is selected, so that
//! regions close to the viewer are covered by small nodes with dense geometry and distant
//! regions by large nodes with coarse geometry.
//! The geometry of the selected nodes is fetched from a [`Storage`](terrain_data::storage::Storage)
//! on worker threads and applied once it arrives.
//! See the [`terrain_data`] module for more information.
//!
//! ## Texturing
//! Leaves are textured by blending a set of ground layers with per-leaf blendmaps.
//! Larger nodes are textured with a composite map, a single texture into which the layers of
//! all leaves below the node are baked by a [`RenderBackend`](render::RenderBackend).
//! See the [`render`] module for more information.
//!
//! ## Usage
//! Spawn a [`TerrainWorld`](terrain_world::TerrainWorld) and a
//! [`TerrainViewer`](plugin::TerrainViewer) and add the
//! [`TerrainStreamPlugin`](plugin::TerrainStreamPlugin), or drive the world yourself by
//! calling [`TerrainWorld::update`](terrain_world::TerrainWorld::update) each frame.

pub mod math;
pub mod plugin;
pub mod render;
pub mod terrain;
pub mod terrain_data;
pub mod terrain_world;

#[allow(missing_docs)]
pub mod prelude {
    #[doc(hidden)]
    pub use crate::{
        math::{Alignment, TerrainAabb},
        plugin::{TerrainLoadFailed, TerrainStreamPlugin, TerrainViewer},
        render::{image_backend::ImageBackend, RenderBackend, TextureId},
        terrain::{TerrainConfig, VisibilityFlags},
        terrain_data::{
            heightmap_storage::HeightmapStorage,
            load_queue::{LoadError, LoadFailure, WorkerPool},
            quadtree::{NodeMaterial, Quadtree},
            storage::{Storage, TerrainBounds, NO_HEIGHT},
            LayerInfo, NodeId,
        },
        terrain_world::{TerrainWorld, VisibleChunk},
    };
}
