use crate::{
    math::Alignment, render::composite_map::DEFAULT_COMPOSITE_MAP_SIZE,
    terrain_data::quadtree::LodSettings,
};
use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

bitflags::bitflags! {
/// The passes a terrain is visible in.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VisibilityFlags: u32 {
    const MAIN          = (1 << 0);
    const SHADOW_CASTER = (1 << 1);
    const REFLECTION    = (1 << 2);
    const MINIMAP       = (1 << 3);
}
}

impl Default for VisibilityFlags {
    fn default() -> Self {
        VisibilityFlags::MAIN | VisibilityFlags::SHADOW_CASTER
    }
}

/// Configures the subdivision, streaming and texturing of a terrain.
///
/// Sizes are measured in grid cells of the storage.
/// The config can be deserialized from RON, missing fields take their default value:
///
/// ```ron
/// (
///     alignment: XZ,
///     min_batch_size: 16,
///     max_batch_size: 64,
///     visibility_flags: "MAIN | REFLECTION",
/// )
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct TerrainConfig {
    pub alignment: Alignment,
    /// The size of the leaves.
    pub min_batch_size: u32,
    /// The size of the largest nodes that are rendered as a single chunk.
    pub max_batch_size: u32,
    /// Whether four blend weights share one RGBA blendmap.
    pub pack_blendmaps: bool,
    /// The resolution of the composite map render target.
    pub composite_map_size: u32,
    /// Multiplies the distances at which coarser levels of detail are selected.
    pub lod_distance_factor: f32,
    pub visibility_flags: VisibilityFlags,
    /// Whether the terrain starts out visible.
    pub visible: bool,
}

impl Default for TerrainConfig {
    fn default() -> Self {
        Self {
            alignment: Alignment::XY,
            min_batch_size: 16,
            max_batch_size: 64,
            pack_blendmaps: true,
            composite_map_size: DEFAULT_COMPOSITE_MAP_SIZE,
            lod_distance_factor: 2.0,
            visibility_flags: VisibilityFlags::default(),
            visible: true,
        }
    }
}

impl TerrainConfig {
    pub fn from_ron(source: &str) -> Result<Self> {
        let config: Self = ron::from_str(source)?;
        config.validate()?;

        Ok(config)
    }

    pub fn load_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let source = fs::read_to_string(path)
            .with_context(|| format!("Failed to read the terrain config {}.", path.display()))?;

        Self::from_ron(&source)
            .with_context(|| format!("Invalid terrain config {}.", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.min_batch_size.is_power_of_two(),
            "The minimum batch size has to be a power of two, got {}.",
            self.min_batch_size
        );
        ensure!(
            self.max_batch_size.is_power_of_two() && self.max_batch_size >= self.min_batch_size,
            "The maximum batch size has to be a power of two of at least {}, got {}.",
            self.min_batch_size,
            self.max_batch_size
        );
        ensure!(
            self.composite_map_size > 0,
            "The composite map needs a resolution."
        );
        ensure!(
            self.lod_distance_factor > 0.0,
            "The lod distance factor has to be positive, got {}.",
            self.lod_distance_factor
        );

        Ok(())
    }

    pub fn lod_settings(&self, cell_world_size: f32) -> LodSettings {
        LodSettings {
            min_batch_size: self.min_batch_size as f32,
            max_batch_size: self.max_batch_size as f32,
            cell_world_size,
            lod_distance_factor: self.lod_distance_factor,
        }
    }
}
