//! The interface to the renderer.
//!
//! The terrain only needs a handful of resources from the renderer: textures holding the
//! composite maps of distant nodes and a render target the compositor draws into.
//! These are referenced by opaque handles, created through a [`RenderBackend`]
//! and released again when the terrain is torn down.

use crate::terrain_data::LayerData;
use anyhow::Result;
use bevy::math::Rect;
use derive_more::derive::Display;
use std::sync::Arc;

pub mod composite_map;
pub mod image_backend;

#[derive(Copy, Clone, Debug, Display, Hash, Eq, PartialEq)]
#[display("texture {_0}")]
pub struct TextureId(pub usize);

#[derive(Copy, Clone, Debug, Display, Hash, Eq, PartialEq)]
#[display("render target {_0}")]
pub struct RenderTargetId(pub usize);

/// Draws the blended layers of one leaf into a region of a render target.
#[derive(Clone, Debug)]
pub struct CompositeDraw {
    /// The covered region in uv coordinates of the target, `v` grows northwards.
    pub rect: Rect,
    pub layers: Arc<LayerData>,
}

/// Creates the resources of the terrain and executes the composite map draws.
///
/// All methods are called from the thread owning the terrain.
pub trait RenderBackend: Send + Sync + 'static {
    fn create_texture(&mut self, label: &str, size: u32) -> Result<TextureId>;

    fn release_texture(&mut self, texture: TextureId);

    fn create_render_target(&mut self, label: &str, size: u32) -> Result<RenderTargetId>;

    fn release_render_target(&mut self, target: RenderTargetId);

    /// Clears the render target and executes the draws into it.
    fn render(&mut self, target: RenderTargetId, draws: &[CompositeDraw]) -> Result<()>;

    /// Copies the contents of the render target into the texture, scaling if necessary.
    fn blit(&mut self, source: RenderTargetId, destination: TextureId) -> Result<()>;
}
