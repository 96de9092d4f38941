use crate::{
    render::{CompositeDraw, RenderBackend, RenderTargetId, TextureId},
    terrain_data::{quadtree::Quadtree, NodeId},
};
use anyhow::Result;
use bevy::prelude::*;

pub const DEFAULT_COMPOSITE_MAP_SIZE: u32 = 128;

/// Bakes the texture layers of many leaves into a single composite map.
///
/// The compositor owns an offscreen render target and a list of draws (its scene).
/// Rendering executes the scene into the target and blits the result into a texture.
pub struct CompositeMapCompositor {
    target: RenderTargetId,
    size: u32,
    draws: Vec<CompositeDraw>,
}

impl CompositeMapCompositor {
    pub fn new(backend: &mut dyn RenderBackend, size: u32) -> Result<Self> {
        let target = backend.create_render_target("terrain/composite_map", size)?;

        Ok(Self {
            target,
            size,
            draws: Vec::new(),
        })
    }

    pub fn target(&self) -> RenderTargetId {
        self.target
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn draws(&self) -> &[CompositeDraw] {
        &self.draws
    }

    pub fn add_draw(&mut self, draw: CompositeDraw) {
        self.draws.push(draw);
    }

    /// Removes all draws from the scene.
    pub fn clear(&mut self) {
        self.draws.clear();
    }

    /// Replaces the scene with one draw per leaf below the node that has its layers loaded.
    /// Returns the number of draws.
    pub fn compose_node(&mut self, quadtree: &Quadtree, id: NodeId) -> usize {
        self.clear();

        let node = quadtree.node(id);
        let origin = node.center() - node.size() / 2.0;

        for leaf in quadtree.leaves_below(id) {
            let leaf = quadtree.node(leaf);
            let Some(layers) = leaf.layers() else {
                continue;
            };

            let min = (leaf.center() - leaf.size() / 2.0 - origin) / node.size();
            let max = min + leaf.size() / node.size();

            self.add_draw(CompositeDraw {
                rect: Rect::from_corners(min, max),
                layers: layers.clone(),
            });
        }

        self.draws.len()
    }

    /// Renders the scene and copies the result into the texture.
    pub fn render(&self, backend: &mut dyn RenderBackend, texture: TextureId) -> Result<()> {
        backend.render(self.target, &self.draws)?;
        backend.blit(self.target, texture)
    }

    pub fn release(&mut self, backend: &mut dyn RenderBackend) {
        self.clear();
        backend.release_render_target(self.target);
    }
}
