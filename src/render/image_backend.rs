//! A [`RenderBackend`] rendering on the CPU into images.

use crate::render::{CompositeDraw, RenderBackend, RenderTargetId, TextureId};
use anyhow::{anyhow, Result};
use bevy::{prelude::*, utils::HashMap};
use image::{
    imageops::{self, FilterType},
    Rgba, RgbaImage,
};
use slab::Slab;

const FALLBACK_COLOUR: Rgba<u8> = Rgba([128, 128, 128, 255]);

struct Texture {
    label: String,
    image: RgbaImage,
}

/// Keeps all textures and render targets as images in memory.
///
/// Layer textures are looked up by the diffuse map name of the layer and repeat
/// once per draw. Layers without a registered texture are drawn grey.
#[derive(Default)]
pub struct ImageBackend {
    textures: Slab<Texture>,
    targets: Slab<Texture>,
    layer_textures: HashMap<String, RgbaImage>,
}

impl ImageBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_layer_texture(&mut self, name: impl Into<String>, image: RgbaImage) {
        self.layer_textures.insert(name.into(), image);
    }

    pub fn texture(&self, texture: TextureId) -> Option<&RgbaImage> {
        self.textures.get(texture.0).map(|texture| &texture.image)
    }

    pub fn texture_label(&self, texture: TextureId) -> Option<&str> {
        self.textures.get(texture.0).map(|texture| texture.label.as_str())
    }

    pub fn render_target(&self, target: RenderTargetId) -> Option<&RgbaImage> {
        self.targets.get(target.0).map(|target| &target.image)
    }

    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    pub fn render_target_count(&self) -> usize {
        self.targets.len()
    }

    fn sample_layer(&self, name: &str, uv: Vec2) -> Vec4 {
        let Some(image) = self.layer_textures.get(name) else {
            return colour_to_vec(FALLBACK_COLOUR);
        };

        let size = UVec2::new(image.width(), image.height());
        if size.min_element() == 0 {
            return colour_to_vec(FALLBACK_COLOUR);
        }

        let pixel = (uv * size.as_vec2()).as_uvec2().min(size - 1);
        colour_to_vec(*image.get_pixel(pixel.x, pixel.y))
    }

    fn shade(&self, draw: &CompositeDraw, uv: Vec2) -> Vec4 {
        draw.layers
            .layers
            .iter()
            .enumerate()
            .fold(Vec4::ZERO, |colour, (index, layer)| {
                let weight = draw.layers.weight(index, uv);
                colour.lerp(self.sample_layer(&layer.diffuse_map, uv), weight)
            })
    }
}

fn colour_to_vec(colour: Rgba<u8>) -> Vec4 {
    Vec4::from_array(colour.0.map(|channel| channel as f32)) / u8::MAX as f32
}

fn vec_to_colour(colour: Vec4) -> Rgba<u8> {
    let colour = (colour.clamp(Vec4::ZERO, Vec4::ONE) * u8::MAX as f32).round();
    Rgba(colour.to_array().map(|channel| channel as u8))
}

impl RenderBackend for ImageBackend {
    fn create_texture(&mut self, label: &str, size: u32) -> Result<TextureId> {
        let id = self.textures.insert(Texture {
            label: label.to_string(),
            image: RgbaImage::new(size, size),
        });

        Ok(TextureId(id))
    }

    fn release_texture(&mut self, texture: TextureId) {
        if self.textures.try_remove(texture.0).is_none() {
            warn!("Tried releasing the unknown {texture}.");
        }
    }

    fn create_render_target(&mut self, label: &str, size: u32) -> Result<RenderTargetId> {
        let id = self.targets.insert(Texture {
            label: label.to_string(),
            image: RgbaImage::new(size, size),
        });

        Ok(RenderTargetId(id))
    }

    fn release_render_target(&mut self, target: RenderTargetId) {
        if self.targets.try_remove(target.0).is_none() {
            warn!("Tried releasing the unknown {target}.");
        }
    }

    fn render(&mut self, target: RenderTargetId, draws: &[CompositeDraw]) -> Result<()> {
        let mut image = self
            .targets
            .get_mut(target.0)
            .map(|target| std::mem::take(&mut target.image))
            .ok_or_else(|| anyhow!("Can not render into the unknown {target}."))?;

        let size = Vec2::new(image.width() as f32, image.height() as f32);

        for (x, y, pixel) in image.enumerate_pixels_mut() {
            // the first row is the northern edge
            let uv = (Vec2::new(x as f32, y as f32) + 0.5) / size;
            let uv = Vec2::new(uv.x, 1.0 - uv.y);

            *pixel = draws
                .iter()
                .rev()
                .find(|draw| draw.rect.contains(uv))
                .map(|draw| {
                    let local = (uv - draw.rect.min) / draw.rect.size();
                    vec_to_colour(self.shade(draw, local))
                })
                .unwrap_or(Rgba([0; 4]));
        }

        self.targets[target.0].image = image;

        Ok(())
    }

    fn blit(&mut self, source: RenderTargetId, destination: TextureId) -> Result<()> {
        let source = &self
            .targets
            .get(source.0)
            .ok_or_else(|| anyhow!("Can not blit from the unknown {source}."))?
            .image;
        let destination = &mut self
            .textures
            .get_mut(destination.0)
            .ok_or_else(|| anyhow!("Can not blit into the unknown {destination}."))?
            .image;

        if source.dimensions() == destination.dimensions() {
            destination.copy_from_slice(source);
        } else {
            let (width, height) = destination.dimensions();
            *destination = imageops::resize(source, width, height, FilterType::Triangle);
        }

        Ok(())
    }
}
