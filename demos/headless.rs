use bevy::{log::LogPlugin, prelude::*};
use bevy_terrain_stream::prelude::*;
use image::{Rgba, RgbaImage};
use std::sync::Arc;

const CELLS: UVec2 = UVec2::new(300, 200);
const CELL_VERTICES: u32 = 3;
const CELL_WORLD_SIZE: f32 = 4.0;
const FRAMES: u32 = 120;

fn main() {
    let mut app = App::new();
    app.add_plugins((MinimalPlugins, LogPlugin::default(), TerrainStreamPlugin))
        .add_systems(Startup, setup)
        .add_systems(Update, fly_viewer);

    for _ in 0..FRAMES {
        app.update();
    }

    let mut terrains = app.world_mut().query::<&mut TerrainWorld>();
    for mut terrain in terrains.iter_mut(app.world_mut()) {
        if let Err(error) = terrain.sync_load() {
            error!("{error}");
        }

        let chunks = terrain.visible_chunks().collect::<Vec<_>>();
        let vertices: usize = chunks.iter().map(|chunk| chunk.chunk.vertex_count()).sum();
        let triangles: usize = chunks.iter().map(|chunk| chunk.indices.len() / 3).sum();
        let bytes: usize = chunks
            .iter()
            .map(|chunk| {
                chunk.chunk.position_bytes().len()
                    + chunk.chunk.normal_bytes().len()
                    + chunk.chunk.colour_bytes().len()
                    + chunk.indices.len() * size_of::<u32>()
            })
            .sum();
        let composite_maps = chunks
            .iter()
            .filter(|chunk| matches!(chunk.material, Some(NodeMaterial::CompositeMap(_))))
            .count();

        info!(
            "Rendering {} chunks with {vertices} vertices and {triangles} triangles, {composite_maps} of them use a composite map.",
            chunks.len()
        );
        info!("The chunks occupy {} KiB of vertex and index data.", bytes / 1024);

        let center = CELLS.as_vec2() / 2.0 * CELL_WORLD_SIZE;
        info!(
            "The terrain is {} high at its center.",
            terrain.height_at(center.extend(0.0))
        );

        terrain.shutdown();
    }
}

fn setup(mut commands: Commands) {
    let mut storage =
        HeightmapStorage::from_fn(IVec2::ZERO, CELLS, CELL_VERTICES, CELL_WORLD_SIZE, |p| {
            (p.x * 0.05).sin() * 30.0 + (p.y * 0.08).cos() * 20.0
        })
        .with_base_layer(LayerInfo::new("dirt"))
        .with_layer(LayerInfo::new("grass"), |p| ((p.y - 50.0) / 50.0).clamp(0.0, 1.0))
        .with_layer(LayerInfo::new("snow"), |p| {
            (((p.x * 0.05).sin() - 0.6) * 3.0).clamp(0.0, 1.0)
        });

    // a lake without any data
    storage.add_hole(IVec2::new(128, 64), UVec2::new(32, 32));

    let mut backend = ImageBackend::new();
    backend.insert_layer_texture("dirt", RgbaImage::from_pixel(8, 8, Rgba([110, 80, 50, 255])));
    backend.insert_layer_texture("grass", RgbaImage::from_pixel(8, 8, Rgba([60, 140, 40, 255])));
    backend.insert_layer_texture("snow", RgbaImage::from_pixel(8, 8, Rgba([240, 240, 250, 255])));

    let config = TerrainConfig::from_ron(
        "(min_batch_size: 16, max_batch_size: 64, lod_distance_factor: 1.5)",
    )
    .expect("valid terrain config");

    let terrain = TerrainWorld::build(
        Arc::new(storage),
        Box::new(backend),
        WorkerPool::async_compute(),
        config,
    )
    .expect("terrain from storage");

    commands.spawn(terrain);
    commands.spawn((TerrainViewer, GlobalTransform::default()));
}

fn fly_viewer(time: Res<Time>, mut viewers: Query<&mut GlobalTransform, With<TerrainViewer>>) {
    let t = time.elapsed_secs();
    let extent = CELLS.as_vec2() * CELL_WORLD_SIZE;
    let position = extent / 2.0 + Vec2::new(t.cos(), t.sin()) * extent / 3.0;

    for mut transform in &mut viewers {
        *transform = GlobalTransform::from_translation(position.extend(100.0));
    }
}
