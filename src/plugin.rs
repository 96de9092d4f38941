use crate::{terrain_data::load_queue::LoadFailure, terrain_world::TerrainWorld};
use bevy::prelude::*;

/// Marks the entity whose position drives the level of detail of all terrains.
#[derive(Component, Default, Clone, Copy, Debug)]
pub struct TerrainViewer;

/// Sent for every failed load request of a terrain.
#[derive(Event, Clone, Debug)]
pub struct TerrainLoadFailed {
    pub terrain: Entity,
    pub failure: LoadFailure,
}

/// Streams every [`TerrainWorld`] for the position of the [`TerrainViewer`].
pub struct TerrainStreamPlugin;

impl Plugin for TerrainStreamPlugin {
    fn build(&self, app: &mut App) {
        app.add_event::<TerrainLoadFailed>()
            .add_systems(Last, update_terrain_worlds);
    }
}

pub fn update_terrain_worlds(
    viewers: Query<&GlobalTransform, With<TerrainViewer>>,
    mut terrains: Query<(Entity, &mut TerrainWorld)>,
    mut failed: EventWriter<TerrainLoadFailed>,
) {
    let mut viewers = viewers.iter();

    let Some(viewer) = viewers.next() else {
        return;
    };

    if viewers.next().is_some() {
        debug!("Multiple terrain viewers, only the first one is used.");
    }

    let position = viewer.translation();

    for (terrain, mut world) in &mut terrains {
        for failure in world.update(position) {
            failed.send(TerrainLoadFailed { terrain, failure });
        }
    }
}
