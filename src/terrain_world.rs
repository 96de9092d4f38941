use crate::{
    math::TerrainAabb,
    render::{composite_map::CompositeMapCompositor, RenderBackend, TextureId},
    terrain::{TerrainConfig, VisibilityFlags},
    terrain_data::{
        buffer_cache::BufferCache,
        load_queue::{Completed, LoadError, LoadFailure, LoadQueue, LoadRequest, WorkerPool},
        quadtree::{NodeMaterial, Quadtree, QuadtreeBuild},
        storage::{LayerTarget, Storage, TerrainBounds},
        ChunkData, Direction, LoadState, NodeId,
    },
};
use anyhow::{anyhow, ensure, Result};
use bevy::{
    prelude::*,
    utils::{HashMap, HashSet},
};
use std::{mem, sync::Arc};

/// A selected node whose geometry is ready to be rendered.
#[derive(Clone, Debug)]
pub struct VisibleChunk<'a> {
    pub node: NodeId,
    /// The world position the chunk positions are relative to.
    pub world_center: Vec3,
    pub aabb: TerrainAabb,
    pub lod: u32,
    pub chunk: &'a ChunkData,
    pub indices: &'a Arc<[u32]>,
    pub material: Option<NodeMaterial>,
}

/// Streams a terrain from a [`Storage`] for the current viewer position.
///
/// The world owns the [`Quadtree`] of the terrain and is the only one mutating it.
/// Geometry and texture layers are fetched on the [`WorkerPool`] and applied once
/// their responses are received, either during [`TerrainWorld::update`] or while
/// blocking in [`TerrainWorld::sync_load`].
///
/// After [`TerrainWorld::shutdown`] (or when dropped) the world drains:
/// outstanding responses are discarded and all render resources are released.
#[derive(Component)]
pub struct TerrainWorld {
    config: TerrainConfig,
    bounds: TerrainBounds,
    quadtree: Quadtree,
    leaves: Vec<NodeId>,
    selection: Vec<NodeId>,
    storage: Arc<dyn Storage>,
    queue: LoadQueue,
    backend: Box<dyn RenderBackend>,
    compositor: Option<CompositeMapCompositor>,
    buffer_caches: HashMap<u32, BufferCache>,
    visible: bool,
    chunks_loading: usize,
    layer_load_pending: bool,
    draining: bool,
    failures: Vec<LoadFailure>,
}

impl TerrainWorld {
    /// Builds the quadtree from the bounds of the storage and requests the
    /// texture layers of all leaves with data in a single batch.
    pub fn build(
        storage: Arc<dyn Storage>,
        mut backend: Box<dyn RenderBackend>,
        pool: WorkerPool,
        config: TerrainConfig,
    ) -> Result<Self> {
        config.validate()?;
        ensure!(
            storage.cell_vertices() >= 2,
            "The storage needs at least two vertices per cell edge."
        );

        let bounds = storage.bounds();
        let settings = config.lod_settings(storage.cell_world_size());
        let QuadtreeBuild { quadtree, leaves } =
            Quadtree::build(&*storage, settings, config.alignment);

        info!(
            "Built the terrain quadtree with {} nodes and {} leaves for the bounds {bounds:?}.",
            quadtree.len(),
            leaves.len()
        );

        let compositor = CompositeMapCompositor::new(&mut *backend, config.composite_map_size)?;

        let mut world = Self {
            visible: config.visible,
            config,
            bounds,
            quadtree,
            leaves,
            selection: Vec::new(),
            queue: LoadQueue::new(storage.clone(), pool),
            storage,
            backend,
            compositor: Some(compositor),
            buffer_caches: HashMap::default(),
            chunks_loading: 0,
            layer_load_pending: false,
            draining: false,
            failures: Vec::new(),
        };

        world.queue_layer_load();

        Ok(world)
    }

    pub fn config(&self) -> &TerrainConfig {
        &self.config
    }

    pub fn bounds(&self) -> TerrainBounds {
        self.bounds
    }

    pub fn quadtree(&self) -> &Quadtree {
        &self.quadtree
    }

    /// The leaves with data, as passed to the layer request.
    pub fn leaves(&self) -> &[NodeId] {
        &self.leaves
    }

    /// The nodes selected by the last update.
    pub fn selection(&self) -> &[NodeId] {
        &self.selection
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn visible(&self) -> bool {
        self.visible
    }

    pub fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
    }

    pub fn visibility_flags(&self) -> VisibilityFlags {
        self.config.visibility_flags
    }

    pub fn set_visibility_flags(&mut self, flags: VisibilityFlags) {
        self.config.visibility_flags = flags;
    }

    /// The number of chunk requests whose response was not applied yet.
    pub fn chunks_loading(&self) -> usize {
        self.chunks_loading
    }

    pub fn is_layer_load_pending(&self) -> bool {
        self.layer_load_pending
    }

    pub fn is_draining(&self) -> bool {
        self.draining
    }

    fn queue_layer_load(&mut self) {
        if self.leaves.is_empty() {
            return;
        }

        let targets = self
            .leaves
            .iter()
            .map(|&id| {
                let node = self.quadtree.node(id);

                LayerTarget {
                    node: id,
                    size: node.size(),
                    center: node.center(),
                }
            })
            .collect();

        self.queue.submit(LoadRequest::Layers {
            targets,
            pack: self.config.pack_blendmaps,
        });
        self.layer_load_pending = true;
    }

    /// Requests the geometry of the node at its native level of detail.
    ///
    /// # Panics
    /// Panics if the node is a dummy.
    pub fn queue_chunk_load(&mut self, id: NodeId) {
        if self.draining {
            debug!("Ignored the chunk request of {id} while draining.");
            return;
        }

        let alignment = self.config.alignment;
        let node = self.quadtree.node_mut(id);

        assert!(!node.is_dummy(), "Requested the chunk of the dummy {id}.");

        node.load_state = LoadState::Loading;

        self.queue.submit(LoadRequest::Chunk {
            node: id,
            generation: node.generation(),
            lod: node.native_lod(),
            size: node.size(),
            center: node.center(),
            alignment,
        });
        self.chunks_loading += 1;
    }

    /// Applies all responses that arrived so far. Returns the number of applied responses.
    pub fn process_responses(&mut self) -> usize {
        let mut count = 0;

        while let Some(completed) = self.queue.try_receive() {
            self.apply_response(completed);
            count += 1;
        }

        count
    }

    fn apply_response(&mut self, completed: Completed) {
        match completed {
            Completed::Chunk {
                node: id,
                generation,
                result,
            } => {
                self.chunks_loading = self.chunks_loading.saturating_sub(1);

                if self.draining {
                    return;
                }

                let Some(node) = self.quadtree.get_mut(id) else {
                    warn!("Received a chunk for the unknown {id}.");
                    return;
                };

                if node.generation() != generation || node.load_state() != LoadState::Loading {
                    debug!("Discarded the outdated chunk of {id}.");
                    return;
                }

                match result {
                    Ok(chunk) => node.load(chunk),
                    Err(failure) => {
                        warn!("{failure}");
                        node.load_failed();
                        self.failures.push(failure);
                    }
                }
            }
            Completed::Layers { targets, result } => {
                self.layer_load_pending = false;

                if self.draining {
                    return;
                }

                match result {
                    Ok(collections) => {
                        debug!("Received the layers of {} leaves.", targets.len());

                        for collection in collections {
                            match self.quadtree.get_mut(collection.target) {
                                Some(node) => node.load_layers(collection.data),
                                None => warn!("Received layers for the unknown {}.", collection.target),
                            }
                        }

                        self.load_materials();
                    }
                    Err(failure) => {
                        warn!("{failure}");
                        self.failures.push(failure);
                    }
                }
            }
        }
    }

    /// Prepares the materials after the layers of the leaves changed.
    /// Leaves render their layers directly, composite maps baked from
    /// the previous layers are discarded and baked again on demand.
    fn load_materials(&mut self) {
        let mut released = 0;

        for node in self.quadtree.nodes_mut() {
            if let Some(texture) = node.composite_map.take() {
                self.backend.release_texture(texture);
                released += 1;
            }
        }

        debug!("Loaded the terrain materials, released {released} composite maps.");
    }

    /// Selects the nodes to render for the camera position, requests missing geometry
    /// and prepares index buffers and materials of the selected nodes.
    ///
    /// Returns the load failures encountered since the last call.
    /// Does nothing while the world is invisible or draining.
    pub fn update(&mut self, camera_position: Vec3) -> Vec<LoadFailure> {
        if !self.visible || self.draining {
            return Vec::new();
        }

        self.process_responses();

        let selection = self.quadtree.select_lod(camera_position);
        self.apply_selection(selection);
        self.prepare_selection();

        mem::take(&mut self.failures)
    }

    fn apply_selection(&mut self, selection: Vec<NodeId>) {
        let selected: HashSet<NodeId> = selection.iter().copied().collect();

        for id in mem::take(&mut self.selection) {
            if selected.contains(&id) {
                continue;
            }

            let node = self.quadtree.node_mut(id);
            node.selected = false;

            if node.load_state() != LoadState::Unloaded {
                node.unload();
            }

            if let Some(texture) = node.composite_map.take() {
                self.backend.release_texture(texture);
            }
        }

        for &id in &selection {
            self.quadtree.node_mut(id).selected = true;
        }

        for &id in &selection {
            if self.quadtree.node(id).load_state() == LoadState::Unloaded {
                self.queue_chunk_load(id);
            }
        }

        self.selection = selection;
    }

    fn prepare_selection(&mut self) {
        self.update_index_buffers();

        if self.layer_load_pending {
            return;
        }

        for index in 0..self.selection.len() {
            let id = self.selection[index];

            if let Err(error) = self.ensure_composite_map(id) {
                warn!("Failed to bake the composite map of {id}: {error:#}");
            }
        }
    }

    /// Picks the index buffer of every loaded selected chunk, based on the
    /// level of detail of the chunks rendering the neighbouring areas.
    pub fn update_index_buffers(&mut self) {
        for &id in &self.selection {
            let node = self.quadtree.node(id);

            let Some(chunk) = node.chunk() else {
                continue;
            };

            let lod = node.native_lod();
            let deltas = Direction::ALL.map(|direction| {
                node.neighbour(direction)
                    .and_then(|neighbour| self.quadtree.rendered_lod(neighbour))
                    .map_or(0, |neighbour_lod| neighbour_lod.saturating_sub(lod))
            });

            let cache = self
                .buffer_caches
                .entry(chunk.vertices_per_side)
                .or_insert_with(|| BufferCache::new(chunk.vertices_per_side));
            let flags = cache.flags(deltas);

            if node.index_flags == Some(flags) {
                continue;
            }

            let indices = cache.index_buffer(flags);
            let node = self.quadtree.node_mut(id);
            node.index_flags = Some(flags);
            node.indices = Some(indices);
        }
    }

    /// Bakes the composite map of a selected inner node, if it has none yet.
    /// Leaves use their layers directly and never get a composite map.
    pub fn ensure_composite_map(&mut self, id: NodeId) -> Result<Option<TextureId>> {
        let node = self.quadtree.node(id);

        if node.is_leaf() {
            return Ok(None);
        }
        if let Some(texture) = node.composite_map {
            return Ok(Some(texture));
        }

        let Some(compositor) = self.compositor.as_mut() else {
            return Ok(None);
        };

        if compositor.compose_node(&self.quadtree, id) == 0 {
            compositor.clear();
            return Ok(None);
        }

        let texture = self
            .backend
            .create_texture(&format!("terrain/composite_map/{}", id.0), compositor.size())?;

        let result = self.render_composite_map(texture);
        self.clear_composite_map_scene();

        if let Err(error) = result {
            self.backend.release_texture(texture);
            return Err(error);
        }

        debug!("Baked the composite map of {id}.");
        self.quadtree.node_mut(id).composite_map = Some(texture);

        Ok(Some(texture))
    }

    /// Renders the composite map scene and copies it into the texture.
    pub fn render_composite_map(&mut self, texture: TextureId) -> Result<()> {
        let compositor = self
            .compositor
            .as_ref()
            .ok_or_else(|| anyhow!("The terrain was shut down."))?;

        compositor.render(&mut *self.backend, texture)
    }

    /// Removes all draws from the composite map scene.
    pub fn clear_composite_map_scene(&mut self) {
        if let Some(compositor) = &mut self.compositor {
            compositor.clear();
        }
    }

    /// Blocks until all chunk requests and the layer request were applied.
    /// Returns immediately if nothing is in flight.
    ///
    /// Fails with the load failures encountered while waiting.
    pub fn sync_load(&mut self) -> Result<(), LoadError> {
        let start = self.failures.len();

        while !self.draining && (self.chunks_loading > 0 || self.layer_load_pending) {
            match self.queue.receive_blocking() {
                Some(completed) => self.apply_response(completed),
                None => {
                    warn!("The terrain expected responses, but no request is pending.");
                    self.chunks_loading = 0;
                    self.layer_load_pending = false;
                }
            }
        }

        if self.visible && !self.draining {
            self.prepare_selection();
        }

        let failures = self.failures.split_off(start);

        if failures.is_empty() {
            Ok(())
        } else {
            Err(LoadError::from(failures))
        }
    }

    /// The bounding box of the node centered at the grid position,
    /// or the empty box if there is no such node.
    pub fn world_bounding_box(&self, center: Vec2) -> TerrainAabb {
        if !self.bounds.contains(center) {
            return TerrainAabb::EMPTY;
        }

        self.quadtree
            .find_node(center)
            .map_or(TerrainAabb::EMPTY, |id| self.quadtree.node(id).aabb())
    }

    /// The height of the terrain below the world position,
    /// [`NO_HEIGHT`](crate::terrain_data::storage::NO_HEIGHT) outside of it.
    pub fn height_at(&self, world_position: Vec3) -> f32 {
        self.storage.height_at(world_position)
    }

    /// The selected chunks ready for rendering.
    pub fn visible_chunks(&self) -> impl Iterator<Item = VisibleChunk<'_>> {
        self.selection
            .iter()
            .filter(|_| self.visible && !self.draining)
            .filter_map(|&id| {
                let node = self.quadtree.node(id);

                Some(VisibleChunk {
                    node: id,
                    world_center: self.quadtree.world_center(node.center()),
                    aabb: node.aabb(),
                    lod: node.native_lod(),
                    chunk: node.chunk()?,
                    indices: node.indices()?,
                    material: node.material(),
                })
            })
    }

    /// Stops applying responses and releases all render resources.
    pub fn shutdown(&mut self) {
        if self.draining {
            return;
        }

        self.draining = true;
        self.queue.abandon();
        self.chunks_loading = 0;
        self.layer_load_pending = false;

        for node in self.quadtree.nodes_mut() {
            if let Some(texture) = node.composite_map.take() {
                self.backend.release_texture(texture);
            }
            if node.load_state() != LoadState::Unloaded {
                node.unload();
            }
            node.selected = false;
        }

        if let Some(mut compositor) = self.compositor.take() {
            compositor.release(&mut *self.backend);
        }

        self.selection.clear();

        info!("Shut down the terrain.");
    }
}

impl Drop for TerrainWorld {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        math::Alignment,
        render::{image_backend::ImageBackend, CompositeDraw, RenderTargetId},
        terrain_data::{
            heightmap_storage::{FailingStorage, HeightmapStorage},
            LayerInfo,
        },
    };
    use bevy::tasks::TaskPoolBuilder;
    use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
    use std::{
        sync::atomic::{AtomicIsize, Ordering},
        thread,
        time::Duration,
    };

    /// Tracks the number of live resources of the wrapped backend.
    struct CountingBackend {
        inner: ImageBackend,
        live: Arc<AtomicIsize>,
    }

    impl RenderBackend for CountingBackend {
        fn create_texture(&mut self, label: &str, size: u32) -> Result<TextureId> {
            self.live.fetch_add(1, Ordering::SeqCst);
            self.inner.create_texture(label, size)
        }

        fn release_texture(&mut self, texture: TextureId) {
            self.live.fetch_sub(1, Ordering::SeqCst);
            self.inner.release_texture(texture)
        }

        fn create_render_target(&mut self, label: &str, size: u32) -> Result<RenderTargetId> {
            self.live.fetch_add(1, Ordering::SeqCst);
            self.inner.create_render_target(label, size)
        }

        fn release_render_target(&mut self, target: RenderTargetId) {
            self.live.fetch_sub(1, Ordering::SeqCst);
            self.inner.release_render_target(target)
        }

        fn render(&mut self, target: RenderTargetId, draws: &[CompositeDraw]) -> Result<()> {
            self.inner.render(target, draws)
        }

        fn blit(&mut self, source: RenderTargetId, destination: TextureId) -> Result<()> {
            self.inner.blit(source, destination)
        }
    }

    fn storage() -> HeightmapStorage {
        let mut storage =
            HeightmapStorage::from_fn(IVec2::ZERO, UVec2::new(100, 60), 2, 1.0, |p| {
                (p.x * 0.1).sin() * 4.0 + p.y * 0.05
            })
            .with_layer(LayerInfo::new("grass"), |p| if p.y < 30.0 { 1.0 } else { 0.0 });
        storage.add_hole(IVec2::new(16, 16), UVec2::new(16, 16));
        storage
    }

    fn world_with(storage: HeightmapStorage, config: TerrainConfig) -> (TerrainWorld, Arc<AtomicIsize>) {
        let live = Arc::new(AtomicIsize::new(0));
        let backend = CountingBackend {
            inner: ImageBackend::new(),
            live: live.clone(),
        };
        let pool = TaskPoolBuilder::new().num_threads(4).build();

        let world = TerrainWorld::build(
            Arc::new(storage),
            Box::new(backend),
            WorkerPool::owned(pool),
            config,
        )
        .unwrap();

        (world, live)
    }

    fn world() -> (TerrainWorld, Arc<AtomicIsize>) {
        world_with(storage(), TerrainConfig::default())
    }

    #[test]
    fn build_from_storage_bounds() {
        let (mut world, live) = world();
        let quadtree = world.quadtree();

        let root = quadtree.node(quadtree.root());
        assert_eq!(root.size(), 128.0);
        assert_eq!(root.center(), Vec2::new(64.0, 64.0));

        // 7 x 4 cells of 16, one of them is a hole
        assert_eq!(world.leaves().len(), 27);

        let hole = quadtree.find_node(Vec2::new(24.0, 24.0)).unwrap();
        assert!(quadtree.node(hole).is_dummy());
        assert!(!world.leaves().contains(&hole));

        assert!(world.is_layer_load_pending());
        world.sync_load().unwrap();
        assert!(!world.is_layer_load_pending());

        for &leaf in world.leaves() {
            assert!(world.quadtree().node(leaf).layers().is_some());
        }

        // the compositor render target
        assert_eq!(live.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn bounding_boxes() {
        let (world, _) = world();

        assert!(world.world_bounding_box(Vec2::new(-1.0, 8.0)).is_empty());
        assert!(world.world_bounding_box(Vec2::new(8.0, 61.0)).is_empty());
        assert!(world.world_bounding_box(Vec2::new(24.0, 24.0)).is_empty());
        assert!(world.world_bounding_box(Vec2::new(5.0, 5.0)).is_empty());

        let id = world.quadtree().find_node(Vec2::new(40.0, 8.0)).unwrap();
        let aabb = world.world_bounding_box(Vec2::new(40.0, 8.0));
        assert_eq!(aabb, world.quadtree().node(id).aabb());
        assert_eq!(aabb.min.x, 32.0);
        assert_eq!(aabb.max.y, 16.0);
    }

    #[test]
    fn bounding_boxes_follow_the_alignment() {
        let config = TerrainConfig {
            alignment: Alignment::XZ,
            ..default()
        };
        let (world, _) = world_with(storage().with_alignment(Alignment::XZ), config);

        let aabb = world.world_bounding_box(Vec2::new(40.0, 8.0));
        assert_eq!(aabb.min.x, 32.0);
        assert_eq!(aabb.min.z, -16.0);
        assert_eq!(aabb.max.z, 0.0);
        assert!(aabb.min.y <= aabb.max.y);

        let position = Alignment::XZ.convert_position(Vec3::new(40.0, 8.0, 0.0));
        let height = world.height_at(position);
        assert!(aabb.min.y <= height && height <= aabb.max.y);

        let outside = Alignment::XZ.convert_position(Vec3::new(500.0, 8.0, 0.0));
        assert!(world.height_at(outside).is_nan());
    }

    #[test]
    fn concurrent_chunk_loads_drain() {
        let (mut world, _) = world();
        let mut rng = StdRng::seed_from_u64(7);

        let mut leaves = world.leaves().to_vec();
        leaves.shuffle(&mut rng);

        for &leaf in &leaves {
            world.queue_chunk_load(leaf);
        }

        assert_eq!(world.chunks_loading(), leaves.len());

        world.sync_load().unwrap();

        assert_eq!(world.chunks_loading(), 0);
        for &leaf in &leaves {
            let node = world.quadtree().node(leaf);
            assert!(node.is_loaded());
            assert_eq!(node.chunk().unwrap().vertices_per_side, 17);
        }

        // nothing in flight
        world.sync_load().unwrap();
    }

    #[test]
    #[should_panic]
    fn chunk_of_dummy() {
        let (mut world, _) = world();
        let hole = world.quadtree().find_node(Vec2::new(24.0, 24.0)).unwrap();

        world.queue_chunk_load(hole);
    }

    #[test]
    fn streaming_follows_the_camera() {
        let (mut world, live) = world();
        let mut rng = StdRng::seed_from_u64(11);

        for _ in 0..8 {
            let camera = Vec3::new(
                rng.random_range(0.0..100.0),
                rng.random_range(0.0..60.0),
                rng.random_range(0.0..200.0),
            );

            assert!(world.update(camera).is_empty());
            world.sync_load().unwrap();

            let selection = world.selection().to_vec();
            assert!(!selection.is_empty());

            let chunks = world.visible_chunks().collect::<Vec<_>>();
            assert_eq!(chunks.len(), selection.len());

            for chunk in chunks {
                let n = chunk.chunk.vertices_per_side;
                assert!(chunk.indices.iter().all(|&index| index < n * n));

                match chunk.material {
                    Some(NodeMaterial::Layers(_)) => {
                        assert!(world.quadtree().node(chunk.node).is_leaf())
                    }
                    Some(NodeMaterial::CompositeMap(_)) => {
                        assert!(!world.quadtree().node(chunk.node).is_leaf())
                    }
                    None => panic!("{} has no material", chunk.node),
                }
            }

            let composite_maps = selection
                .iter()
                .filter(|&&id| !world.quadtree().node(id).is_leaf())
                .count();
            assert_eq!(live.load(Ordering::SeqCst), 1 + composite_maps as isize);
        }
    }

    #[test]
    fn far_views_use_composite_maps() {
        let (mut world, _) = world();

        world.update(Vec3::new(64.0, 64.0, 2000.0));
        world.sync_load().unwrap();

        let selection = world.selection();
        assert_eq!(selection.len(), 2);
        assert!(selection
            .iter()
            .all(|&id| world.quadtree().node(id).size() == 64.0));
        assert!(world
            .visible_chunks()
            .all(|chunk| matches!(chunk.material, Some(NodeMaterial::CompositeMap(_)))));
    }

    #[test]
    fn seams_are_stitched() {
        let (mut world, _) = world();

        // close to the south west corner, the fine leaves border coarser nodes
        world.update(Vec3::new(0.0, 0.0, 1.0));
        world.sync_load().unwrap();

        let full = 16 * 16 * 6;
        let fine = world.quadtree().find_node(Vec2::new(56.0, 8.0)).unwrap();
        let coarse = world.quadtree().find_node(Vec2::new(80.0, 16.0)).unwrap();
        let chunks = world.visible_chunks().collect::<Vec<_>>();

        let fine = chunks.iter().find(|chunk| chunk.node == fine).unwrap();
        assert!(chunks.iter().any(|chunk| chunk.node == coarse));
        assert!(fine.indices.len() < full);

        // every chunk still covers its whole area
        for chunk in &chunks {
            assert_eq!(chunk.indices.len() % 3, 0);
            assert!(chunk.indices.len() <= full);
        }
    }

    #[test]
    fn hidden_worlds_do_not_update() {
        let (mut world, _) = world();
        world.set_visible(false);

        world.update(Vec3::ZERO);
        assert!(world.selection().is_empty());
        assert_eq!(world.chunks_loading(), 0);
        assert_eq!(world.visible_chunks().count(), 0);

        world.set_visible(true);
        world.update(Vec3::ZERO);
        assert!(!world.selection().is_empty());
    }

    #[test]
    fn deselected_chunks_are_unloaded() {
        let (mut world, _) = world();

        world.update(Vec3::new(8.0, 8.0, 0.0));
        let near = world.selection().to_vec();
        world.sync_load().unwrap();

        // requests for the far selection are still in flight when the view changes back
        world.update(Vec3::new(64.0, 64.0, 2000.0));
        let far = world.selection().to_vec();
        world.update(Vec3::new(8.0, 8.0, 0.0));
        world.sync_load().unwrap();

        assert_eq!(world.chunks_loading(), 0);
        assert_eq!(world.selection(), near.as_slice());

        for id in far {
            if !near.contains(&id) {
                let node = world.quadtree().node(id);
                assert!(!node.is_loaded());
                assert!(node.generation() > 0);
            }
        }
        for id in near {
            assert!(world.quadtree().node(id).is_loaded());
        }
    }

    #[test]
    fn shutdown_discards_responses() {
        let (mut world, live) = world();

        world.update(Vec3::new(64.0, 64.0, 2000.0));
        world.sync_load().unwrap();
        assert!(live.load(Ordering::SeqCst) > 1);

        for &leaf in &world.leaves().to_vec() {
            world.queue_chunk_load(leaf);
        }

        world.shutdown();

        assert!(world.is_draining());
        assert_eq!(world.chunks_loading(), 0);
        assert_eq!(live.load(Ordering::SeqCst), 0);

        world.sync_load().unwrap();
        assert!(world.update(Vec3::ZERO).is_empty());
        assert_eq!(world.visible_chunks().count(), 0);
        assert!(world.leaves().iter().all(|&leaf| !world.quadtree().node(leaf).is_loaded()));

        drop(world);
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }

    fn failing_world(chunks: bool, layers: bool) -> TerrainWorld {
        let storage = FailingStorage {
            inner: storage(),
            chunks,
            layers,
        };
        let pool = TaskPoolBuilder::new().num_threads(2).build();

        TerrainWorld::build(
            Arc::new(storage),
            Box::new(ImageBackend::new()),
            WorkerPool::owned(pool),
            TerrainConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn failed_chunks_are_reported() {
        let mut world = failing_world(true, false);

        world.update(Vec3::new(8.0, 8.0, 0.0));
        let error = world.sync_load().unwrap_err();

        assert_eq!(error.failures.len(), world.selection().len());
        assert!(error.to_string().contains("failed"));
        assert_eq!(world.chunks_loading(), 0);

        // failed chunks are not requested again while they stay selected
        world.update(Vec3::new(8.0, 8.0, 0.0));
        assert_eq!(world.chunks_loading(), 0);
        assert!(world
            .selection()
            .iter()
            .all(|&id| world.quadtree().node(id).load_state() == LoadState::Failed));
    }

    #[test]
    fn update_returns_the_failures_of_the_frame() {
        let mut world = failing_world(true, false);
        let camera = Vec3::new(8.0, 8.0, 0.0);

        let mut failures = world.update(camera);
        let selected = world.selection().len();
        assert!(selected > 0);

        for _ in 0..10_000 {
            if world.chunks_loading() == 0 && !world.is_layer_load_pending() {
                break;
            }
            thread::sleep(Duration::from_millis(1));
            failures.extend(world.update(camera));
        }
        failures.extend(world.update(camera));

        assert_eq!(world.chunks_loading(), 0);
        assert_eq!(failures.len(), selected);
        assert!(failures
            .iter()
            .all(|failure| matches!(failure, LoadFailure::Chunk { node, .. } if world.selection().contains(node))));

        // reported failures are not repeated
        assert!(world.update(camera).is_empty());
        assert!(world.sync_load().is_ok());
    }

    #[test]
    fn failed_layers_are_reported() {
        let mut world = failing_world(false, true);

        let error = world.sync_load().unwrap_err();

        assert_eq!(error.failures.len(), 1);
        assert!(matches!(error.failures[0], LoadFailure::Layers { count: 27, .. }));
        assert!(!world.is_layer_load_pending());

        for &leaf in world.leaves() {
            assert!(world.quadtree().node(leaf).layers().is_none());
        }

        // the geometry still streams in, without materials
        assert!(world.update(Vec3::new(8.0, 8.0, 0.0)).is_empty());
        world.sync_load().unwrap();
        assert_eq!(world.visible_chunks().count(), world.selection().len());
        assert!(world.visible_chunks().all(|chunk| chunk.material.is_none()));
    }
}
