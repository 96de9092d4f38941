use crate::{
    math::{next_power_of_two, Alignment, TerrainAabb},
    render::TextureId,
    terrain_data::{
        storage::{Storage, TerrainBounds},
        ChunkData, Direction, LayerData, LoadState, NodeId, Quadrant,
    },
};
use bevy::prelude::*;
use std::sync::Arc;

/// The parameters that decide how finely the quadtree subdivides and which
/// nodes are selected for a given viewer position.
#[derive(Clone, Copy, Debug)]
pub struct LodSettings {
    /// Nodes of this size (in cells) or smaller are leaves.
    pub min_batch_size: f32,
    /// Nodes larger than this (in cells) are never rendered as a single chunk.
    pub max_batch_size: f32,
    /// The edge length of a cell in world units.
    pub cell_world_size: f32,
    /// Scales the distances at which coarser nodes are selected.
    pub lod_distance_factor: f32,
}

impl LodSettings {
    /// The distance up to which only leaves are rendered.
    pub fn base_distance(&self) -> f32 {
        self.cell_world_size * self.min_batch_size * self.lod_distance_factor
    }

    /// The level of detail wanted at the distance from the viewer.
    /// Each level doubles the distance required.
    pub fn wanted_lod(&self, distance: f32) -> u32 {
        (distance / self.base_distance()).max(1.0).log2().floor() as u32
    }

    fn native_lod(&self, size: f32) -> u32 {
        (size / self.min_batch_size).max(1.0).log2().round() as u32
    }
}

/// The material a selected node is rendered with.
#[derive(Clone, Debug)]
pub enum NodeMaterial {
    /// Leaves blend their texture layers directly.
    Layers(Arc<LayerData>),
    /// Larger nodes use a single baked texture.
    CompositeMap(TextureId),
}

/// A node of the [`Quadtree`], covering a square region of the terrain grid.
#[derive(Clone, Debug)]
pub struct QuadtreeNode {
    /// The center of the node in grid cells.
    pub(crate) center: Vec2,
    /// The edge length of the node in grid cells.
    pub(crate) size: f32,
    pub(crate) quadrant: Option<Quadrant>,
    pub(crate) parent: Option<NodeId>,
    pub(crate) children: [Option<NodeId>; 4],
    pub(crate) neighbours: [Option<NodeId>; 4],
    /// The world space bounding box.
    pub(crate) aabb: TerrainAabb,
    pub(crate) native_lod: u32,
    leaf: bool,
    is_dummy: bool,

    pub(crate) load_state: LoadState,
    /// Incremented whenever the geometry of the node is discarded,
    /// so that responses to older requests can be recognized.
    pub(crate) generation: u32,
    pub(crate) chunk: Option<ChunkData>,
    pub(crate) layers: Option<Arc<LayerData>>,
    pub(crate) composite_map: Option<TextureId>,
    pub(crate) selected: bool,
    pub(crate) index_flags: Option<u32>,
    pub(crate) indices: Option<Arc<[u32]>>,
}

impl QuadtreeNode {
    fn new(
        center: Vec2,
        size: f32,
        quadrant: Option<Quadrant>,
        parent: Option<NodeId>,
        settings: &LodSettings,
    ) -> Self {
        Self {
            center,
            size,
            quadrant,
            parent,
            children: [None; 4],
            neighbours: [None; 4],
            aabb: TerrainAabb::EMPTY,
            native_lod: settings.native_lod(size),
            leaf: size <= settings.min_batch_size,
            is_dummy: false,
            load_state: LoadState::Unloaded,
            generation: 0,
            chunk: None,
            layers: None,
            composite_map: None,
            selected: false,
            index_flags: None,
            indices: None,
        }
    }

    pub fn center(&self) -> Vec2 {
        self.center
    }

    pub fn size(&self) -> f32 {
        self.size
    }

    pub fn quadrant(&self) -> Option<Quadrant> {
        self.quadrant
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn child(&self, quadrant: Quadrant) -> Option<NodeId> {
        self.children[quadrant.index()]
    }

    pub fn children(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.children.iter().flatten().copied()
    }

    pub fn neighbour(&self, direction: Direction) -> Option<NodeId> {
        self.neighbours[direction.index()]
    }

    pub fn aabb(&self) -> TerrainAabb {
        self.aabb
    }

    pub fn native_lod(&self) -> u32 {
        self.native_lod
    }

    pub fn is_leaf(&self) -> bool {
        self.leaf || self.is_dummy
    }

    pub fn is_dummy(&self) -> bool {
        self.is_dummy
    }

    pub fn is_loaded(&self) -> bool {
        self.load_state == LoadState::Loaded
    }

    pub fn load_state(&self) -> LoadState {
        self.load_state
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn chunk(&self) -> Option<&ChunkData> {
        self.chunk.as_ref()
    }

    pub fn layers(&self) -> Option<&Arc<LayerData>> {
        self.layers.as_ref()
    }

    pub fn is_selected(&self) -> bool {
        self.selected
    }

    pub fn indices(&self) -> Option<&Arc<[u32]>> {
        self.indices.as_ref()
    }

    pub fn material(&self) -> Option<NodeMaterial> {
        if let Some(texture) = self.composite_map {
            Some(NodeMaterial::CompositeMap(texture))
        } else {
            self.layers.clone().map(NodeMaterial::Layers)
        }
    }

    /// Marks the node as not contributing any renderable data.
    pub fn mark_as_dummy(&mut self) {
        self.is_dummy = true;
        self.aabb = TerrainAabb::EMPTY;
    }

    /// Installs the asynchronously loaded geometry and clears the loading state.
    pub(crate) fn load(&mut self, chunk: ChunkData) {
        debug_assert_eq!(self.load_state, LoadState::Loading);

        self.chunk = Some(chunk);
        self.load_state = LoadState::Loaded;
    }

    pub(crate) fn load_failed(&mut self) {
        self.load_state = LoadState::Failed;
    }

    /// Discards the geometry and invalidates outstanding requests.
    pub(crate) fn unload(&mut self) {
        self.chunk = None;
        self.index_flags = None;
        self.indices = None;
        self.load_state = LoadState::Unloaded;
        self.generation = self.generation.wrapping_add(1);
    }

    pub(crate) fn load_layers(&mut self, layers: LayerData) {
        self.layers = Some(Arc::new(layers));
    }
}

/// The result of building a [`Quadtree`].
pub struct QuadtreeBuild {
    pub quadtree: Quadtree,
    /// The leaves that have data, in construction order.
    pub leaves: Vec<NodeId>,
}

/// A quadtree spatially partitioning the terrain grid.
///
/// The nodes live in an arena and refer to their parent, children and
/// neighbours by [`NodeId`]. The tree owns all of its nodes and never removes
/// any of them, so a [`NodeId`] stays valid for the lifetime of the tree.
///
/// The root covers the smallest power of two sized square containing the grid bounds.
/// Nodes are subdivided until they reach the minimum batch size, or until they
/// lie completely outside of the bounds. Nodes without any data are marked
/// as dummies and are skipped by all queries.
#[derive(Clone, Debug)]
pub struct Quadtree {
    nodes: Vec<QuadtreeNode>,
    settings: LodSettings,
    alignment: Alignment,
    initialized: bool,
}

impl Quadtree {
    /// Creates a tree consisting of the root only.
    pub fn new(center: Vec2, size: f32, settings: LodSettings, alignment: Alignment) -> Self {
        let root = QuadtreeNode::new(center, size, None, None, &settings);

        Self {
            nodes: vec![root],
            settings,
            alignment,
            initialized: false,
        }
    }

    /// Computes the size and center of the root node for the grid bounds.
    /// The size is rounded up to the next power of two and the center is shifted
    /// so that the rounded region still starts at the minimum of the bounds.
    pub fn root_region(bounds: &TerrainBounds) -> (Vec2, f32) {
        let extent = bounds.size();
        let size = next_power_of_two(extent.x.max(extent.y).ceil() as i32) as f32;

        let center = Vec2::new(
            (bounds.min_x + bounds.max_x) / 2.0 + (size - extent.x) / 2.0,
            (bounds.min_y + bounds.max_y) / 2.0 + (size - extent.y) / 2.0,
        );

        (center, size)
    }

    /// Builds the complete tree from the storage, including bounding boxes and neighbour links.
    pub fn build(storage: &dyn Storage, settings: LodSettings, alignment: Alignment) -> QuadtreeBuild {
        let bounds = storage.bounds();
        let (center, size) = Self::root_region(&bounds);

        let mut quadtree = Self::new(center, size, settings, alignment);
        let mut leaves = Vec::new();

        quadtree.build_node(quadtree.root(), storage, &bounds, &mut leaves);
        quadtree.init_aabb();
        quadtree.init_neighbours();

        QuadtreeBuild { quadtree, leaves }
    }

    fn build_node(
        &mut self,
        id: NodeId,
        storage: &dyn Storage,
        bounds: &TerrainBounds,
        leaves: &mut Vec<NodeId>,
    ) {
        let (center, size) = {
            let node = self.node(id);
            (node.center, node.size)
        };
        let half_size = size / 2.0;

        if size <= self.settings.min_batch_size {
            // we arrived at a leaf
            if let Some((min_height, max_height)) = storage.min_max_heights(size, center) {
                let cell_world_size = self.settings.cell_world_size;
                let local = TerrainAabb::from_min_max(
                    Vec3::new(
                        -half_size * cell_world_size,
                        -half_size * cell_world_size,
                        min_height,
                    ),
                    Vec3::new(
                        half_size * cell_world_size,
                        half_size * cell_world_size,
                        max_height,
                    ),
                );

                let aabb = self
                    .alignment
                    .convert_bounds(local)
                    .translated(self.world_center(center));
                self.node_mut(id).aabb = aabb;
                leaves.push(id);
            } else {
                // no data available for this node, skip it
                self.node_mut(id).mark_as_dummy();
            }
            return;
        }

        // the root was rounded up to a power of two, so parts of it may lie outside the terrain
        if !bounds.intersects(center, size) {
            self.node_mut(id).mark_as_dummy();
            return;
        }

        let children = Quadrant::ALL.map(|quadrant| self.create_child(id, quadrant));

        for child in children {
            self.build_node(child, storage, bounds, leaves);
        }

        if children.iter().all(|&child| self.node(child).is_dummy()) {
            self.node_mut(id).mark_as_dummy();
        }
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn settings(&self) -> &LodSettings {
        &self.settings
    }

    pub fn alignment(&self) -> Alignment {
        self.alignment
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &QuadtreeNode {
        &self.nodes[id.index()]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut QuadtreeNode {
        &mut self.nodes[id.index()]
    }

    pub fn get(&self, id: NodeId) -> Option<&QuadtreeNode> {
        self.nodes.get(id.index())
    }

    pub(crate) fn get_mut(&mut self, id: NodeId) -> Option<&mut QuadtreeNode> {
        self.nodes.get_mut(id.index())
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &QuadtreeNode)> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(index, node)| (NodeId(index as u32), node))
    }

    pub(crate) fn nodes_mut(&mut self) -> impl Iterator<Item = &mut QuadtreeNode> {
        self.nodes.iter_mut()
    }

    /// The world position of a grid position at height zero.
    pub fn world_center(&self, center: Vec2) -> Vec3 {
        self.alignment
            .convert_position(center.extend(0.0) * self.settings.cell_world_size)
    }

    /// Creates the child covering the quadrant of the parent.
    /// The child has half the size of its parent and is offset by a quarter of
    /// the parent size along both axes.
    ///
    /// # Panics
    /// Panics if the parent is a leaf or already has a child in that quadrant.
    pub fn create_child(&mut self, parent: NodeId, quadrant: Quadrant) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        let node = self.node(parent);

        assert!(
            !node.is_leaf(),
            "Tried creating a child of the leaf {parent}."
        );
        assert!(
            node.child(quadrant).is_none(),
            "Tried creating the {quadrant:?} child of {parent} twice."
        );

        let size = node.size / 2.0;
        let center = node.center + quadrant.sign() * size / 2.0;

        let child = QuadtreeNode::new(center, size, Some(quadrant), Some(parent), &self.settings);
        self.nodes.push(child);
        self.node_mut(parent).children[quadrant.index()] = Some(id);

        id
    }

    /// Computes the bounding boxes of all inner nodes from their children.
    /// Leaf boxes are set during construction and stay untouched.
    pub fn init_aabb(&mut self) {
        self.init_node_aabb(self.root());
    }

    fn init_node_aabb(&mut self, id: NodeId) -> TerrainAabb {
        let node = self.node(id);

        if node.is_dummy() {
            return TerrainAabb::EMPTY;
        }
        if node.is_leaf() {
            return node.aabb;
        }

        let children = node.children;
        let aabb = children
            .into_iter()
            .flatten()
            .map(|child| self.init_node_aabb(child))
            .fold(TerrainAabb::EMPTY, TerrainAabb::merge);

        self.node_mut(id).aabb = aabb;
        aabb
    }

    /// Links every node to the equally sized node adjacent in each direction.
    /// Neighbours outside the tree, or in a region that was not subdivided down
    /// to the size of the node, stay unlinked.
    pub fn init_neighbours(&mut self) {
        for index in 0..self.nodes.len() {
            let (center, size) = {
                let node = &self.nodes[index];
                (node.center, node.size)
            };

            let neighbours =
                Direction::ALL.map(|direction| self.search(center + direction.offset() * size, size));

            self.nodes[index].neighbours = neighbours;
        }

        self.initialized = true;
    }

    /// Finds the node of the exact size at the exact center.
    pub fn search(&self, center: Vec2, size: f32) -> Option<NodeId> {
        let mut id = self.root();

        loop {
            let node = self.node(id);

            if node.size == size {
                return (node.center == center).then_some(id);
            }
            if node.size < size {
                return None;
            }

            id = node.child(Quadrant::of(center, node.center))?;
        }
    }

    /// Finds the node with the exact center, descending by quadrant comparisons.
    pub fn find_node(&self, center: Vec2) -> Option<NodeId> {
        let mut id = self.root();

        loop {
            let node = self.node(id);

            if node.center == center {
                return Some(id);
            }

            id = node.child(Quadrant::of(center, node.center))?;
        }
    }

    /// Selects the nodes that should be rendered for the camera position.
    ///
    /// A node is selected when it is a leaf, or when it is small enough to be
    /// rendered as one batch and the viewer is far enough away for its level of detail.
    /// Otherwise its children are considered instead. Dummy nodes are never selected.
    /// The result only depends on the tree geometry, the camera position and the settings.
    pub fn select_lod(&self, camera_position: Vec3) -> Vec<NodeId> {
        debug_assert!(self.initialized, "The quadtree was queried before its initialization.");

        let mut selection = Vec::new();
        self.select_node(self.root(), camera_position, &mut selection);
        selection
    }

    fn select_node(&self, id: NodeId, camera_position: Vec3, selection: &mut Vec<NodeId>) {
        let node = self.node(id);

        if node.is_dummy() {
            return;
        }

        if node.is_leaf()
            || (node.size <= self.settings.max_batch_size
                && self.settings.wanted_lod(node.aabb.distance(camera_position)) >= node.native_lod)
        {
            selection.push(id); // area covered by the current node
            return;
        }

        for child in node.children() {
            self.select_node(child, camera_position, selection);
        }
    }

    /// The level of detail of the selected node covering the area of the node,
    /// if the node itself or one of its ancestors is selected.
    pub fn rendered_lod(&self, id: NodeId) -> Option<u32> {
        let mut current = Some(id);

        while let Some(id) = current {
            let node = self.node(id);

            if node.selected {
                return Some(node.native_lod);
            }

            current = node.parent;
        }

        None
    }

    /// All leaves below the node that have data.
    pub fn leaves_below(&self, id: NodeId) -> Vec<NodeId> {
        let mut leaves = Vec::new();
        let mut stack = vec![id];

        while let Some(id) = stack.pop() {
            let node = self.node(id);

            if node.is_dummy() {
                continue;
            }

            if node.is_leaf() {
                leaves.push(id);
            } else {
                stack.extend(node.children());
            }
        }

        leaves
    }
}
