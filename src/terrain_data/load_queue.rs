use crate::{
    math::Alignment,
    terrain_data::{
        storage::{LayerTarget, Storage},
        ChunkData, LayerCollection, NodeId,
    },
};
use anyhow::anyhow;
use async_channel::{Receiver, Sender};
use bevy::{
    prelude::*,
    tasks::{AsyncComputeTaskPool, TaskPool},
};
use derive_more::derive::{Display, Error, From};
use slab::Slab;
use std::{
    any::Any,
    ops::Deref,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

/// The task pool the load requests are executed on.
#[derive(Clone)]
pub enum WorkerPool {
    Shared(&'static TaskPool),
    Owned(Arc<TaskPool>),
}

impl WorkerPool {
    /// Uses bevy's async compute pool, initializing it if necessary.
    pub fn async_compute() -> Self {
        Self::Shared(AsyncComputeTaskPool::get_or_init(TaskPool::default))
    }

    pub fn owned(pool: TaskPool) -> Self {
        Self::Owned(Arc::new(pool))
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::async_compute()
    }
}

impl Deref for WorkerPool {
    type Target = TaskPool;

    fn deref(&self) -> &Self::Target {
        match self {
            WorkerPool::Shared(pool) => pool,
            WorkerPool::Owned(pool) => pool,
        }
    }
}

/// A data fetch executed on a worker thread.
#[derive(Clone, Debug)]
pub enum LoadRequest {
    /// The vertex data of a single node.
    Chunk {
        node: NodeId,
        generation: u32,
        lod: u32,
        size: f32,
        center: Vec2,
        alignment: Alignment,
    },
    /// The texture layers of a batch of leaves.
    Layers { targets: Vec<LayerTarget>, pack: bool },
}

/// A request that could not be completed.
#[derive(Clone, Debug, Display, Error)]
pub enum LoadFailure {
    #[display("failed to load the chunk of {node}: {message}")]
    Chunk { node: NodeId, message: String },
    #[display("failed to load the layers of {count} leaves: {message}")]
    Layers { count: usize, message: String },
}

/// The failures encountered while draining the load queue.
#[derive(Debug, Display, Error, From)]
#[display("{} terrain load request(s) failed", failures.len())]
pub struct LoadError {
    pub failures: Vec<LoadFailure>,
}

/// The response to a [`LoadRequest`], carrying the identity of its target.
#[derive(Debug)]
pub enum Completed {
    Chunk {
        node: NodeId,
        generation: u32,
        result: Result<ChunkData, LoadFailure>,
    },
    Layers {
        targets: Vec<LayerTarget>,
        result: Result<Vec<LayerCollection>, LoadFailure>,
    },
}

#[derive(Clone, Copy, Debug)]
enum PendingRequest {
    Chunk(NodeId),
    Layers,
}

struct LoadResponse {
    key: usize,
    completed: Completed,
}

/// Executes [`LoadRequest`]s against the storage on a [`WorkerPool`]
/// and hands the responses back to the thread owning the queue.
///
/// Every submitted request produces exactly one response, even if the storage panics.
/// Requests may complete in any order.
pub struct LoadQueue {
    storage: Arc<dyn Storage>,
    pool: WorkerPool,
    pending: Slab<PendingRequest>,
    sender: Sender<LoadResponse>,
    receiver: Receiver<LoadResponse>,
}

impl LoadQueue {
    pub fn new(storage: Arc<dyn Storage>, pool: WorkerPool) -> Self {
        let (sender, receiver) = async_channel::unbounded();

        Self {
            storage,
            pool,
            pending: Slab::with_capacity(16),
            sender,
            receiver,
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// The number of requests whose response has not been received yet.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn chunks_pending(&self) -> usize {
        self.pending
            .iter()
            .filter(|(_, request)| matches!(request, PendingRequest::Chunk(_)))
            .count()
    }

    pub fn is_closed(&self) -> bool {
        self.receiver.is_closed()
    }

    pub fn submit(&mut self, request: LoadRequest) {
        debug_assert!(!self.is_closed(), "Submitted a request to a closed queue.");

        let key = self.pending.insert(match request {
            LoadRequest::Chunk { node, lod, .. } => {
                debug!("Requested the chunk of {node} at lod {lod}.");
                PendingRequest::Chunk(node)
            }
            LoadRequest::Layers { ref targets, .. } => {
                debug!("Requested the layers of {} leaves.", targets.len());
                PendingRequest::Layers
            }
        });

        let storage = self.storage.clone();
        let sender = self.sender.clone();

        self.pool
            .spawn(async move {
                let completed = execute(&*storage, request);

                // fails only once the queue was abandoned
                let _ = sender.send(LoadResponse { key, completed }).await;
            })
            .detach();
    }

    /// Returns the next available response without blocking.
    pub fn try_receive(&mut self) -> Option<Completed> {
        while let Ok(response) = self.receiver.try_recv() {
            if let Some(completed) = self.accept(response) {
                return Some(completed);
            }
        }

        None
    }

    /// Blocks until the next response arrives.
    /// Returns `None` immediately if no request is pending.
    pub fn receive_blocking(&mut self) -> Option<Completed> {
        while !self.pending.is_empty() {
            let response = self.receiver.recv_blocking().ok()?;

            if let Some(completed) = self.accept(response) {
                return Some(completed);
            }
        }

        None
    }

    /// Forgets all pending requests and closes the channel,
    /// so that responses still being produced are dropped by the workers.
    pub fn abandon(&mut self) {
        if !self.pending.is_empty() {
            debug!("Abandoning {} pending load requests", self.pending.len());
        }

        self.pending.clear();
        self.receiver.close();
    }

    fn accept(&mut self, response: LoadResponse) -> Option<Completed> {
        match self.pending.try_remove(response.key) {
            Some(PendingRequest::Chunk(node)) => {
                debug!("Received the chunk of {node}.");
                Some(response.completed)
            }
            Some(PendingRequest::Layers) => Some(response.completed),
            None => {
                debug!("Discarded stale load response {}", response.key);
                None
            }
        }
    }
}

impl Drop for LoadQueue {
    fn drop(&mut self) {
        self.abandon();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

fn execute(storage: &dyn Storage, request: LoadRequest) -> Completed {
    match request {
        LoadRequest::Chunk {
            node,
            generation,
            lod,
            size,
            center,
            alignment,
        } => {
            let result = catch_unwind(AssertUnwindSafe(|| {
                storage.fill_vertex_buffers(lod, size, center, alignment)
            }))
            .unwrap_or_else(|payload| Err(anyhow!("storage panicked: {}", panic_message(&*payload))))
            .map_err(|error| LoadFailure::Chunk {
                node,
                message: format!("{error:#}"),
            });

            Completed::Chunk {
                node,
                generation,
                result,
            }
        }
        LoadRequest::Layers { targets, pack } => {
            let result = catch_unwind(AssertUnwindSafe(|| storage.blendmaps(&targets, pack)))
                .unwrap_or_else(|payload| {
                    Err(anyhow!("storage panicked: {}", panic_message(&*payload)))
                })
                .map_err(|error| LoadFailure::Layers {
                    count: targets.len(),
                    message: format!("{error:#}"),
                });

            Completed::Layers { targets, result }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terrain_data::{heightmap_storage::HeightmapStorage, storage::TerrainBounds};
    use anyhow::Result;
    use bevy::tasks::TaskPoolBuilder;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use bevy::utils::HashSet;
    use std::{thread, time::Duration};

    /// Delays every chunk and fails the ones left of `broken_x`.
    struct SlowStorage {
        inner: HeightmapStorage,
        broken_x: f32,
    }

    impl Storage for SlowStorage {
        fn bounds(&self) -> TerrainBounds {
            self.inner.bounds()
        }

        fn min_max_heights(&self, size: f32, center: Vec2) -> Option<(f32, f32)> {
            self.inner.min_max_heights(size, center)
        }

        fn fill_vertex_buffers(
            &self,
            lod_level: u32,
            size: f32,
            center: Vec2,
            alignment: Alignment,
        ) -> Result<ChunkData> {
            thread::sleep(Duration::from_millis((center.y as u64 * 7) % 5));

            if center.x < self.broken_x {
                panic!("no data at {center}");
            }

            self.inner
                .fill_vertex_buffers(lod_level, size, center, alignment)
        }

        fn blendmaps(&self, targets: &[LayerTarget], pack: bool) -> Result<Vec<LayerCollection>> {
            self.inner.blendmaps(targets, pack)
        }

        fn height_at(&self, world_position: Vec3) -> f32 {
            self.inner.height_at(world_position)
        }

        fn cell_world_size(&self) -> f32 {
            self.inner.cell_world_size()
        }

        fn cell_vertices(&self) -> u32 {
            self.inner.cell_vertices()
        }
    }

    fn queue(broken_x: f32) -> LoadQueue {
        let storage = SlowStorage {
            inner: HeightmapStorage::from_fn(IVec2::ZERO, UVec2::new(64, 64), 2, 1.0, |p| p.x),
            broken_x,
        };
        let pool = TaskPoolBuilder::new().num_threads(4).build();

        LoadQueue::new(Arc::new(storage), WorkerPool::owned(pool))
    }

    fn chunk_request(node: u32, center: Vec2) -> LoadRequest {
        LoadRequest::Chunk {
            node: NodeId(node),
            generation: 0,
            lod: 0,
            size: 4.0,
            center,
            alignment: Alignment::XY,
        }
    }

    #[test]
    fn every_request_is_answered_once() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut queue = queue(f32::NEG_INFINITY);

        let count = 40;
        for node in 0..count {
            let center = Vec2::new(rng.random_range(2..62) as f32, rng.random_range(2..62) as f32);
            queue.submit(chunk_request(node, center));
        }

        assert_eq!(queue.chunks_pending(), count as usize);

        let mut answered = HashSet::default();
        while let Some(completed) = queue.receive_blocking() {
            let Completed::Chunk { node, result, .. } = completed else {
                panic!("unexpected layers response");
            };

            assert!(result.is_ok());
            assert!(answered.insert(node));
        }

        assert_eq!(answered.len(), count as usize);
        assert!(queue.is_empty());
        assert!(queue.receive_blocking().is_none());
    }

    #[test]
    fn panics_become_failures() {
        let mut queue = queue(32.0);

        queue.submit(chunk_request(0, Vec2::new(8.0, 8.0)));
        queue.submit(chunk_request(1, Vec2::new(40.0, 8.0)));

        let mut failed = Vec::new();
        while let Some(completed) = queue.receive_blocking() {
            if let Completed::Chunk {
                result: Err(failure),
                ..
            } = completed
            {
                failed.push(failure);
            }
        }

        assert_eq!(failed.len(), 1);
        assert!(matches!(failed[0], LoadFailure::Chunk { node: NodeId(0), .. }));
        assert!(failed[0].to_string().contains("storage panicked"));
    }

    #[test]
    fn layer_requests_are_batched() {
        let mut queue = queue(f32::NEG_INFINITY);

        let targets = vec![
            LayerTarget {
                node: NodeId(3),
                size: 16.0,
                center: Vec2::new(8.0, 8.0),
            },
            LayerTarget {
                node: NodeId(4),
                size: 16.0,
                center: Vec2::new(24.0, 8.0),
            },
        ];

        queue.submit(LoadRequest::Layers {
            targets,
            pack: true,
        });

        let Some(Completed::Layers { targets, result }) = queue.receive_blocking() else {
            panic!("expected a layers response");
        };

        let collections = result.unwrap();
        assert_eq!(collections.len(), targets.len());
        assert_eq!(collections[1].target, NodeId(4));
    }

    #[test]
    fn abandoned_responses_are_dropped() {
        let mut queue = queue(f32::NEG_INFINITY);

        for node in 0..8 {
            queue.submit(chunk_request(node, Vec2::new(10.0, 10.0)));
        }

        queue.abandon();

        assert!(queue.is_empty());
        assert!(queue.is_closed());
        assert!(queue.try_receive().is_none());
        assert!(queue.receive_blocking().is_none());
    }
}
