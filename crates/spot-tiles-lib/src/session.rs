//! Async driver that owns a [`ViewportTileCache`] and runs its fetches.
//!
//! [`TileSession::spawn`] moves the cache into a dedicated tokio task; the
//! task is the cache's single owner, so no locking is needed around it.
//! Viewport movements stream in over a channel, fetch plans fan out as
//! spawned tasks against a [`TileFetcher`], and completions come back over
//! an internal channel to be merged on the same task. Trailing throttled
//! updates fire off the cache's own deadline.
//!
//! Time enters the cache as `tokio::time::Instant` converted to std, so
//! the throttle follows tokio's clock and tests can drive it with a paused
//! runtime.

use crate::Result;
use crate::cache::{FetchPlan, ViewportTileCache};
use crate::model::{ClusterTile, RenderSet, Spot, Viewport};
use crate::store::TileStore;
use crate::tile_math::TileKey;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Capacity of the viewport inbox; bursts beyond it apply backpressure.
const VIEWPORT_CHANNEL_CAPACITY: usize = 16;

/// Capacity of the internal completion channel.
const COMPLETION_CHANNEL_CAPACITY: usize = 32;

/// Sleep horizon used when no trailing update is scheduled.
const IDLE_SLEEP: Duration = Duration::from_secs(3600);

/// Backend the session fetches tiles from.
///
/// Futures must be `Send`: the session runs each fetch as its own spawned
/// task so a slow tile never blocks viewport handling.
pub trait TileFetcher: Send + Sync + 'static {
    /// Loads the individual spots of one point tile.
    fn spots_in_tile(&self, key: TileKey) -> impl Future<Output = Result<Vec<Spot>>> + Send;

    /// Loads a batch of cluster tiles in one round trip. Keys without a
    /// stored document may simply be missing from the result.
    fn cluster_tiles(
        &self,
        keys: Vec<TileKey>,
    ) -> impl Future<Output = Result<Vec<ClusterTile>>> + Send;
}

/// [`TileFetcher`] over a [`TileStore`] plus an in-memory spot index.
///
/// Cluster tiles are read straight from the store; point lookups hit an
/// index of the spot corpus bucketed at the point zoom once at build time.
pub struct StoreFetcher<T: TileStore> {
    store: Arc<T>,
    spots_by_tile: HashMap<TileKey, Vec<Spot>>,
}

impl<T: TileStore> StoreFetcher<T> {
    pub fn new(store: Arc<T>, spots: Vec<Spot>, point_zoom: u8) -> Self {
        let mut spots_by_tile: HashMap<TileKey, Vec<Spot>> = HashMap::new();
        for spot in spots {
            let key = TileKey::for_location(&spot.location, point_zoom);
            spots_by_tile.entry(key).or_default().push(spot);
        }
        Self {
            store,
            spots_by_tile,
        }
    }
}

impl<T: TileStore + 'static> TileFetcher for StoreFetcher<T> {
    async fn spots_in_tile(&self, key: TileKey) -> Result<Vec<Spot>> {
        Ok(self
            .spots_by_tile
            .get(&key)
            .cloned()
            .unwrap_or_default())
    }

    async fn cluster_tiles(&self, keys: Vec<TileKey>) -> Result<Vec<ClusterTile>> {
        self.store.get_many(&keys)
    }
}

enum Completion {
    Spots {
        key: TileKey,
        generation: u64,
        result: Result<Vec<Spot>>,
    },
    Clusters {
        keys: Vec<TileKey>,
        generation: u64,
        result: Result<Vec<ClusterTile>>,
    },
}

/// Handle to a running session task.
///
/// Dropping the handle without [`TileSession::shutdown`] detaches the task;
/// it keeps running until its viewport senders are gone.
pub struct TileSession {
    viewports: mpsc::Sender<Viewport>,
    render: watch::Receiver<RenderSet>,
    task: JoinHandle<()>,
}

impl TileSession {
    /// Moves `cache` into a spawned task and starts handling viewports.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<F: TileFetcher>(cache: ViewportTileCache, fetcher: Arc<F>) -> Self {
        let (viewport_tx, viewport_rx) = mpsc::channel(VIEWPORT_CHANNEL_CAPACITY);
        let render = cache.render_sets();
        let task = tokio::spawn(run_loop(cache, fetcher, viewport_rx));
        Self {
            viewports: viewport_tx,
            render,
            task,
        }
    }

    /// Feeds one viewport movement into the session.
    ///
    /// Returns `false` when the session task is gone.
    pub async fn set_viewport(&self, viewport: Viewport) -> bool {
        self.viewports.send(viewport).await.is_ok()
    }

    /// Sender half for callers that forward viewports themselves.
    ///
    /// The session only stops once every clone of this sender is dropped.
    pub fn viewports(&self) -> mpsc::Sender<Viewport> {
        self.viewports.clone()
    }

    /// Subscribes to the session's render-set publishes.
    pub fn render_sets(&self) -> watch::Receiver<RenderSet> {
        self.render.clone()
    }

    /// Closes the viewport inbox and waits for the task to finish.
    pub async fn shutdown(self) {
        drop(self.viewports);
        if let Err(err) = self.task.await {
            warn!(error = %err, "session task ended abnormally");
        }
    }
}

async fn run_loop<F: TileFetcher>(
    mut cache: ViewportTileCache,
    fetcher: Arc<F>,
    mut viewports: mpsc::Receiver<Viewport>,
) {
    let (done_tx, mut done_rx) = mpsc::channel::<Completion>(COMPLETION_CHANNEL_CAPACITY);

    loop {
        // precomputed so the disabled branch below never unwraps
        let deadline = cache.next_deadline();
        let sleep_target = deadline
            .map(tokio::time::Instant::from_std)
            .unwrap_or_else(|| tokio::time::Instant::now() + IDLE_SLEEP);

        tokio::select! {
            maybe_viewport = viewports.recv() => match maybe_viewport {
                Some(viewport) => {
                    let now = tokio::time::Instant::now().into_std();
                    let plans = cache.on_viewport_changed(viewport, now);
                    dispatch(&fetcher, &done_tx, plans);
                }
                None => break,
            },
            Some(done) = done_rx.recv() => apply_completion(&mut cache, done),
            _ = tokio::time::sleep_until(sleep_target), if deadline.is_some() => {
                let now = tokio::time::Instant::now().into_std();
                let plans = cache.run_pending(now);
                dispatch(&fetcher, &done_tx, plans);
            }
        }
    }
    debug!(stats = ?cache.stats(), "session loop finished");
}

/// Runs each plan as its own task; results funnel into `done`.
fn dispatch<F: TileFetcher>(
    fetcher: &Arc<F>,
    done: &mpsc::Sender<Completion>,
    plans: Vec<FetchPlan>,
) {
    for plan in plans {
        let fetcher = fetcher.clone();
        let done = done.clone();
        match plan {
            FetchPlan::Spots { key, generation } => {
                tokio::spawn(async move {
                    let result = fetcher.spots_in_tile(key).await;
                    let completion = Completion::Spots {
                        key,
                        generation,
                        result,
                    };
                    if done.send(completion).await.is_err() {
                        debug!(key = %key, "session gone, dropping spot fetch result");
                    }
                });
            }
            FetchPlan::Clusters { keys, generation } => {
                tokio::spawn(async move {
                    let result = fetcher.cluster_tiles(keys.clone()).await;
                    let completion = Completion::Clusters {
                        keys,
                        generation,
                        result,
                    };
                    if done.send(completion).await.is_err() {
                        debug!("session gone, dropping cluster fetch result");
                    }
                });
            }
        }
    }
}

fn apply_completion(cache: &mut ViewportTileCache, done: Completion) {
    match done {
        Completion::Spots {
            key,
            generation,
            result,
        } => cache.complete_spot_fetch(key, generation, result),
        Completion::Clusters {
            keys,
            generation,
            result,
        } => cache.complete_cluster_fetch(&keys, generation, result),
    }
}
