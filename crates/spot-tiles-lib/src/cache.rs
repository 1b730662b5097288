//! Viewport-driven tile cache and render-set publisher.
//!
//! [`ViewportTileCache`] is the synchronous heart of the read path. It owns
//! every piece of map state: which tiles are cached or in flight, what the
//! map should currently draw, and the throttle bookkeeping for viewport
//! events. Nothing in here performs I/O or reads the clock; callers pass
//! `now` in and receive [`FetchPlan`]s describing the fetches to run,
//! which keeps every decision in this module deterministic and testable
//! without a runtime.
//!
//! Render output leaves through a `tokio::sync::watch` channel: each
//! publish replaces the previous [`RenderSet`], so a renderer only ever
//! sees the newest state.

use crate::Result;
use crate::model::{ClusterDot, ClusterTile, Marker, RenderSet, Spot, SpotId, Viewport};
use crate::tile_math::{MAX_ZOOM, TileKey, TileSpan};

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Tuning for [`ViewportTileCache`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Minimum spacing between executed viewport updates; later events
    /// inside the window collapse into one trailing update.
    pub throttle: Duration,
    /// Zoom at or above which individual spots are shown. Point tiles are
    /// also stored at this zoom.
    pub point_zoom: u8,
    /// Zoom levels the cluster pyramid is stored at.
    pub pyramid_zooms: Vec<u8>,
    /// Covering sizes above this log a warning.
    pub tile_warn_limit: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            throttle: Duration::from_millis(100),
            point_zoom: 16,
            pyramid_zooms: vec![4, 8, 12],
            tile_warn_limit: 100,
        }
    }
}

/// What kind of entities the current viewport renders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMode {
    /// Individual spots with markers, at or above the point zoom.
    Points,
    /// Aggregated cluster dots from the pyramid.
    Clusters,
}

/// Lifecycle of one tile in the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileState {
    /// Never requested, or reverted after a failed fetch.
    Absent,
    /// A fetch is in flight.
    Loading,
    /// Content arrived; empty content counts as loaded.
    Loaded,
}

/// One fetch the caller should run on behalf of the cache.
///
/// Results come back through [`ViewportTileCache::complete_spot_fetch`] or
/// [`ViewportTileCache::complete_cluster_fetch`] together with the
/// generation stamped here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchPlan {
    /// Load the spots of one point tile.
    Spots { key: TileKey, generation: u64 },
    /// Load a batch of cluster tiles in one round trip.
    Clusters { keys: Vec<TileKey>, generation: u64 },
}

/// Counters exposed for logging and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub executed_updates: u64,
    pub throttled_updates: u64,
    pub publishes: u64,
    pub suppressed_publishes: u64,
    pub fetches_issued: u64,
    pub tiles_loaded: u64,
    pub tiles_failed: u64,
}

enum TileEntry {
    Loading { generation: u64 },
    Spots(Vec<Arc<Spot>>),
    Dots(Vec<Arc<ClusterDot>>),
}

struct CurrentView {
    mode: RenderMode,
    covering: BTreeSet<TileKey>,
    viewport: Viewport,
}

struct Published {
    mode: RenderMode,
    covering: BTreeSet<TileKey>,
    revision: u64,
}

/// Single-owner cache mapping viewports to tile fetches and render sets.
///
/// All methods take `&mut self`; concurrent use is the caller's concern
/// (see `TileSession` for the async driver). Entities are interned per
/// spot id, so a spot that survives across publishes keeps its exact
/// `Arc` identity and renderers can diff by pointer.
pub struct ViewportTileCache {
    config: CacheConfig,
    entries: HashMap<TileKey, TileEntry>,
    spot_identities: HashMap<SpotId, Arc<Spot>>,
    marker_identities: HashMap<SpotId, Arc<Marker>>,
    /// Bumped once per executed viewport update; stamps fetch plans.
    generation: u64,
    /// Bumped on every content change; part of the publish fingerprint.
    revision: u64,
    last_run: Option<Instant>,
    pending: Option<Viewport>,
    deadline: Option<Instant>,
    current: Option<CurrentView>,
    published: Option<Published>,
    publisher: watch::Sender<RenderSet>,
    stats: CacheStats,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl ViewportTileCache {
    pub fn new(config: CacheConfig) -> Self {
        let mut config = config;
        config.pyramid_zooms.sort_unstable();
        config.pyramid_zooms.dedup();
        if config.pyramid_zooms.is_empty() {
            warn!("no pyramid zooms configured, using defaults");
            config.pyramid_zooms = CacheConfig::default().pyramid_zooms;
        }
        let (publisher, _) = watch::channel(RenderSet::default());
        Self {
            config,
            entries: HashMap::new(),
            spot_identities: HashMap::new(),
            marker_identities: HashMap::new(),
            generation: 0,
            revision: 0,
            last_run: None,
            pending: None,
            deadline: None,
            current: None,
            published: None,
            publisher,
            stats: CacheStats::default(),
        }
    }

    /// Subscribes to render-set publishes; the receiver always holds the
    /// newest published set.
    pub fn render_sets(&self) -> watch::Receiver<RenderSet> {
        self.publisher.subscribe()
    }

    #[inline]
    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Lifecycle state of one tile.
    pub fn tile_state(&self, key: &TileKey) -> TileState {
        match self.entries.get(key) {
            None => TileState::Absent,
            Some(TileEntry::Loading { .. }) => TileState::Loading,
            Some(_) => TileState::Loaded,
        }
    }

    /// When the trailing throttled update should run, if one is queued.
    #[inline]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Viewport of the last executed update.
    pub fn current_viewport(&self) -> Option<Viewport> {
        self.current.as_ref().map(|view| view.viewport)
    }

    pub fn current_mode(&self) -> Option<RenderMode> {
        self.current.as_ref().map(|view| view.mode)
    }

    /// Handles a viewport movement observed at `now`.
    ///
    /// Inside the throttle window the viewport is parked in the single
    /// trailing slot (replacing any previous one) and no fetches are
    /// planned; otherwise the update executes immediately.
    pub fn on_viewport_changed(&mut self, viewport: Viewport, now: Instant) -> Vec<FetchPlan> {
        match self.last_run {
            Some(last) if now.duration_since(last) < self.config.throttle => {
                self.pending = Some(viewport);
                self.deadline = Some(last + self.config.throttle);
                self.stats.throttled_updates += 1;
                Vec::new()
            }
            _ => self.execute_update(viewport, now),
        }
    }

    /// Executes the parked trailing update, if any.
    pub fn run_pending(&mut self, now: Instant) -> Vec<FetchPlan> {
        match self.pending.take() {
            Some(viewport) => self.execute_update(viewport, now),
            None => {
                self.deadline = None;
                Vec::new()
            }
        }
    }

    /// Visible tiles that are not yet loaded for `viewport`.
    ///
    /// Pure query: does not touch the throttle, the tile table, or the
    /// published render set.
    pub fn missing_tiles(&self, viewport: &Viewport) -> Vec<TileKey> {
        let (_, covering) = self.covering_for(viewport);
        covering
            .into_iter()
            .filter(|key| self.tile_state(key) != TileState::Loaded)
            .collect()
    }

    /// Records the outcome of a [`FetchPlan::Spots`] fetch.
    ///
    /// Success stores the tile and republishes when it affects the current
    /// view. Failure reverts the tile to absent so a later update retries
    /// it, unless newer content already landed.
    pub fn complete_spot_fetch(
        &mut self,
        key: TileKey,
        generation: u64,
        result: Result<Vec<Spot>>,
    ) {
        match result {
            Ok(spots) => {
                let interned: Vec<Arc<Spot>> =
                    spots.into_iter().map(|spot| self.intern_spot(spot)).collect();
                self.entries.insert(key, TileEntry::Spots(interned));
                self.revision += 1;
                self.stats.tiles_loaded += 1;
                self.republish_if_relevant(generation, &[key]);
            }
            Err(err) => {
                warn!(key = %key, error = %err, "point tile fetch failed");
                self.stats.tiles_failed += 1;
                self.revert_loading(&key, generation);
            }
        }
    }

    /// Records the outcome of a [`FetchPlan::Clusters`] fetch.
    ///
    /// Requested keys missing from the result are stored as empty tiles;
    /// empty is a loaded state, not a retry trigger.
    pub fn complete_cluster_fetch(
        &mut self,
        keys: &[TileKey],
        generation: u64,
        result: Result<Vec<ClusterTile>>,
    ) {
        match result {
            Ok(tiles) => {
                let mut by_key: HashMap<TileKey, Vec<Arc<ClusterDot>>> = HashMap::new();
                for tile in tiles {
                    let key = tile.key();
                    by_key.insert(key, tile.dots.into_iter().map(Arc::new).collect());
                }
                for key in keys {
                    let dots = by_key.remove(key).unwrap_or_default();
                    self.entries.insert(*key, TileEntry::Dots(dots));
                }
                self.revision += 1;
                self.stats.tiles_loaded += keys.len() as u64;
                self.republish_if_relevant(generation, keys);
            }
            Err(err) => {
                warn!(tiles = keys.len(), error = %err, "cluster tile fetch failed");
                self.stats.tiles_failed += keys.len() as u64;
                for key in keys {
                    self.revert_loading(key, generation);
                }
            }
        }
    }

    fn execute_update(&mut self, viewport: Viewport, now: Instant) -> Vec<FetchPlan> {
        #[cfg(feature = "profiling")]
        profiling::scope!("cache::execute_update");

        self.pending = None;
        self.deadline = None;
        self.last_run = Some(now);
        self.generation += 1;
        self.stats.executed_updates += 1;

        let (mode, covering) = self.covering_for(&viewport);
        if covering.len() > self.config.tile_warn_limit {
            warn!(
                tiles = covering.len(),
                zoom = viewport.zoom,
                "viewport covers unusually many tiles"
            );
        }

        let missing: Vec<TileKey> = covering
            .iter()
            .copied()
            .filter(|key| !self.entries.contains_key(key))
            .collect();
        for key in &missing {
            self.entries.insert(
                *key,
                TileEntry::Loading {
                    generation: self.generation,
                },
            );
        }

        let plans = match mode {
            RenderMode::Points => missing
                .iter()
                .map(|&key| FetchPlan::Spots {
                    key,
                    generation: self.generation,
                })
                .collect(),
            RenderMode::Clusters => {
                if missing.is_empty() {
                    Vec::new()
                } else {
                    vec![FetchPlan::Clusters {
                        keys: missing,
                        generation: self.generation,
                    }]
                }
            }
        };
        self.stats.fetches_issued += plans.len() as u64;
        debug!(
            zoom = viewport.zoom,
            mode = ?mode,
            covering = covering.len(),
            plans = plans.len(),
            "viewport update executed"
        );

        self.current = Some(CurrentView {
            mode,
            covering,
            viewport,
        });
        self.publish_for_current();
        plans
    }

    /// Covering tiles and render mode for a viewport, without side effects.
    fn covering_for(&self, viewport: &Viewport) -> (RenderMode, BTreeSet<TileKey>) {
        let span = TileSpan::from_bounds(&viewport.bbox, viewport.tile_zoom());
        let (mode, target) = if viewport.zoom >= f64::from(self.config.point_zoom) {
            (RenderMode::Points, self.config.point_zoom)
        } else {
            (RenderMode::Clusters, self.cluster_zoom_for(viewport.zoom))
        };
        let covering = span.at_zoom(target).tiles().iter().copied().collect();
        (mode, covering)
    }

    /// Deepest pyramid zoom not finer than the viewport, or the coarsest
    /// level when the viewport sits below the whole pyramid.
    fn cluster_zoom_for(&self, zoom: f64) -> u8 {
        let floor = zoom.floor().clamp(0.0, f64::from(MAX_ZOOM)) as u8;
        self.config
            .pyramid_zooms
            .iter()
            .rev()
            .find(|&&level| level <= floor)
            .copied()
            .unwrap_or(self.config.pyramid_zooms[0])
    }

    /// Rebuilds and publishes the render set for the current view.
    ///
    /// Point mode publishes immediately, including partial content while
    /// tiles are still loading. Cluster mode holds the previous render
    /// while the new view has no dots yet, so panning never blanks the
    /// map. A publish identical to the previous one (same mode, covering
    /// and revision) is suppressed.
    fn publish_for_current(&mut self) {
        let (mode, covering) = match &self.current {
            Some(view) => (view.mode, view.covering.clone()),
            None => return,
        };

        let render = match mode {
            RenderMode::Points => {
                let mut points: Vec<Arc<Spot>> = Vec::new();
                for key in &covering {
                    if let Some(TileEntry::Spots(spots)) = self.entries.get(key) {
                        points.extend(spots.iter().cloned());
                    }
                }
                let markers = points.iter().map(|spot| self.marker_for(spot)).collect();
                RenderSet {
                    points,
                    dots: Vec::new(),
                    markers,
                }
            }
            RenderMode::Clusters => {
                let mut dots: Vec<Arc<ClusterDot>> = Vec::new();
                let mut unloaded = 0usize;
                for key in &covering {
                    match self.entries.get(key) {
                        Some(TileEntry::Dots(tile_dots)) => {
                            dots.extend(tile_dots.iter().cloned());
                        }
                        Some(TileEntry::Spots(_)) => {}
                        _ => unloaded += 1,
                    }
                }
                if dots.is_empty() && unloaded > 0 {
                    debug!(pending = unloaded, "holding previous render until dots arrive");
                    return;
                }
                RenderSet {
                    points: Vec::new(),
                    dots,
                    markers: Vec::new(),
                }
            }
        };

        if let Some(published) = &self.published {
            if published.mode == mode
                && published.revision == self.revision
                && published.covering == covering
            {
                self.stats.suppressed_publishes += 1;
                return;
            }
        }

        self.publisher.send_replace(render);
        self.published = Some(Published {
            mode,
            covering,
            revision: self.revision,
        });
        self.stats.publishes += 1;
    }

    /// Republishes after a completion that matters to the current view:
    /// same generation as the running update, or touching a tile the view
    /// covers.
    fn republish_if_relevant(&mut self, generation: u64, keys: &[TileKey]) {
        let relevant = match &self.current {
            Some(view) => {
                generation == self.generation
                    || keys.iter().any(|key| view.covering.contains(key))
            }
            None => false,
        };
        if relevant {
            self.publish_for_current();
        }
    }

    /// Drops a loading marker owned by `generation` so the tile can be
    /// refetched. Loaded content and newer in-flight markers stay.
    fn revert_loading(&mut self, key: &TileKey, generation: u64) {
        let owned = matches!(
            self.entries.get(key),
            Some(TileEntry::Loading { generation: owner }) if *owner == generation
        );
        if owned {
            self.entries.remove(key);
        }
    }

    /// First intern wins: a spot id seen again keeps its original `Arc`.
    fn intern_spot(&mut self, spot: Spot) -> Arc<Spot> {
        match self.spot_identities.get(&spot.id) {
            Some(existing) => existing.clone(),
            None => {
                let spot = Arc::new(spot);
                self.spot_identities.insert(spot.id.clone(), spot.clone());
                spot
            }
        }
    }

    fn marker_for(&mut self, spot: &Arc<Spot>) -> Arc<Marker> {
        match self.marker_identities.get(&spot.id) {
            Some(existing) => existing.clone(),
            None => {
                let marker = Arc::new(Marker {
                    spot_id: spot.id.clone(),
                    location: spot.location,
                });
                self.marker_identities.insert(spot.id.clone(), marker.clone());
                marker
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LatLng, LatLngBounds, SpotRecord};

    fn bounds_around(lat: f64, lng: f64, half_span: f64) -> LatLngBounds {
        LatLngBounds::new(lat + half_span, lat - half_span, lng + half_span, lng - half_span)
    }

    fn barcelona_viewport(zoom: f64) -> Viewport {
        Viewport::new(zoom, bounds_around(41.39, 2.17, 0.02))
    }

    fn sydney_viewport(zoom: f64) -> Viewport {
        Viewport::new(zoom, bounds_around(-33.87, 151.21, 0.02))
    }

    fn spot(id: &str, lat: f64, lng: f64) -> Spot {
        Spot::new(id, LatLng::new(lat, lng))
    }

    fn dot_tile(key: TileKey, weight: u64) -> ClusterTile {
        let center = key.bounds().center();
        ClusterTile::new(
            key,
            vec![ClusterDot {
                location: center,
                weight,
                source_id: None,
            }],
        )
    }

    fn spot_plan_keys(plans: &[FetchPlan]) -> Vec<TileKey> {
        plans
            .iter()
            .map(|plan| match plan {
                FetchPlan::Spots { key, .. } => *key,
                other => panic!("expected spot plan, got {other:?}"),
            })
            .collect()
    }

    fn cluster_plan(plans: &[FetchPlan]) -> (Vec<TileKey>, u64) {
        assert_eq!(plans.len(), 1, "expected one cluster plan: {plans:?}");
        match &plans[0] {
            FetchPlan::Clusters { keys, generation } => (keys.clone(), *generation),
            other => panic!("expected cluster plan, got {other:?}"),
        }
    }

    #[test]
    fn test_point_mode_starts_at_threshold() {
        let mut cache = ViewportTileCache::new(CacheConfig::default());
        let now = Instant::now();

        let plans = cache.on_viewport_changed(barcelona_viewport(16.0), now);
        for key in spot_plan_keys(&plans) {
            assert_eq!(key.zoom, 16);
        }
        assert_eq!(cache.current_mode(), Some(RenderMode::Points));

        let mut cache = ViewportTileCache::new(CacheConfig::default());
        let plans = cache.on_viewport_changed(barcelona_viewport(15.999), now);
        let (keys, _) = cluster_plan(&plans);
        assert!(keys.iter().all(|key| key.zoom == 12));
        assert_eq!(cache.current_mode(), Some(RenderMode::Clusters));
    }

    #[test]
    fn test_cluster_zoom_selection() {
        let cache = ViewportTileCache::new(CacheConfig::default());
        assert_eq!(cache.cluster_zoom_for(13.7), 12);
        assert_eq!(cache.cluster_zoom_for(12.0), 12);
        assert_eq!(cache.cluster_zoom_for(10.3), 8);
        assert_eq!(cache.cluster_zoom_for(4.0), 4);
        // below the whole pyramid, fall back to its coarsest level
        assert_eq!(cache.cluster_zoom_for(2.5), 4);
    }

    #[test]
    fn test_viewport_below_pyramid_fetches_finer_tiles() {
        let mut cache = ViewportTileCache::new(CacheConfig::default());
        let plans = cache.on_viewport_changed(barcelona_viewport(2.5), Instant::now());
        let (keys, _) = cluster_plan(&plans);
        assert!(!keys.is_empty());
        assert!(keys.iter().all(|key| key.zoom == 4));
        // the finer covering still contains the viewport center
        let center = TileKey::for_location(&LatLng::new(41.39, 2.17), 4);
        assert!(keys.contains(&center));
    }

    #[test]
    fn test_first_update_executes_immediately() {
        let mut cache = ViewportTileCache::new(CacheConfig::default());
        let plans = cache.on_viewport_changed(barcelona_viewport(16.5), Instant::now());
        assert!(!plans.is_empty());
        assert_eq!(cache.stats().executed_updates, 1);
        assert_eq!(cache.stats().throttled_updates, 0);
        assert!(cache.next_deadline().is_none());
    }

    #[test]
    fn test_rapid_updates_collapse_into_trailing_slot() {
        let mut cache = ViewportTileCache::new(CacheConfig::default());
        let t0 = Instant::now();

        let first = cache.on_viewport_changed(barcelona_viewport(16.5), t0);
        assert!(!first.is_empty());

        let second =
            cache.on_viewport_changed(sydney_viewport(16.5), t0 + Duration::from_millis(10));
        assert!(second.is_empty());
        assert_eq!(cache.next_deadline(), Some(t0 + Duration::from_millis(100)));

        // newest viewport replaces the parked one
        let third =
            cache.on_viewport_changed(barcelona_viewport(10.0), t0 + Duration::from_millis(20));
        assert!(third.is_empty());
        assert_eq!(cache.stats().throttled_updates, 2);

        let trailing = cache.run_pending(t0 + Duration::from_millis(100));
        let (keys, _) = cluster_plan(&trailing);
        assert!(keys.iter().all(|key| key.zoom == 8), "got {keys:?}");
        assert_eq!(cache.stats().executed_updates, 2);
        assert!(cache.next_deadline().is_none());

        // nothing left to run
        assert!(cache.run_pending(t0 + Duration::from_millis(200)).is_empty());
    }

    #[test]
    fn test_point_tiles_publish_partially() {
        let mut cache = ViewportTileCache::new(CacheConfig::default());
        let rx = cache.render_sets();
        let now = Instant::now();

        let plans = cache.on_viewport_changed(barcelona_viewport(17.0), now);
        let keys = spot_plan_keys(&plans);
        assert!(keys.len() >= 2, "viewport too small for the test: {keys:?}");
        let generation = match plans[0] {
            FetchPlan::Spots { generation, .. } => generation,
            _ => unreachable!(),
        };

        // first tile arrives, the rest still loading
        let center = keys[0].bounds().center();
        cache.complete_spot_fetch(
            keys[0],
            generation,
            Ok(vec![spot("s1", center.lat, center.lng)]),
        );
        let render = rx.borrow().clone();
        assert_eq!(render.points.len(), 1);
        assert_eq!(render.markers.len(), 1);
        assert_eq!(render.markers[0].spot_id, SpotId::from("s1"));
        assert_eq!(cache.tile_state(&keys[1]), TileState::Loading);
    }

    #[test]
    fn test_spot_identity_survives_republishes() {
        let mut cache = ViewportTileCache::new(CacheConfig::default());
        let rx = cache.render_sets();
        let now = Instant::now();

        let plans = cache.on_viewport_changed(barcelona_viewport(17.0), now);
        let keys = spot_plan_keys(&plans);
        let generation = match plans[0] {
            FetchPlan::Spots { generation, .. } => generation,
            _ => unreachable!(),
        };
        let center = keys[0].bounds().center();
        cache.complete_spot_fetch(
            keys[0],
            generation,
            Ok(vec![spot("stable", center.lat, center.lng)]),
        );

        let first_spot = rx.borrow().points[0].clone();
        let first_marker = rx.borrow().markers[0].clone();

        // complete the remaining tiles to force more publishes
        for key in &keys[1..] {
            cache.complete_spot_fetch(*key, generation, Ok(vec![]));
        }
        let render = rx.borrow().clone();
        assert!(Arc::ptr_eq(&first_spot, &render.points[0]));
        assert!(Arc::ptr_eq(&first_marker, &render.markers[0]));

        // a refetch of the same id keeps the original instance
        cache.complete_spot_fetch(
            keys[0],
            generation,
            Ok(vec![spot("stable", center.lat, center.lng)]),
        );
        assert!(Arc::ptr_eq(&first_spot, &rx.borrow().points[0]));
    }

    #[test]
    fn test_identical_covering_publishes_once() {
        let mut cache = ViewportTileCache::new(CacheConfig::default());
        let now = Instant::now();

        let plans = cache.on_viewport_changed(barcelona_viewport(16.2), now);
        let generation = match plans[0] {
            FetchPlan::Spots { generation, .. } => generation,
            _ => unreachable!(),
        };
        for key in spot_plan_keys(&plans) {
            cache.complete_spot_fetch(key, generation, Ok(vec![]));
        }
        let publishes_before = cache.stats().publishes;

        // same viewport after the throttle window: content unchanged
        let plans = cache.on_viewport_changed(
            barcelona_viewport(16.2),
            now + Duration::from_millis(200),
        );
        assert!(plans.is_empty(), "no refetch for loaded tiles");
        assert_eq!(cache.stats().publishes, publishes_before);
        assert_eq!(cache.stats().suppressed_publishes, 1);
    }

    #[test]
    fn test_failed_fetch_reverts_and_retries() {
        let mut cache = ViewportTileCache::new(CacheConfig::default());
        let now = Instant::now();

        let plans = cache.on_viewport_changed(barcelona_viewport(16.5), now);
        let keys = spot_plan_keys(&plans);
        let generation = match plans[0] {
            FetchPlan::Spots { generation, .. } => generation,
            _ => unreachable!(),
        };

        cache.complete_spot_fetch(
            keys[0],
            generation,
            Err(crate::TileError::Query("backend offline".into())),
        );
        assert_eq!(cache.tile_state(&keys[0]), TileState::Absent);
        assert_eq!(cache.stats().tiles_failed, 1);

        // the next update plans the tile again
        let retry = cache.on_viewport_changed(
            barcelona_viewport(16.5),
            now + Duration::from_millis(200),
        );
        assert!(spot_plan_keys(&retry).contains(&keys[0]));
    }

    #[test]
    fn test_stale_failure_does_not_clobber_loaded_tile() {
        let mut cache = ViewportTileCache::new(CacheConfig::default());
        let now = Instant::now();

        let plans = cache.on_viewport_changed(barcelona_viewport(16.5), now);
        let keys = spot_plan_keys(&plans);
        let generation = match plans[0] {
            FetchPlan::Spots { generation, .. } => generation,
            _ => unreachable!(),
        };

        cache.complete_spot_fetch(keys[0], generation, Ok(vec![]));
        assert_eq!(cache.tile_state(&keys[0]), TileState::Loaded);

        // duplicate failure from the same fetch arrives late
        cache.complete_spot_fetch(
            keys[0],
            generation,
            Err(crate::TileError::Query("late duplicate".into())),
        );
        assert_eq!(cache.tile_state(&keys[0]), TileState::Loaded);
    }

    #[test]
    fn test_cluster_render_holds_until_dots_arrive() {
        let mut cache = ViewportTileCache::new(CacheConfig::default());
        let rx = cache.render_sets();
        let t0 = Instant::now();

        let plans = cache.on_viewport_changed(barcelona_viewport(11.0), t0);
        let (keys, generation) = cluster_plan(&plans);
        let tiles: Vec<ClusterTile> = keys.iter().map(|&key| dot_tile(key, 3)).collect();
        cache.complete_cluster_fetch(&keys, generation, Ok(tiles));
        let first_dots = rx.borrow().dots.len();
        assert!(first_dots > 0);

        // pan elsewhere: new tiles are loading, previous dots stay up
        let plans =
            cache.on_viewport_changed(sydney_viewport(11.0), t0 + Duration::from_millis(200));
        let (new_keys, new_generation) = cluster_plan(&plans);
        assert_eq!(rx.borrow().dots.len(), first_dots);

        let tiles: Vec<ClusterTile> = new_keys.iter().map(|&key| dot_tile(key, 7)).collect();
        cache.complete_cluster_fetch(&new_keys, new_generation, Ok(tiles));
        let render = rx.borrow().clone();
        assert_eq!(render.dots.len(), new_keys.len());
        assert!(render.dots.iter().all(|dot| dot.weight == 7));
    }

    #[test]
    fn test_empty_cluster_tiles_are_loaded_and_publish_empty() {
        let mut cache = ViewportTileCache::new(CacheConfig::default());
        let rx = cache.render_sets();
        let t0 = Instant::now();

        let plans = cache.on_viewport_changed(barcelona_viewport(11.0), t0);
        let (keys, generation) = cluster_plan(&plans);
        // backend has no documents for this area at all
        cache.complete_cluster_fetch(&keys, generation, Ok(vec![]));

        for key in &keys {
            assert_eq!(cache.tile_state(key), TileState::Loaded);
        }
        assert!(rx.borrow().dots.is_empty());
        assert!(cache.stats().publishes >= 1, "empty area still publishes");

        // loaded-empty tiles are not refetched
        let retry =
            cache.on_viewport_changed(barcelona_viewport(11.0), t0 + Duration::from_millis(200));
        assert!(retry.is_empty());
    }

    #[test]
    fn test_stale_completion_cached_then_served_without_refetch() {
        let mut cache = ViewportTileCache::new(CacheConfig::default());
        let rx = cache.render_sets();
        let t0 = Instant::now();

        let plans = cache.on_viewport_changed(barcelona_viewport(11.0), t0);
        let (bcn_keys, bcn_generation) = cluster_plan(&plans);

        // user pans away before the fetch lands
        let plans =
            cache.on_viewport_changed(sydney_viewport(11.0), t0 + Duration::from_millis(200));
        let (syd_keys, _) = cluster_plan(&plans);
        assert!(bcn_keys.iter().all(|key| !syd_keys.contains(key)));

        // the Barcelona result arrives late: cached, but nothing published
        let publishes_before = cache.stats().publishes;
        let tiles: Vec<ClusterTile> = bcn_keys.iter().map(|&key| dot_tile(key, 5)).collect();
        cache.complete_cluster_fetch(&bcn_keys, bcn_generation, Ok(tiles));
        assert_eq!(cache.stats().publishes, publishes_before);
        for key in &bcn_keys {
            assert_eq!(cache.tile_state(key), TileState::Loaded);
        }

        // panning back serves the cached tiles with no new fetch
        let plans =
            cache.on_viewport_changed(barcelona_viewport(11.0), t0 + Duration::from_millis(400));
        assert!(plans.is_empty());
        let render = rx.borrow().clone();
        assert_eq!(render.dots.len(), bcn_keys.len());
        assert!(render.dots.iter().all(|dot| dot.weight == 5));
    }

    #[test]
    fn test_missing_tiles_is_pure() {
        let mut cache = ViewportTileCache::new(CacheConfig::default());
        let viewport = barcelona_viewport(11.0);

        let missing = cache.missing_tiles(&viewport);
        assert!(!missing.is_empty());
        assert_eq!(cache.missing_tiles(&viewport), missing);
        assert_eq!(cache.stats().executed_updates, 0);
        assert_eq!(cache.stats().fetches_issued, 0);
        for key in &missing {
            assert_eq!(cache.tile_state(key), TileState::Absent);
        }

        // after loading, the same query reports nothing missing
        let plans = cache.on_viewport_changed(viewport, Instant::now());
        let (keys, generation) = cluster_plan(&plans);
        assert_eq!(keys, missing);
        cache.complete_cluster_fetch(&keys, generation, Ok(vec![]));
        assert!(cache.missing_tiles(&viewport).is_empty());
    }

    #[test]
    fn test_full_longitude_viewport_covers_all_columns() {
        let mut cache = ViewportTileCache::new(CacheConfig::default());
        let viewport = Viewport::new(5.0, LatLngBounds::new(45.0, 35.0, 7.0, 7.0));

        let plans = cache.on_viewport_changed(viewport, Instant::now());
        let (keys, _) = cluster_plan(&plans);
        let mut columns: Vec<u32> = keys.iter().map(|key| key.x).collect();
        columns.sort_unstable();
        columns.dedup();
        assert_eq!(columns, (0..16).collect::<Vec<u32>>());
    }

    #[test]
    fn test_unsorted_pyramid_config_is_normalized() {
        let config = CacheConfig {
            pyramid_zooms: vec![12, 4, 8, 12],
            ..Default::default()
        };
        let cache = ViewportTileCache::new(config);
        assert_eq!(cache.config.pyramid_zooms, vec![4, 8, 12]);

        let empty = CacheConfig {
            pyramid_zooms: Vec::new(),
            ..Default::default()
        };
        let cache = ViewportTileCache::new(empty);
        assert_eq!(cache.config.pyramid_zooms, vec![4, 8, 12]);
    }

    #[test]
    fn test_spot_record_feeds_spot_completion() {
        // SpotRecord is the storage shape; the cache only sees located spots
        let record = SpotRecord::new("r1", Some(LatLng::new(41.0, 2.0)));
        let spot = record.into_spot().unwrap();
        let mut cache = ViewportTileCache::new(CacheConfig::default());
        let key = TileKey::for_location(&spot.location, 16);
        let viewport = Viewport::new(17.0, key.bounds());

        let plans = cache.on_viewport_changed(viewport, Instant::now());
        let generation = match plans[0] {
            FetchPlan::Spots { generation, .. } => generation,
            _ => unreachable!(),
        };
        cache.complete_spot_fetch(key, generation, Ok(vec![spot]));
        assert_eq!(cache.tile_state(&key), TileState::Loaded);
    }
}
