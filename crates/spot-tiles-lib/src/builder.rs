//! Offline cluster pyramid construction.
//!
//! [`ClusterPyramidBuilder`] reads the whole spot corpus, aggregates it at
//! each pyramid zoom, and replaces the tile store contents in one pass.
//! Every run is a full rebuild: tiles are never patched in place, and new
//! documents are written before any stale ones are removed so readers never
//! observe a half-empty pyramid.

use crate::cluster::{ClusterConfig, ClusterStrategy, RadiusCluster};
use crate::model::{ClusterDot, ClusterTile, Spot};
use crate::store::{SpotSource, TileStore};
use crate::tile_math::{MAX_ZOOM, TileKey};
use crate::Result;

use rayon::prelude::*;
use std::collections::{BTreeMap, HashSet};
use tracing::{info, warn};

/// Tuning for [`ClusterPyramidBuilder`].
#[derive(Debug, Clone)]
pub struct BuilderConfig {
    /// Deepest pyramid zoom; spots are stored one dot per spot here.
    pub base_zoom: u8,
    /// Zoom distance between pyramid levels.
    pub zoom_step: u8,
    /// Coarsest zoom the pyramid may reach.
    pub min_zoom: u8,
    /// Merge radius handed to the default clustering strategy.
    pub radius_px: f64,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            base_zoom: 12,
            zoom_step: 4,
            min_zoom: 4,
            radius_px: 60.0,
        }
    }
}

impl BuilderConfig {
    /// Pyramid zooms from base to coarsest, descending.
    ///
    /// Levels step down by `zoom_step` and never go below `min_zoom`.
    pub fn pyramid_zooms(&self) -> Vec<u8> {
        let base = self.base_zoom.min(MAX_ZOOM);
        let mut zooms = vec![base];
        if self.zoom_step == 0 {
            return zooms;
        }
        let mut zoom = base;
        while zoom >= self.min_zoom.saturating_add(self.zoom_step) {
            zoom -= self.zoom_step;
            zooms.push(zoom);
        }
        zooms
    }
}

/// Outcome of one pyramid rebuild.
#[derive(Debug, Clone, Default)]
pub struct BuildSummary {
    /// Located spots that entered clustering.
    pub spots_clustered: usize,
    /// Records dropped for missing locations.
    pub spots_skipped: usize,
    /// Tiles written across all zooms.
    pub tiles_written: usize,
    /// Tile count per pyramid zoom.
    pub tiles_per_zoom: BTreeMap<u8, usize>,
    /// Stale tiles removed after the write.
    pub stale_deleted: usize,
    /// Stale tiles that could not be removed; the run still succeeds.
    pub delete_failures: usize,
}

/// Builds the multi-zoom cluster pyramid from a spot corpus.
pub struct ClusterPyramidBuilder<S = RadiusCluster> {
    config: BuilderConfig,
    strategy: S,
}

impl ClusterPyramidBuilder<RadiusCluster> {
    pub fn new(config: BuilderConfig) -> Self {
        let strategy = RadiusCluster::new(ClusterConfig {
            radius_px: config.radius_px,
            base_zoom: config.base_zoom,
        });
        Self { config, strategy }
    }
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl<S: ClusterStrategy> ClusterPyramidBuilder<S> {
    pub fn with_strategy(config: BuilderConfig, strategy: S) -> Self {
        Self { config, strategy }
    }

    #[inline]
    pub fn config(&self) -> &BuilderConfig {
        &self.config
    }

    /// Rebuilds the whole pyramid and swaps it into the store.
    ///
    /// Reads every record, clusters each pyramid zoom in parallel, writes
    /// all new tiles, then sweeps keys left over from earlier runs. A
    /// failed sweep is reported in the summary, not as an error.
    pub fn run(&self, source: &dyn SpotSource, store: &dyn TileStore) -> Result<BuildSummary> {
        #[cfg(feature = "profiling")]
        profiling::scope!("builder::run");

        let records = source.load_all()?;
        let record_count = records.len();

        let mut spots: Vec<Spot> = Vec::with_capacity(record_count);
        for record in records {
            match record.location {
                Some(location) => spots.push(Spot {
                    id: record.id,
                    location,
                    weight: record.weight,
                }),
                None => warn!(spot = %record.id, "skipping record without location"),
            }
        }
        let spots_skipped = record_count - spots.len();
        // stable input order so every run produces the same pyramid
        spots.sort_unstable_by(|a, b| a.id.cmp(&b.id));

        let zooms = self.config.pyramid_zooms();
        let per_zoom: Vec<Vec<ClusterTile>> = zooms
            .par_iter()
            .map(|&zoom| self.tiles_for_zoom(&spots, zoom))
            .collect();

        let mut tiles_per_zoom = BTreeMap::new();
        let mut tiles: Vec<ClusterTile> = Vec::new();
        for (zoom, zoom_tiles) in zooms.iter().zip(per_zoom) {
            tiles_per_zoom.insert(*zoom, zoom_tiles.len());
            tiles.extend(zoom_tiles);
        }

        let previous: Vec<TileKey> = store.list_keys()?;
        let fresh: HashSet<TileKey> = tiles.iter().map(ClusterTile::key).collect();
        let tiles_written = tiles.len();
        store.set_many(tiles)?;

        let stale: Vec<TileKey> = previous
            .into_iter()
            .filter(|key| !fresh.contains(key))
            .collect();
        let (stale_deleted, delete_failures) = if stale.is_empty() {
            (0, 0)
        } else {
            match store.delete_many(&stale) {
                Ok(()) => (stale.len(), 0),
                Err(err) => {
                    warn!(error = %err, stale = stale.len(), "stale tile sweep failed");
                    (0, stale.len())
                }
            }
        };

        let summary = BuildSummary {
            spots_clustered: spots.len(),
            spots_skipped,
            tiles_written,
            tiles_per_zoom,
            stale_deleted,
            delete_failures,
        };
        info!(
            spots = summary.spots_clustered,
            skipped = summary.spots_skipped,
            tiles = summary.tiles_written,
            stale_deleted = summary.stale_deleted,
            "pyramid rebuilt"
        );
        Ok(summary)
    }

    /// Clusters one zoom and buckets the dots into their containing tiles.
    ///
    /// Dots are grouped by where their own center lands, not by the tiles
    /// their member spots came from: a merged centroid can drift into a
    /// neighboring tile, and following the centroid keeps every dot stored
    /// exactly once.
    fn tiles_for_zoom(&self, spots: &[Spot], zoom: u8) -> Vec<ClusterTile> {
        #[cfg(feature = "profiling")]
        profiling::scope!("builder::tiles_for_zoom");

        let dots = self.strategy.cluster(spots, zoom);
        let mut buckets: BTreeMap<TileKey, Vec<ClusterDot>> = BTreeMap::new();
        for dot in dots {
            let key = TileKey::for_location(&dot.location, zoom);
            buckets.entry(key).or_default().push(dot);
        }
        buckets
            .into_iter()
            .map(|(key, dots)| ClusterTile::new(key, dots))
            .collect()
    }
}
