//! Storage seams: where spots come from and where cluster tiles live.
//!
//! The builder and cache only ever talk to these traits, so backends are
//! swappable without touching the algorithms. The in-memory implementations
//! here back the test suites and small deployments; `spot-tiles-job` ships a
//! JSON-file pair for batch runs.

use crate::Result;
use crate::model::{ClusterTile, SpotRecord};
use crate::tile_math::TileKey;

use std::collections::BTreeMap;
use std::sync::Mutex;

/// Read side of the spot corpus.
pub trait SpotSource: Send + Sync {
    /// Loads every spot record, located or not.
    fn load_all(&self) -> Result<Vec<SpotRecord>>;
}

/// Keyed storage for precomputed cluster tiles.
///
/// Implementations take `&self`; shared access is an interior concern of
/// the backend.
pub trait TileStore: Send + Sync {
    /// Fetches one tile, if stored.
    fn get(&self, key: &TileKey) -> Result<Option<ClusterTile>> {
        Ok(self.get_many(std::slice::from_ref(key))?.into_iter().next())
    }

    /// Fetches the tiles that exist among `keys`; absent keys are skipped.
    fn get_many(&self, keys: &[TileKey]) -> Result<Vec<ClusterTile>>;

    /// Writes all `tiles`, replacing any previous document per key.
    fn set_many(&self, tiles: Vec<ClusterTile>) -> Result<()>;

    /// Removes the given keys; absent keys are not an error.
    fn delete_many(&self, keys: &[TileKey]) -> Result<()>;

    /// Every key currently stored, in canonical order.
    fn list_keys(&self) -> Result<Vec<TileKey>>;
}

/// Fixed in-memory spot corpus.
#[derive(Debug, Default)]
pub struct MemorySpotSource {
    records: Vec<SpotRecord>,
}

impl MemorySpotSource {
    pub fn new(records: Vec<SpotRecord>) -> Self {
        Self { records }
    }
}

impl SpotSource for MemorySpotSource {
    fn load_all(&self) -> Result<Vec<SpotRecord>> {
        Ok(self.records.clone())
    }
}

/// In-memory tile store over a sorted map.
#[derive(Debug, Default)]
pub struct MemoryTileStore {
    tiles: Mutex<BTreeMap<TileKey, ClusterTile>>,
}

impl MemoryTileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored tiles.
    pub fn len(&self) -> usize {
        self.tiles.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TileStore for MemoryTileStore {
    fn get_many(&self, keys: &[TileKey]) -> Result<Vec<ClusterTile>> {
        let tiles = self.tiles.lock().unwrap();
        Ok(keys.iter().filter_map(|key| tiles.get(key).cloned()).collect())
    }

    fn set_many(&self, tiles: Vec<ClusterTile>) -> Result<()> {
        let mut stored = self.tiles.lock().unwrap();
        for tile in tiles {
            stored.insert(tile.key(), tile);
        }
        Ok(())
    }

    fn delete_many(&self, keys: &[TileKey]) -> Result<()> {
        let mut stored = self.tiles.lock().unwrap();
        for key in keys {
            stored.remove(key);
        }
        Ok(())
    }

    fn list_keys(&self) -> Result<Vec<TileKey>> {
        Ok(self.tiles.lock().unwrap().keys().copied().collect())
    }
}
