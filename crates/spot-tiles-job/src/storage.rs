//! File-backed implementations of the library storage traits.
//!
//! [`JsonFileStore`] keeps one JSON document per cluster tile in a single
//! directory, named after the tile's canonical key (`z12_2048_1362.json`),
//! so any generation of the pyramid can be inspected with plain shell
//! tools. [`JsonSpotSource`] reads the whole spot corpus from one JSON
//! array file. Both are synchronous; the job runs them from its own batch
//! context.

use spot_tiles_lib::{ClusterTile, Result, SpotRecord, SpotSource, TileError, TileKey, TileStore};

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Tile store over a directory of `{key}.json` documents.
pub struct JsonFileStore {
    root: PathBuf,
}

impl JsonFileStore {
    /// Opens the store directory, creating it if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &TileKey) -> PathBuf {
        self.root.join(format!("{key}.json"))
    }
}

impl TileStore for JsonFileStore {
    fn get_many(&self, keys: &[TileKey]) -> Result<Vec<ClusterTile>> {
        let mut tiles = Vec::with_capacity(keys.len());
        for key in keys {
            let path = self.path_for(key);
            let contents = match fs::read_to_string(&path) {
                Ok(contents) => contents,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            let tile: ClusterTile = serde_json::from_str(&contents)
                .map_err(|err| TileError::Json(format!("{}: {err}", path.display())))?;
            tiles.push(tile);
        }
        Ok(tiles)
    }

    fn set_many(&self, tiles: Vec<ClusterTile>) -> Result<()> {
        for tile in tiles {
            let contents = serde_json::to_string_pretty(&tile)
                .map_err(|err| TileError::Json(err.to_string()))?;
            fs::write(self.path_for(&tile.key()), contents)?;
        }
        Ok(())
    }

    fn delete_many(&self, keys: &[TileKey]) -> Result<()> {
        for key in keys {
            match fs::remove_file(self.path_for(key)) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    fn list_keys(&self) -> Result<Vec<TileKey>> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let stem = path.file_stem().and_then(|stem| stem.to_str());
            match stem.map(str::parse::<TileKey>) {
                Some(Ok(key)) => keys.push(key),
                _ => debug!(path = %path.display(), "ignoring non-tile file"),
            }
        }
        keys.sort_unstable();
        Ok(keys)
    }
}

/// Spot corpus read from one JSON array file.
pub struct JsonSpotSource {
    path: PathBuf,
}

impl JsonSpotSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SpotSource for JsonSpotSource {
    fn load_all(&self) -> Result<Vec<SpotRecord>> {
        let contents = fs::read_to_string(&self.path)?;
        serde_json::from_str(&contents)
            .map_err(|err| TileError::Json(format!("{}: {err}", self.path.display())))
    }
}
