//! Spot Tiles - Tile-Based Spatial Clustering and Viewport Caching
//!
//! This library turns a flat set of located "spots" into a multi-resolution
//! pyramid of precomputed cluster tiles, and keeps a per-map-session cache
//! that loads exactly the tiles a viewport needs. Coarse zooms render
//! aggregated dots from the pyramid; fine zooms render the individual spots,
//! fetched tile by tile. All tile arithmetic is plain slippy-map math with
//! explicit antimeridian wraparound and pole clamping.
//!
//! # Architecture
//!
//! - **[`tile_math`]**: Pure Web-Mercator tile arithmetic, the [`TileKey`]
//!   codec, and the [`TileSpan`] covering/transformation type
//! - **[`ClusterPyramidBuilder`]**: Batch rebuild of the cluster-tile
//!   pyramid from all spots (write new generation, then sweep stale tiles)
//! - **[`ViewportTileCache`]**: Deterministic per-session cache: throttling,
//!   render-mode selection, missing-tile fetch planning, publish suppression
//! - **[`TileSession`]**: Async single-owner driver that feeds viewport
//!   events into the cache and runs its fetch plans on a tokio runtime
//!
//! # Concurrency Model
//!
//! The cache itself is synchronous and single-owner; every mutation happens
//! on one task (or one test thread) with time passed in explicitly. Fetches
//! run concurrently and complete out of order; a monotonically increasing
//! generation counter keeps stale completions from republishing over a newer
//! viewport. The builder runs as one exclusive batch.

mod builder;
mod cache;
mod cluster;
mod model;
mod session;
mod store;
pub mod tile_math;

// Public API exports
pub use builder::{BuildSummary, BuilderConfig, ClusterPyramidBuilder};
pub use cache::{CacheConfig, CacheStats, FetchPlan, RenderMode, TileState, ViewportTileCache};
pub use cluster::{ClusterConfig, ClusterStrategy, RadiusCluster};
pub use model::{
    ClusterDot, ClusterTile, LatLng, LatLngBounds, Marker, RenderSet, Spot, SpotId, SpotRecord,
    Viewport,
};
pub use session::{StoreFetcher, TileFetcher, TileSession};
pub use store::{MemorySpotSource, MemoryTileStore, SpotSource, TileStore};
pub use tile_math::{TileKey, TileSpan};

/// Error types for the tile pipeline
#[derive(Debug, thiserror::Error)]
pub enum TileError {
    #[error("invalid tile key '{0}'")]
    InvalidTileKey(String),

    #[error("tile store error: {0}")]
    Store(String),

    #[error("point query error: {0}")]
    Query(String),

    #[error("JSON error: {0}")]
    Json(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TileError>;
