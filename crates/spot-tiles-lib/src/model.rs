//! Value types shared across the crate: geographic primitives, spot and
//! cluster documents, viewports, and the published render set.
//!
//! The persisted shapes ([`Spot`], [`SpotRecord`], [`ClusterTile`]) derive
//! serde and are what the stores read and write; everything else is
//! in-memory only.

use crate::tile_math::{self, TileKey};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Identifier of a spot document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpotId(pub String);

impl SpotId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SpotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SpotId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for SpotId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A geographic coordinate in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

impl LatLng {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

/// A geographic rectangle in degrees.
///
/// `west > east` means the rectangle crosses the antimeridian; all longitude
/// logic here is wrap-aware.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLngBounds {
    pub north: f64,
    pub south: f64,
    pub east: f64,
    pub west: f64,
}

impl LatLngBounds {
    pub fn new(north: f64, south: f64, east: f64, west: f64) -> Self {
        Self {
            north,
            south,
            east,
            west,
        }
    }

    /// Longitude span in degrees, accounting for antimeridian crossing.
    #[inline]
    pub fn lng_span(&self) -> f64 {
        if self.east >= self.west {
            self.east - self.west
        } else {
            self.east - self.west + 360.0
        }
    }

    /// True when the rectangle covers every longitude.
    ///
    /// `west == east` is read as the degenerate full-world wrap, not as an
    /// empty rectangle.
    #[inline]
    pub fn is_full_longitude(&self) -> bool {
        self.west == self.east || self.lng_span() >= 360.0
    }

    /// True when the location lies inside the rectangle (edges inclusive).
    pub fn contains(&self, location: &LatLng) -> bool {
        if location.lat > self.north || location.lat < self.south {
            return false;
        }
        if self.is_full_longitude() {
            return true;
        }
        if self.east >= self.west {
            location.lng >= self.west && location.lng <= self.east
        } else {
            location.lng >= self.west || location.lng <= self.east
        }
    }

    /// Geographic midpoint (longitude wrap-aware).
    pub fn center(&self) -> LatLng {
        let lat = (self.north + self.south) / 2.0;
        let lng = if self.east >= self.west {
            (self.east + self.west) / 2.0
        } else {
            let mid = (self.east + self.west + 360.0) / 2.0;
            if mid > 180.0 { mid - 360.0 } else { mid }
        };
        LatLng::new(lat, lng)
    }
}

fn default_weight() -> u32 {
    1
}

/// A located entity of interest; the unit the pyramid aggregates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spot {
    pub id: SpotId,
    pub location: LatLng,
    /// Contribution to cluster weights; 1 unless the source says otherwise.
    #[serde(default = "default_weight")]
    pub weight: u32,
}

impl Spot {
    pub fn new(id: impl Into<SpotId>, location: LatLng) -> Self {
        Self {
            id: id.into(),
            location,
            weight: 1,
        }
    }
}

/// Raw spot document as read by the builder.
///
/// `location` may be missing in source data; such records are skipped (and
/// logged) by the builder rather than aborting the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpotRecord {
    pub id: SpotId,
    #[serde(default)]
    pub location: Option<LatLng>,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

impl SpotRecord {
    pub fn new(id: impl Into<SpotId>, location: Option<LatLng>) -> Self {
        Self {
            id: id.into(),
            location,
            weight: 1,
        }
    }

    /// The located spot, or `None` for a record with no location.
    pub fn into_spot(self) -> Option<Spot> {
        let location = self.location?;
        Some(Spot {
            id: self.id,
            location,
            weight: self.weight,
        })
    }
}

/// Aggregated representation of one or more spots inside a cluster tile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterDot {
    pub location: LatLng,
    /// Summed weight of the underlying spots.
    pub weight: u64,
    /// Set only when the dot represents exactly one spot, enabling direct
    /// click-through; `None` otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<SpotId>,
}

/// One precomputed aggregation document per (zoom, x, y).
///
/// Replaced wholesale on every pyramid rebuild, never partially mutated.
/// The document is stored under the canonical string form of its
/// [`TileKey`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterTile {
    pub zoom: u8,
    pub x: u32,
    pub y: u32,
    pub dots: Vec<ClusterDot>,
}

impl ClusterTile {
    pub fn new(key: TileKey, dots: Vec<ClusterDot>) -> Self {
        Self {
            zoom: key.zoom,
            x: key.x,
            y: key.y,
            dots,
        }
    }

    #[inline]
    pub fn key(&self) -> TileKey {
        TileKey::new(self.zoom, self.x, self.y)
    }

    /// Summed weight of all dots in this tile.
    pub fn total_weight(&self) -> u64 {
        self.dots.iter().map(|dot| dot.weight).sum()
    }
}

/// The map widget's visible region.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub zoom: f64,
    pub bbox: LatLngBounds,
}

impl Viewport {
    pub fn new(zoom: f64, bbox: LatLngBounds) -> Self {
        Self { zoom, bbox }
    }

    /// Integer zoom used for tiling this viewport.
    #[inline]
    pub fn tile_zoom(&self) -> u8 {
        self.zoom.floor().clamp(0.0, tile_math::MAX_ZOOM as f64) as u8
    }
}

/// Marker pin derived from a visible spot in point mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Marker {
    pub spot_id: SpotId,
    pub location: LatLng,
}

/// What the map should draw right now.
///
/// Entities are `Arc`-shared: republishing the same entity reuses the same
/// allocation, so a renderer can diff by identity instead of deep equality.
/// Point mode fills `points` and `markers`; cluster mode fills `dots`.
#[derive(Debug, Clone, Default)]
pub struct RenderSet {
    pub points: Vec<Arc<Spot>>,
    pub dots: Vec<Arc<ClusterDot>>,
    pub markers: Vec<Arc<Marker>>,
}

impl RenderSet {
    pub fn is_empty(&self) -> bool {
        self.points.is_empty() && self.dots.is_empty() && self.markers.is_empty()
    }

    /// Total weight carried by the published dots.
    pub fn dot_weight(&self) -> u64 {
        self.dots.iter().map(|dot| dot.weight).sum()
    }
}
