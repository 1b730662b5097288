//! Web Mercator tile arithmetic.
//!
//! All tiling in the crate goes through this module: projecting locations
//! into world pixel space, addressing tiles with [`TileKey`], and covering
//! viewport rectangles with [`TileSpan`]. The world at zoom `z` is a square
//! of `256 * 2^z` pixels; tile X wraps across the antimeridian while tile Y
//! is clamped to the Mercator square.
//!
//! # Performance
//!
//! - Projection is pure float math, inlined into callers.
//! - Span covering allocates once per call and is linear in the number of
//!   covered tiles.

use crate::model::{LatLng, LatLngBounds};
use crate::{Result, TileError};

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;

/// Side length of one tile in world pixels at its own zoom.
pub const TILE_SIZE: f64 = 256.0;

/// Largest zoom level the tile addressing supports.
pub const MAX_ZOOM: u8 = 30;

/// Mercator singularity guard; clamps `sin(lat)` so poles stay finite.
const SINY_LIMIT: f64 = 0.9999;

/// Number of tiles along one axis at `zoom`.
#[inline(always)]
pub fn tile_count(zoom: u8) -> u32 {
    1u32 << zoom.min(MAX_ZOOM)
}

/// Wraps a raw tile X index into `[0, 2^zoom)`.
#[inline(always)]
pub fn wrap_x(x: i64, zoom: u8) -> u32 {
    x.rem_euclid(i64::from(tile_count(zoom))) as u32
}

/// Clamps a raw tile Y index into `[0, 2^zoom)`.
#[inline(always)]
pub fn clamp_y(y: i64, zoom: u8) -> u32 {
    y.clamp(0, i64::from(tile_count(zoom)) - 1) as u32
}

/// Projects a location into zoom-0 world pixel coordinates.
///
/// X grows east from the antimeridian, Y grows south from the north edge.
/// Latitudes inside the Mercator square (about `[-85.05, 85.05]`) map into
/// `[0, 256]`; beyond it Y leaves the square but stays finite thanks to the
/// singularity clamp, and callers clamp the resulting tile row instead.
#[inline(always)]
pub fn project(location: &LatLng) -> (f64, f64) {
    let siny = location.lat.to_radians().sin().clamp(-SINY_LIMIT, SINY_LIMIT);
    let x = TILE_SIZE * (0.5 + location.lng / 360.0);
    let y = TILE_SIZE * (0.5 - ((1.0 + siny) / (1.0 - siny)).ln() / (4.0 * PI));
    (x, y)
}

/// Inverse of [`project`]: zoom-0 world pixel coordinates back to degrees.
#[inline(always)]
pub fn unproject(x: f64, y: f64) -> LatLng {
    let lng = (x / TILE_SIZE - 0.5) * 360.0;
    let lat = ((0.5 - y / TILE_SIZE) * (2.0 * PI)).tanh().asin().to_degrees();
    LatLng::new(lat, lng)
}

/// Raw tile indices containing a location at `zoom`.
///
/// Returns unwrapped signed indices: X may leave `[0, 2^zoom)` for
/// longitudes outside `[-180, 180)` and Y is not clamped. Callers decide
/// between wrapping ([`wrap_x`]) and clamping ([`clamp_y`]) per axis.
#[inline]
pub fn tile_for_location(location: &LatLng, zoom: u8) -> (i64, i64) {
    let (world_x, world_y) = project(location);
    let scale = f64::from(tile_count(zoom));
    (
        (world_x * scale / TILE_SIZE).floor() as i64,
        (world_y * scale / TILE_SIZE).floor() as i64,
    )
}

/// Walks tile columns west to east, wrapping across the antimeridian.
///
/// Both endpoints are normalized into `[0, 2^zoom)` first. Equal endpoints
/// produce a single column; the walk is bounded by `2^zoom + 1` entries.
pub fn enumerate_x_range(x_start: i64, x_end: i64, zoom: u8) -> Vec<u32> {
    let count = tile_count(zoom);
    let from = wrap_x(x_start, zoom);
    let to = wrap_x(x_end, zoom);

    let mut range = vec![from];
    let mut current = from;
    while current != to && range.len() <= count as usize + 1 {
        current = (current + 1) % count;
        range.push(current);
    }
    range
}

/// Address of one map tile: zoom level plus X/Y indices within it.
///
/// Keys order by `(zoom, x, y)` and serialize through their canonical
/// string form `z{zoom}_{x}_{y}` when used as map keys in stores.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct TileKey {
    pub zoom: u8,
    pub x: u32,
    pub y: u32,
}

impl TileKey {
    #[inline]
    pub fn new(zoom: u8, x: u32, y: u32) -> Self {
        Self { zoom, x, y }
    }

    /// The tile containing `location`, X wrapped and Y clamped into range.
    pub fn for_location(location: &LatLng, zoom: u8) -> Self {
        let zoom = zoom.min(MAX_ZOOM);
        let (raw_x, raw_y) = tile_for_location(location, zoom);
        Self {
            zoom,
            x: wrap_x(raw_x, zoom),
            y: clamp_y(raw_y, zoom),
        }
    }

    /// Geographic rectangle covered by this tile.
    pub fn bounds(&self) -> LatLngBounds {
        let scale = f64::from(tile_count(self.zoom));
        let sw = unproject(
            f64::from(self.x) * TILE_SIZE / scale,
            f64::from(self.y + 1) * TILE_SIZE / scale,
        );
        let ne = unproject(
            f64::from(self.x + 1) * TILE_SIZE / scale,
            f64::from(self.y) * TILE_SIZE / scale,
        );
        LatLngBounds::new(ne.lat, sw.lat, ne.lng, sw.lng)
    }
}

impl fmt::Display for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "z{}_{}_{}", self.zoom, self.x, self.y)
    }
}

impl FromStr for TileKey {
    type Err = TileError;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || TileError::InvalidTileKey(s.to_owned());
        let rest = s.strip_prefix('z').ok_or_else(bad)?;

        let mut parts = rest.split('_');
        let zoom: u8 = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
        let x: u32 = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
        let y: u32 = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
        if parts.next().is_some() || zoom > MAX_ZOOM {
            return Err(bad());
        }

        let count = tile_count(zoom);
        if x >= count || y >= count {
            return Err(bad());
        }
        Ok(Self { zoom, x, y })
    }
}

/// A set of tiles covering a geographic rectangle at one zoom level.
///
/// `sw` and `ne` record the corner tiles of the covered rectangle even when
/// it wraps the antimeridian; `tiles` holds the full covering in canonical
/// `(zoom, x, y)` order with duplicates removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileSpan {
    zoom: u8,
    sw: TileKey,
    ne: TileKey,
    tiles: Vec<TileKey>,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl TileSpan {
    /// Covers `bounds` with tiles at `zoom`.
    ///
    /// A rectangle with `west == east`, or spanning 360 degrees or more,
    /// covers every column at the zoom.
    pub fn from_bounds(bounds: &LatLngBounds, zoom: u8) -> Self {
        let zoom = zoom.min(MAX_ZOOM);
        let (raw_x_west, raw_y_north) =
            tile_for_location(&LatLng::new(bounds.north, bounds.west), zoom);
        let (raw_x_east, raw_y_south) =
            tile_for_location(&LatLng::new(bounds.south, bounds.east), zoom);

        let y_top = clamp_y(raw_y_north.min(raw_y_south), zoom);
        let y_bottom = clamp_y(raw_y_north.max(raw_y_south), zoom);

        let columns = if bounds.is_full_longitude() {
            let west = i64::from(wrap_x(raw_x_west, zoom));
            enumerate_x_range(west, west - 1, zoom)
        } else {
            enumerate_x_range(raw_x_west, raw_x_east, zoom)
        };

        let rows = (y_bottom - y_top + 1) as usize;
        let mut tiles = Vec::with_capacity(columns.len() * rows);
        for &x in &columns {
            for y in y_top..=y_bottom {
                tiles.push(TileKey::new(zoom, x, y));
            }
        }
        tiles.sort_unstable();
        tiles.dedup();

        let west_column = columns[0];
        let east_column = columns[columns.len() - 1];
        Self {
            zoom,
            sw: TileKey::new(zoom, west_column, y_bottom),
            ne: TileKey::new(zoom, east_column, y_top),
            tiles,
        }
    }

    /// Re-expresses this covering at another zoom level.
    ///
    /// Zooming out maps each tile to its ancestor and collapses the
    /// duplicates; because the covering is gap-free, so is its image.
    /// Zooming in expands each tile into its `4^delta` descendants.
    pub fn at_zoom(&self, target: u8) -> Self {
        let target = target.min(MAX_ZOOM);
        if target == self.zoom {
            return self.clone();
        }

        if target < self.zoom {
            let shift = self.zoom - target;
            let mut tiles: Vec<TileKey> = self
                .tiles
                .iter()
                .map(|tile| TileKey::new(target, tile.x >> shift, tile.y >> shift))
                .collect();
            tiles.sort_unstable();
            tiles.dedup();
            Self {
                zoom: target,
                sw: TileKey::new(target, self.sw.x >> shift, self.sw.y >> shift),
                ne: TileKey::new(target, self.ne.x >> shift, self.ne.y >> shift),
                tiles,
            }
        } else {
            let shift = target - self.zoom;
            let factor = 1u64 << shift;

            let mut tiles =
                Vec::with_capacity(self.tiles.len().saturating_mul((factor * factor) as usize));
            for tile in &self.tiles {
                let base_x = u64::from(tile.x) << shift;
                let base_y = u64::from(tile.y) << shift;
                for dx in 0..factor {
                    for dy in 0..factor {
                        tiles.push(TileKey::new(
                            target,
                            (base_x + dx) as u32,
                            (base_y + dy) as u32,
                        ));
                    }
                }
            }
            tiles.sort_unstable();

            let sw = TileKey::new(
                target,
                (u64::from(self.sw.x) << shift) as u32,
                ((u64::from(self.sw.y) << shift) + factor - 1) as u32,
            );
            let ne = TileKey::new(
                target,
                ((u64::from(self.ne.x) << shift) + factor - 1) as u32,
                (u64::from(self.ne.y) << shift) as u32,
            );
            Self {
                zoom: target,
                sw,
                ne,
                tiles,
            }
        }
    }

    #[inline]
    pub fn zoom(&self) -> u8 {
        self.zoom
    }

    /// South-west corner tile of the covered rectangle.
    #[inline]
    pub fn sw(&self) -> TileKey {
        self.sw
    }

    /// North-east corner tile of the covered rectangle.
    #[inline]
    pub fn ne(&self) -> TileKey {
        self.ne
    }

    /// All covered tiles in canonical order.
    #[inline]
    pub fn tiles(&self) -> &[TileKey] {
        &self.tiles
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }
}
