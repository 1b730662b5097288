//! Spot-to-dot aggregation strategies.
//!
//! The pyramid builder delegates the actual grouping to a
//! [`ClusterStrategy`] so alternative algorithms can slot in without
//! touching tiling or persistence. [`RadiusCluster`] is the default: a
//! levelled greedy merge that grows the merge radius one zoom step at a
//! time, which keeps coarse zooms consistent with the finer ones.
//!
//! # Performance
//!
//! Each merge level bins cluster centers into a uniform grid sized to the
//! merge radius and only compares candidates from the 3x3 neighborhood, so
//! a level is close to linear in the number of surviving clusters.

use crate::model::{ClusterDot, Spot, SpotId};
use crate::tile_math;

use geo::Coord;
use std::collections::HashMap;

/// Tuning for [`RadiusCluster`].
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Merge radius in screen pixels at the zoom being clustered.
    pub radius_px: f64,
    /// Zoom at which aggregation stops and every spot stays its own dot.
    pub base_zoom: u8,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            radius_px: 60.0,
            base_zoom: 12,
        }
    }
}

/// Turns the spot corpus into cluster dots for one zoom level.
///
/// Implementations must be deterministic for a given input order; the
/// builder relies on that to produce identical pyramids across runs.
pub trait ClusterStrategy: Send + Sync {
    fn cluster(&self, spots: &[Spot], zoom: u8) -> Vec<ClusterDot>;
}

/// Greedy fixed-radius clustering in projected world space.
#[derive(Debug, Clone, Default)]
pub struct RadiusCluster {
    config: ClusterConfig,
}

/// One surviving cluster during the levelled merge, in zoom-0 world pixels.
struct ClusterSeed {
    center: Coord,
    weight: u64,
    points: u64,
    source: Option<SpotId>,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl RadiusCluster {
    pub fn new(config: ClusterConfig) -> Self {
        Self { config }
    }

    #[inline]
    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    fn seeds(spots: &[Spot]) -> Vec<ClusterSeed> {
        spots
            .iter()
            .map(|spot| {
                let (x, y) = tile_math::project(&spot.location);
                ClusterSeed {
                    center: Coord { x, y },
                    weight: u64::from(spot.weight),
                    points: 1,
                    source: Some(spot.id.clone()),
                }
            })
            .collect()
    }

    /// One merge pass at the given radius (zoom-0 world pixels).
    ///
    /// Earlier seeds absorb later ones, so with a stable input order the
    /// output order is stable too.
    fn merge_level(seeds: Vec<ClusterSeed>, radius: f64) -> Vec<ClusterSeed> {
        #[cfg(feature = "profiling")]
        profiling::scope!("cluster::merge_level");

        let mut cells: HashMap<(i64, i64), Vec<usize>> = HashMap::new();
        for (index, seed) in seeds.iter().enumerate() {
            cells
                .entry(Self::cell_of(seed.center, radius))
                .or_default()
                .push(index);
        }

        let radius_sq = radius * radius;
        let mut absorbed = vec![false; seeds.len()];
        let mut merged: Vec<Option<ClusterSeed>> = seeds.into_iter().map(Some).collect();

        for index in 0..merged.len() {
            if absorbed[index] {
                continue;
            }
            let (cell_x, cell_y) = match merged[index].as_ref() {
                Some(seed) => Self::cell_of(seed.center, radius),
                None => continue,
            };

            let mut candidates = Vec::new();
            for dx in -1..=1 {
                for dy in -1..=1 {
                    if let Some(bucket) = cells.get(&(cell_x + dx, cell_y + dy)) {
                        candidates.extend(bucket.iter().copied());
                    }
                }
            }
            candidates.sort_unstable();

            for candidate in candidates {
                if candidate == index || absorbed[candidate] {
                    continue;
                }
                let other_center = match merged[candidate].as_ref() {
                    Some(seed) => seed.center,
                    None => continue,
                };
                let current = match merged[index].as_ref() {
                    Some(seed) => seed,
                    None => break,
                };
                let dx = current.center.x - other_center.x;
                let dy = current.center.y - other_center.y;
                if dx * dx + dy * dy > radius_sq {
                    continue;
                }
                let other = match merged[candidate].take() {
                    Some(seed) => seed,
                    None => continue,
                };
                absorbed[candidate] = true;
                if let Some(seed) = merged[index].as_mut() {
                    Self::absorb(seed, other);
                }
            }
        }

        merged.into_iter().flatten().collect()
    }

    fn absorb(into: &mut ClusterSeed, other: ClusterSeed) {
        let total = into.weight + other.weight;
        if total > 0 {
            let own = into.weight as f64;
            let theirs = other.weight as f64;
            into.center.x = (into.center.x * own + other.center.x * theirs) / total as f64;
            into.center.y = (into.center.y * own + other.center.y * theirs) / total as f64;
        } else {
            into.center.x = (into.center.x + other.center.x) / 2.0;
            into.center.y = (into.center.y + other.center.y) / 2.0;
        }
        into.weight = total;
        into.points += other.points;
        into.source = None;
    }

    #[inline]
    fn cell_of(center: Coord, radius: f64) -> (i64, i64) {
        ((center.x / radius).floor() as i64, (center.y / radius).floor() as i64)
    }
}

impl ClusterStrategy for RadiusCluster {
    fn cluster(&self, spots: &[Spot], zoom: u8) -> Vec<ClusterDot> {
        let base_zoom = self.config.base_zoom;
        if zoom >= base_zoom || self.config.radius_px <= 0.0 {
            return spots
                .iter()
                .map(|spot| ClusterDot {
                    location: spot.location,
                    weight: u64::from(spot.weight),
                    source_id: Some(spot.id.clone()),
                })
                .collect();
        }

        let mut seeds = Self::seeds(spots);
        // walk down one zoom at a time so siblings merge before cousins
        for level in (zoom..base_zoom).rev() {
            let radius = self.config.radius_px / f64::from(tile_math::tile_count(level));
            seeds = Self::merge_level(seeds, radius);
        }

        seeds
            .into_iter()
            .map(|seed| ClusterDot {
                location: tile_math::unproject(seed.center.x, seed.center.y),
                weight: seed.weight,
                source_id: if seed.points == 1 { seed.source } else { None },
            })
            .collect()
    }
}
