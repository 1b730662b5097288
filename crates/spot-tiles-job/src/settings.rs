//! Command line surface of the rebuild job.

use clap::Parser;
use spot_tiles_lib::BuilderConfig;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
/// Spot Tiles Job - rebuilds the cluster-tile pyramid behind a spot map
pub struct Settings {
    /// JSON file holding the spot corpus (an array of spot records)
    #[clap(short, long, value_name = "FILE")]
    pub spots: PathBuf,

    /// Directory of tile documents, one JSON file per tile
    #[clap(short, long, value_name = "DIR")]
    pub tiles: PathBuf,

    /// Seconds between rebuilds; 0 runs a single rebuild and exits
    #[clap(long, default_value = "0")]
    pub interval_secs: u64,

    /// Deepest pyramid zoom, storing one dot per spot
    #[clap(long, default_value = "12")]
    pub base_zoom: u8,

    /// Zoom distance between pyramid levels
    #[clap(long, default_value = "4")]
    pub zoom_step: u8,

    /// Coarsest zoom the pyramid may reach
    #[clap(long, default_value = "4")]
    pub min_zoom: u8,

    /// Cluster merge radius in screen pixels
    #[clap(long, default_value = "60.0")]
    pub radius_px: f64,
}

impl Settings {
    /// Parses the process arguments, exiting with usage help on error.
    pub fn from_cli() -> Self {
        Self::parse()
    }

    pub fn builder_config(&self) -> BuilderConfig {
        BuilderConfig {
            base_zoom: self.base_zoom,
            zoom_step: self.zoom_step,
            min_zoom: self.min_zoom,
            radius_px: self.radius_px,
        }
    }

    /// Delay between scheduled rebuilds; `None` means a single run.
    pub fn interval(&self) -> Option<Duration> {
        (self.interval_secs > 0).then(|| Duration::from_secs(self.interval_secs))
    }
}
