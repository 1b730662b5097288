//! Job orchestration: a single rebuild pass, or a fixed-interval loop.
//!
//! Every pass is a full pyramid rebuild; there is no incremental mode. In
//! scheduled mode the first rebuild runs immediately and a failed pass
//! leaves the previous pyramid on disk untouched, to be replaced at the
//! next tick.

use crate::settings::Settings;
use crate::storage::{JsonFileStore, JsonSpotSource};

use spot_tiles_lib::{BuildSummary, ClusterPyramidBuilder, Result};
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

/// Runs one full rebuild against the configured files.
pub fn rebuild_once(settings: &Settings) -> Result<BuildSummary> {
    let source = JsonSpotSource::new(&settings.spots);
    let store = JsonFileStore::new(&settings.tiles)?;
    let builder = ClusterPyramidBuilder::new(settings.builder_config());
    builder.run(&source, &store)
}

/// Entry point after CLI parsing: run once, or loop on the interval.
pub async fn run(settings: Settings) -> Result<()> {
    info!(
        spots = %settings.spots.display(),
        tiles = %settings.tiles.display(),
        "spot tiles job starting"
    );

    let Some(every) = settings.interval() else {
        let summary = rebuild_once(&settings)?;
        info!(tiles = summary.tiles_written, "single rebuild finished");
        return Ok(());
    };

    let mut ticks = tokio::time::interval(every);
    // a rebuild slower than the interval delays the next one instead of
    // stacking missed runs
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticks.tick().await;
        if let Err(err) = rebuild_once(&settings) {
            error!(error = %err, "scheduled rebuild failed");
        }
    }
}
