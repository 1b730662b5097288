//! Batch rebuild job for the spot cluster-tile pyramid.
//!
//! Reads a spot corpus from a JSON file, rebuilds the whole pyramid with
//! [`spot_tiles_lib::ClusterPyramidBuilder`], and stores one JSON document
//! per tile. Runs once by default; `--interval-secs` turns it into a
//! scheduled loop.

mod run;
mod settings;
mod storage;

use settings::Settings;
use std::process::ExitCode;
use tracing::error;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    // Setup logging
    tracing_subscriber::fmt::init();

    let settings = Settings::from_cli();
    match run::run(settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "job failed");
            ExitCode::FAILURE
        }
    }
}
