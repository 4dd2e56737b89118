use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::PipelineConfig;

mod analysis;
mod config;
mod data_handling;
mod helper_functions;
mod models;
mod morpheus;
mod profiling;
mod stages;

fn main() -> anyhow::Result<()> {
    // Setup logging and project configuration
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting the cell painting profile pipeline");
    let config = PipelineConfig::from_env(std::env::args().nth(1))?;

    // Plate batches: combined tables and Morpheus input
    let mut loaded = Vec::with_capacity(config.plate_batches.len());
    for batch in &config.plate_batches {
        let profiles = stages::run_plate_batch(&config, batch)
            .with_context(|| format!("building plate batch {}", batch.batch_id))?;
        loaded.push((batch.clone(), profiles));
    }

    for batch in &config.merged_batches {
        stages::run_merged_batch(&config, batch)
            .with_context(|| format!("building merged batch {}", batch.batch_id))?;
    }

    // Combine batches with different feature sets
    let combined = match &config.harmonize {
        Some(harmonize) => Some(
            stages::run_harmonize(&config, harmonize, &loaded)
                .with_context(|| format!("harmonizing batches {:?}", harmonize.batches))?,
        ),
        None => None,
    };
    drop(loaded);

    match &config.fat_globule {
        Some(fat) => {
            stages::run_fat_globule(&config, fat, combined)
                .context("fat globule phenotype comparison")?;
        }
        None => warn!("No fat globule analysis configured"),
    }

    info!("Pipeline finished");
    Ok(())
}
