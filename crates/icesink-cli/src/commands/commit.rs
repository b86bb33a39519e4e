//! Commit command implementation.
//!
//! Runs a single leader commit pass, for recovery after a leader outage.

use anyhow::Result;
use icesink_core::iceberg::CatalogFactoryRegistry;
use icesink_core::state::open_state_store;
use icesink_core::{CommitScheduler, Config};
use tracing::info;

/// Commit every pending writer file once and print the report.
pub async fn run(config: Config) -> Result<()> {
    let catalog = CatalogFactoryRegistry::with_defaults()
        .create(&config.destination)
        .await?;
    let state_store = open_state_store(&config)?;

    let scheduler = CommitScheduler::builder()
        .config(&config)
        .catalog(catalog)
        .state_store(state_store)
        .build()?;

    info!(scope = %scheduler.scope(), "Running commit pass");
    let report = scheduler.run_once().await?;

    println!(
        "Committed {} file(s) to {} table(s), {} table(s) failed",
        report.files_committed, report.tables_committed, report.tables_failed
    );

    if report.tables_failed > 0 {
        anyhow::bail!("{} table(s) failed to commit", report.tables_failed);
    }
    Ok(())
}
