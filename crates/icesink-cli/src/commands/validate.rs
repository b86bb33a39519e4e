//! Validate command implementation.

use anyhow::Result;
use icesink_core::config::{CatalogType, SinkMode, StateStoreKind};
use icesink_core::Config;

/// Validate the configuration and print a summary.
pub fn run(config: &Config) -> Result<()> {
    config.validate()?;

    let dest = &config.destination;
    let catalog = match dest.catalog_type {
        CatalogType::Rest => format!("rest ({})", dest.catalog_uri.as_deref().unwrap_or("")),
        CatalogType::Glue => "glue".to_string(),
        CatalogType::Memory => "memory".to_string(),
    };
    let mode = match dest.mode {
        SinkMode::Streaming => "streaming",
        SinkMode::Snapshot => "snapshot",
    };
    let state = match config.state.kind {
        StateStoreKind::Memory => "memory".to_string(),
        StateStoreKind::ObjectStore => config
            .state
            .path
            .clone()
            .unwrap_or_else(|| format!("{}/_icesink_state", dest.prefix.trim_end_matches('/'))),
    };

    println!("Configuration is valid");
    println!("  catalog:         {}", catalog);
    println!("  prefix:          {}", dest.prefix);
    println!("  mode:            {}", mode);
    println!("  commit interval: {}s", dest.commit_interval_seconds);
    println!(
        "  worker:          {}/{}{}",
        config.worker.index,
        config.worker.count,
        if config.worker.is_leader() { " (leader)" } else { "" }
    );
    println!("  state:           {}", state);

    Ok(())
}
