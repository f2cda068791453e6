// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use simple_logger::SimpleLogger;
use std::path::PathBuf;
use std::sync::Arc;
use suvd::{Notifier, PushoverNotifier, Registry, Settings, YamlStore, config, shutdown};

#[derive(Parser, Debug)]
#[command(name = "suvd")]
#[command(about = "Process supervisor daemon", long_about = None, version)]
struct Args {
    /// Directory holding config.yml (default: $SUVD_CONFIG_DIR, then the current directory)
    #[arg(short, long)]
    config_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let dir = args.config_dir.unwrap_or_else(config::config_dir);
    let settings = Settings::load(&dir)?;
    SimpleLogger::new()
        .with_level(settings.level_filter()?)
        .init()?;
    info!("suvd starting (version {})", env!("CARGO_PKG_VERSION"));
    info!("config dir: {}", dir.display());

    let store = Arc::new(YamlStore::new(settings.programs_path()));
    let notifier: Arc<dyn Notifier> = Arc::new(PushoverNotifier::new()?);
    let registry = Registry::from_settings(&settings, store, notifier);
    registry
        .load_from_store()
        .await
        .with_context(|| format!("loading {}", settings.programs_path().display()))?;
    registry.auto_start();

    shutdown::run_until_signal(&registry).await?;
    info!("suvd shutting down");
    Ok(())
}
