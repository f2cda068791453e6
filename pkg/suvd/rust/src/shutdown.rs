// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::registry::Registry;
use anyhow::Result;
use log::{info, warn};
use tokio::signal::unix::{SignalKind, signal};

/// Serve signals until SIGINT or SIGTERM: SIGHUP reloads the program store,
/// the other two stop every program and return.
pub async fn run_until_signal(registry: &Registry) -> Result<()> {
    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    loop {
        tokio::select! {
            _ = sighup.recv() => {
                info!("received SIGHUP, reloading programs");
                if let Err(e) = registry.load_from_store().await {
                    warn!("reload failed: {e}");
                }
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, stopping all programs");
                break;
            }
            _ = sigint.recv() => {
                info!("received SIGINT, stopping all programs");
                break;
            }
        }
    }

    registry.shutdown().await;
    Ok(())
}
