// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::broadcast::Broadcaster;
use crate::command::Launch;
use crate::process::{Process, signal_group};
use anyhow::{Context, Result};
use log::{debug, info, warn};
use nix::sys::signal::Signal;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;

const DRAIN: Duration = Duration::from_secs(1);

/// Run the program's webhook command in its directory, with output going to
/// the program's combined stream. The command is terminated once the webhook
/// timeout expires.
pub async fn run(process: &Process) -> Result<ExitStatus> {
    let program = process.program();
    let hook = &program.webhook;
    let mut child = Launch::for_program(program)
        .command(&hook.command)
        .spawn()
        .with_context(|| format!("[{}] failed to spawn webhook: {}", program.name, hook.command))?;
    let pid = child.id().unwrap_or_default();
    info!(
        "[{}] webhook spawned (pid={}, cmd={})",
        program.name, pid, hook.command
    );

    let stdout = tokio::spawn(copy_into(child.stdout.take(), process.output().clone()));
    let stderr = tokio::spawn(copy_into(child.stderr.take(), process.output().clone()));

    let limit = hook.timeout();
    let status = match timeout(limit, child.wait()).await {
        Ok(status) => status?,
        Err(_) => {
            warn!(
                "[{}] webhook timeout ({}s) reached, sending SIGTERM",
                program.name,
                limit.as_secs()
            );
            signal_group(&program.name, pid, Signal::SIGTERM);
            match timeout(program.stop_timeout(), child.wait()).await {
                Ok(status) => status?,
                Err(_) => {
                    signal_group(&program.name, pid, Signal::SIGKILL);
                    child.wait().await?
                }
            }
        }
    };

    for pump in [stdout, stderr] {
        if timeout(DRAIN, pump).await.is_err() {
            debug!("[{}] webhook output still open, detaching", program.name);
        }
    }
    Ok(status)
}

async fn copy_into<R: AsyncRead + Unpin>(reader: Option<R>, out: Broadcaster) {
    let Some(mut reader) = reader else {
        return;
    };
    let mut buf = [0u8; 4096];
    while let Ok(n) = reader.read(&mut buf).await {
        if n == 0 {
            break;
        }
        out.write(&buf[..n]);
    }
}
