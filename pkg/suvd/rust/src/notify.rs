// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::program::Program;
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use log::{debug, warn};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

pub const PUSHOVER_ENDPOINT: &str = "https://api.pushover.net/1/messages.json";
const TITLE: &str = "suvd";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyEvent {
    Fatal,
}

impl fmt::Display for NotifyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotifyEvent::Fatal => write!(f, "fatal"),
        }
    }
}

/// Delivery is fire-and-forget: callers log the error and move on.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, program: &Program, event: NotifyEvent) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, program: &Program, event: NotifyEvent) -> Result<()> {
        warn!("[{}] change to {event}", program.name);
        Ok(())
    }
}

#[derive(Serialize)]
struct Message<'a> {
    token: &'a str,
    user: &'a str,
    title: &'a str,
    message: String,
}

/// Posts to the Pushover messages API for every user configured on the
/// program. Programs without Pushover settings are skipped.
pub struct PushoverNotifier {
    client: reqwest::Client,
    endpoint: String,
}

impl PushoverNotifier {
    pub fn new() -> Result<Self> {
        Self::with_endpoint(PUSHOVER_ENDPOINT)
    }

    pub fn with_endpoint(endpoint: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to create HTTP client")?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
        })
    }
}

#[async_trait]
impl Notifier for PushoverNotifier {
    async fn notify(&self, program: &Program, event: NotifyEvent) -> Result<()> {
        let pushover = &program.notifications.pushover;
        if !pushover.is_configured() {
            debug!("[{}] no pushover target, skipping {event}", program.name);
            return Ok(());
        }

        let mut failed = Vec::new();
        for user in &pushover.users {
            let msg = Message {
                token: &pushover.api_key,
                user,
                title: TITLE,
                message: format!("{} change to {event}", program.name),
            };
            let sent = self
                .client
                .post(&self.endpoint)
                .json(&msg)
                .send()
                .await
                .and_then(|resp| resp.error_for_status());
            if let Err(e) = sent {
                warn!("[{}] pushover error for user {user}: {e}", program.name);
                failed.push(user.as_str());
            }
        }
        if !failed.is_empty() {
            bail!("pushover delivery failed for {}", failed.join(", "));
        }
        Ok(())
    }
}
