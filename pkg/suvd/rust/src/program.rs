// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_START_SECONDS: u64 = 2;
pub const DEFAULT_STOP_TIMEOUT: u64 = 3;
pub const DEFAULT_WEBHOOK_TIMEOUT: u64 = 60;

/// Declarative description of one supervised command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub environ: Vec<String>,
    #[serde(default, rename = "directory")]
    pub dir: String,
    #[serde(default)]
    pub start_auto: bool,
    #[serde(default)]
    pub start_retries: u32,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub start_seconds: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub stop_timeout: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,
    #[serde(default)]
    pub log_disable: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stderr_only: bool,
    #[serde(default, skip_serializing_if = "Notifications::is_empty")]
    pub notifications: Notifications,
    #[serde(default, skip_serializing_if = "WebHook::is_empty")]
    pub webhook: WebHook,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notifications {
    #[serde(default, skip_serializing_if = "Pushover::is_empty")]
    pub pushover: Pushover,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pushover {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub users: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebHook {
    #[serde(default, skip_serializing_if = "GithubHook::is_empty")]
    pub github: GithubHook,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub timeout: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GithubHook {
    #[serde(default)]
    pub secret: String,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

impl Program {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn check(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidProgram("program name empty".into()));
        }
        if self.command.trim().is_empty() {
            return Err(Error::InvalidProgram(format!(
                "program {:?} command empty",
                self.name
            )));
        }
        Ok(())
    }

    /// Runs shorter than this count as quick exits.
    pub fn min_run_time(&self) -> Duration {
        Duration::from_secs(nonzero_or(self.start_seconds, DEFAULT_START_SECONDS))
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(nonzero_or(self.stop_timeout, DEFAULT_STOP_TIMEOUT))
    }
}

impl Notifications {
    pub fn is_empty(&self) -> bool {
        self.pushover.is_empty()
    }
}

impl Pushover {
    pub fn is_empty(&self) -> bool {
        self.api_key.is_empty() && self.users.is_empty()
    }

    pub fn is_configured(&self) -> bool {
        !self.api_key.is_empty() && !self.users.is_empty()
    }
}

impl WebHook {
    pub fn is_empty(&self) -> bool {
        self.command.is_empty() && self.timeout == 0 && self.github.is_empty()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(nonzero_or(self.timeout, DEFAULT_WEBHOOK_TIMEOUT))
    }
}

impl GithubHook {
    pub fn is_empty(&self) -> bool {
        self.secret.is_empty()
    }
}

fn nonzero_or(v: u64, default: u64) -> u64 {
    if v == 0 { default } else { v }
}
