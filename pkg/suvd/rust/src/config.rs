// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use anyhow::{Context, Result, anyhow};
use log::{LevelFilter, debug};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_DIR: &str = ".";
pub const CONFIG_FILE: &str = "config.yml";

fn default_programs_file() -> String {
    "programs.yml".to_string()
}

fn default_log_path() -> String {
    "logs".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_output_buffer_size() -> usize {
    24 * 1024
}

fn default_event_buffer_size() -> usize {
    4 * 1024
}

fn default_subscriber_queue() -> usize {
    crate::broadcast::DEFAULT_QUEUE_CAPACITY
}

/// Daemon settings. Every key is optional.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_programs_file")]
    pub programs_file: String,
    #[serde(default)]
    pub log: LogSettings,
    #[serde(default = "default_output_buffer_size")]
    pub output_buffer_size: usize,
    #[serde(default = "default_event_buffer_size")]
    pub event_buffer_size: usize,
    #[serde(default = "default_subscriber_queue")]
    pub subscriber_queue: usize,
    #[serde(default)]
    pub timings: Timings,
    /// Directory the settings were read from; relative paths resolve here.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogSettings {
    /// Root of per-program output files. Empty disables output files.
    #[serde(default = "default_log_path")]
    pub path: String,
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Timings {
    pub retry_delay_ms: u64,
    pub retry_reset_secs: u64,
    pub quick_exit_pause_us: u64,
    pub restart_settle_ms: u64,
    pub cancel_wait_ms: u64,
    pub stop_poll_ms: u64,
    pub output_drain_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            programs_file: default_programs_file(),
            log: LogSettings::default(),
            output_buffer_size: default_output_buffer_size(),
            event_buffer_size: default_event_buffer_size(),
            subscriber_queue: default_subscriber_queue(),
            timings: Timings::default(),
            base_dir: PathBuf::from(DEFAULT_CONFIG_DIR),
        }
    }
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            path: default_log_path(),
            level: default_log_level(),
        }
    }
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            retry_delay_ms: 2000,
            retry_reset_secs: 60,
            quick_exit_pause_us: 100,
            restart_settle_ms: 1000,
            cancel_wait_ms: 200,
            stop_poll_ms: 1000,
            output_drain_ms: 1000,
        }
    }
}

impl Timings {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn retry_reset(&self) -> Duration {
        Duration::from_secs(self.retry_reset_secs)
    }

    pub fn quick_exit_pause(&self) -> Duration {
        Duration::from_micros(self.quick_exit_pause_us)
    }

    pub fn restart_settle(&self) -> Duration {
        Duration::from_millis(self.restart_settle_ms)
    }

    pub fn cancel_wait(&self) -> Duration {
        Duration::from_millis(self.cancel_wait_ms)
    }

    pub fn stop_poll(&self) -> Duration {
        Duration::from_millis(self.stop_poll_ms.max(1))
    }

    pub fn output_drain(&self) -> Duration {
        Duration::from_millis(self.output_drain_ms)
    }
}

pub fn config_dir() -> PathBuf {
    std::env::var("SUVD_CONFIG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_DIR))
}

impl Settings {
    /// Read `<dir>/config.yml`. A missing file yields the defaults.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        let mut settings = match std::fs::read_to_string(&path) {
            Ok(contents) if contents.trim().is_empty() => Settings::default(),
            Ok(contents) => serde_yaml::from_str(&contents)
                .with_context(|| format!("parsing {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("{} not found, using defaults", path.display());
                Settings::default()
            }
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };
        settings.base_dir = dir.to_path_buf();
        Ok(settings)
    }

    pub fn programs_path(&self) -> PathBuf {
        self.base_dir.join(&self.programs_file)
    }

    /// `None` when output files are turned off.
    pub fn log_dir(&self) -> Option<PathBuf> {
        let path = self.log.path.trim();
        (!path.is_empty()).then(|| self.base_dir.join(path))
    }

    pub fn level_filter(&self) -> Result<LevelFilter> {
        self.log
            .level
            .parse()
            .map_err(|_| anyhow!("invalid log level {:?}", self.log.level))
    }
}
