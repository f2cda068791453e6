// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::program::Program;
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::debug;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

/// Persistent program list, read at boot and on reload, written after
/// caller-originated changes.
#[async_trait]
pub trait ProgramStore: Send + Sync {
    async fn load(&self) -> Result<Vec<Program>>;
    async fn save(&self, programs: &[Program]) -> Result<()>;
}

/// YAML list of programs in a single file.
#[derive(Debug, Clone)]
pub struct YamlStore {
    path: PathBuf,
}

impl YamlStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ProgramStore for YamlStore {
    async fn load(&self) -> Result<Vec<Program>> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("{} not found, no programs", self.path.display());
                return Ok(Vec::new());
            }
            Err(e) => return Err(e).with_context(|| format!("reading {}", self.path.display())),
        };
        if contents.trim().is_empty() {
            return Ok(Vec::new());
        }
        let programs: Option<Vec<Program>> = serde_yaml::from_str(&contents)
            .with_context(|| format!("parsing {}", self.path.display()))?;
        Ok(programs.unwrap_or_default())
    }

    async fn save(&self, programs: &[Program]) -> Result<()> {
        let data = serde_yaml::to_string(programs).context("serializing programs")?;
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, data)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("replacing {}", self.path.display()))?;
        Ok(())
    }
}

/// In-process store for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    programs: Mutex<Vec<Program>>,
    saves: AtomicUsize,
}

impl MemoryStore {
    pub fn new(programs: Vec<Program>) -> Self {
        Self {
            programs: Mutex::new(programs),
            saves: AtomicUsize::new(0),
        }
    }

    /// Replace the stored list without counting a save.
    pub fn set(&self, programs: Vec<Program>) {
        *self.programs.lock().unwrap_or_else(PoisonError::into_inner) = programs;
    }

    pub fn programs(&self) -> Vec<Program> {
        self.programs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProgramStore for MemoryStore {
    async fn load(&self) -> Result<Vec<Program>> {
        Ok(self.programs())
    }

    async fn save(&self, programs: &[Program]) -> Result<()> {
        self.set(programs.to_vec());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
