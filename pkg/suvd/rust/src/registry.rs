// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! The supervisor's program table.
//!
//! Structural changes (add, update, remove, reload) are serialized by one
//! async mutation lock. Readers only take the short table lock, so `list` and
//! `get` never wait on a stop in progress. Updates stop the old process
//! outside the mutation lock and swap in the latest pending definition
//! afterwards. A process leaving the table is retired and stopped once more,
//! so a start that reached it in the meantime cannot leave a child behind.

use crate::broadcast::Broadcaster;
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::notify::Notifier;
use crate::process::{Process, ProcessOptions, ProgramStatus};
use crate::program::Program;
use crate::state::ProcessState;
use crate::store::ProgramStore;
use crate::webhook;
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep, timeout};

/// Outcome of [`Registry::add_or_update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Added,
    /// The old process is being stopped; the new one takes over afterwards.
    Updating,
    Unchanged,
}

#[derive(Clone)]
pub struct Registry {
    inner: Arc<Inner>,
}

struct Inner {
    table: RwLock<Table>,
    mutation: Mutex<()>,
    events: Broadcaster,
    store: Arc<dyn ProgramStore>,
    opts: ProcessOptions,
    waiter_ids: AtomicU64,
}

#[derive(Default)]
struct Table {
    names: Vec<String>,
    programs: HashMap<String, Program>,
    processes: HashMap<String, Process>,
    /// Definitions waiting for their update continuation, newest wins.
    pending: HashMap<String, Program>,
}

impl Registry {
    pub fn new(store: Arc<dyn ProgramStore>, opts: ProcessOptions, event_buffer_size: usize) -> Self {
        let events = Broadcaster::new(event_buffer_size, opts.subscriber_queue);
        Self {
            inner: Arc::new(Inner {
                table: RwLock::new(Table::default()),
                mutation: Mutex::new(()),
                events,
                store,
                opts,
                waiter_ids: AtomicU64::new(0),
            }),
        }
    }

    pub fn from_settings(
        settings: &Settings,
        store: Arc<dyn ProgramStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self::new(
            store,
            ProcessOptions::from_settings(settings, notifier),
            settings.event_buffer_size,
        )
    }

    /// Registry-wide event stream: additions, updates, deletions and every
    /// process state change, one line per event.
    pub fn events(&self) -> &Broadcaster {
        &self.inner.events
    }

    /// Register a new program (stopped) or replace an existing one whose
    /// definition changed. Identical definitions are left alone.
    pub async fn add_or_update(&self, program: Program) -> Result<Change> {
        let _guard = self.inner.mutation.lock().await;
        self.add_or_update_locked(program, true).await
    }

    /// Stop the program, then drop it from the table.
    pub async fn remove(&self, name: &str) -> Result<()> {
        let _guard = self.inner.mutation.lock().await;
        self.remove_locked(name, true).await
    }

    pub fn start(&self, name: &str) -> Result<ProcessState> {
        self.process(name)?.start()
    }

    pub fn stop(&self, name: &str) -> Result<ProcessState> {
        self.process(name)?.stop()
    }

    pub fn restart(&self, name: &str) -> Result<ProcessState> {
        self.process(name)?.restart()
    }

    /// Issue `Stop` and return once the process holds no child and has no
    /// pending relaunch.
    pub async fn stop_and_wait(&self, name: &str) -> Result<()> {
        let process = self.process(name)?;
        self.wait_stopped(&process).await;
        Ok(())
    }

    /// Every program in table order.
    pub fn list(&self) -> Vec<ProgramStatus> {
        let table = self.read();
        table
            .names
            .iter()
            .filter_map(|name| table.processes.get(name))
            .map(Process::status)
            .collect()
    }

    pub fn get(&self, name: &str) -> Result<ProgramStatus> {
        Ok(self.process(name)?.status())
    }

    pub fn process(&self, name: &str) -> Result<Process> {
        self.read()
            .processes
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        self.read().names.clone()
    }

    /// Reconcile the table with the store: add or update every stored program,
    /// remove the ones that disappeared and adopt the stored order. Nothing is
    /// written back.
    pub async fn load_from_store(&self) -> Result<()> {
        let _guard = self.inner.mutation.lock().await;
        let programs = self.inner.store.load().await.map_err(Error::Store)?;

        let mut seen = HashSet::new();
        for program in &programs {
            program.check()?;
            if !seen.insert(program.name.clone()) {
                return Err(Error::DuplicateProgram(program.name.clone()));
            }
        }

        for program in &programs {
            self.add_or_update_locked(program.clone(), false).await?;
        }
        let stale: Vec<String> = self
            .read()
            .names
            .iter()
            .filter(|name| !seen.contains(*name))
            .cloned()
            .collect();
        for name in stale {
            self.remove_locked(&name, false).await?;
        }
        self.write().names = programs.iter().map(|p| p.name.clone()).collect();

        info!("loaded {} program(s)", programs.len());
        Ok(())
    }

    /// Save every program in table order.
    pub async fn persist_to_store(&self) -> Result<()> {
        let _guard = self.inner.mutation.lock().await;
        self.persist_locked().await
    }

    /// Start every program marked `start_auto`. Meant for daemon boot.
    pub fn auto_start(&self) {
        let processes: Vec<Process> = {
            let table = self.read();
            table
                .names
                .iter()
                .filter_map(|name| table.processes.get(name))
                .filter(|p| p.program().start_auto)
                .cloned()
                .collect()
        };
        for process in processes {
            info!("[{}] auto start", process.name());
            if let Err(e) = process.start() {
                warn!("[{}] auto start failed: {e}", process.name());
            }
        }
    }

    /// Stop the program, run its webhook command in the background, and start
    /// it again afterwards if it was running. The handle resolves once the
    /// whole sequence is over.
    pub async fn trigger_webhook(&self, name: &str) -> Result<JoinHandle<()>> {
        let process = self.process(name)?;
        if process.program().webhook.command.trim().is_empty() {
            return Err(Error::NoWebhook(name.to_string()));
        }
        let was_running = process.is_running();
        self.wait_stopped(&process).await;

        let registry = self.clone();
        let name = name.to_string();
        Ok(tokio::spawn(async move {
            match webhook::run(&process).await {
                Ok(status) if status.success() => info!("[{name}] webhook command finished"),
                Ok(status) => warn!("[{name}] webhook command error: {status}"),
                Err(e) => warn!("[{name}] webhook command error: {e:#}"),
            }
            if was_running && let Err(e) = registry.start(&name) {
                warn!("[{name}] start after webhook failed: {e}");
            }
        }))
    }

    /// Stop every process concurrently and wait for all of them.
    pub async fn shutdown(&self) {
        let processes: Vec<Process> = self.read().processes.values().cloned().collect();
        let mut stops = JoinSet::new();
        for process in processes {
            let registry = self.clone();
            stops.spawn(async move {
                let bound = process.stop_bound() + registry.inner.opts.timings.stop_poll();
                let stopped = timeout(bound, registry.wait_stopped(&process)).await.is_ok();
                (process.name().to_string(), stopped)
            });
        }
        while let Some(joined) = stops.join_next().await {
            match joined {
                Ok((name, true)) => info!("[{name}] program stop succeeded"),
                Ok((name, false)) => warn!("[{name}] program stop failed"),
                Err(e) => warn!("stop task failed: {e}"),
            }
        }
        info!("all programs stopped");
    }

    // -- internals; callers hold the mutation lock --

    async fn add_or_update_locked(&self, program: Program, persist: bool) -> Result<Change> {
        program.check()?;
        let name = program.name.clone();
        let existing = {
            let table = self.read();
            table
                .pending
                .get(&name)
                .or_else(|| table.programs.get(&name))
                .cloned()
                .zip(table.processes.get(&name).cloned())
                .map(|(latest, old)| (latest, old, table.pending.contains_key(&name)))
        };

        match existing {
            Some((latest, _, _)) if latest == program => Ok(Change::Unchanged),
            Some((_, old, in_flight)) => {
                info!("[{name}] update");
                self.write().pending.insert(name.clone(), program);
                self.broadcast(&format!("{name} update"));
                if !in_flight {
                    let was_running = old.is_running();
                    let registry = self.clone();
                    tokio::spawn(async move {
                        registry.finish_update(name, old, was_running, persist).await;
                    });
                }
                Ok(Change::Updating)
            }
            None => {
                let process = self.new_process(program.clone())?;
                {
                    let mut table = self.write();
                    table.names.push(name.clone());
                    table.programs.insert(name.clone(), program);
                    table.processes.insert(name.clone(), process);
                }
                if persist && let Err(e) = self.persist_locked().await {
                    warn!("[{name}] saving programs failed, dropping it: {e}");
                    self.drop_entry(&name);
                    return Err(e);
                }
                info!("[{name}] added");
                self.broadcast(&format!("{name} added"));
                Ok(Change::Added)
            }
        }
    }

    async fn finish_update(&self, name: String, old: Process, was_running: bool, persist: bool) {
        self.wait_stopped(&old).await;

        let _guard = self.inner.mutation.lock().await;
        let fresh = {
            let mut table = self.write();
            // The pending entry belongs to whichever continuation owns the
            // current process.
            if !table.processes.get(&name).is_some_and(|p| p.same(&old)) {
                debug!("[{name}] removed or replaced meanwhile, dropping update");
                return;
            }
            let Some(program) = table.pending.remove(&name) else {
                return;
            };
            let fresh = match self.new_process(program.clone()) {
                Ok(process) => process,
                Err(e) => {
                    warn!("[{name}] update failed: {e}");
                    return;
                }
            };
            table.programs.insert(name.clone(), program);
            table.processes.insert(name.clone(), fresh.clone());
            fresh
        };

        // Someone may have started the old process after it first stopped.
        let restarted = self.retire(&old).await;
        if (was_running || restarted) && let Err(e) = fresh.start() {
            warn!("[{name}] start after update failed: {e}");
        }
        if persist && let Err(e) = self.persist_locked().await {
            warn!("[{name}] saving programs failed: {e}");
        }
    }

    async fn remove_locked(&self, name: &str, persist: bool) -> Result<()> {
        let process = self.process(name)?;
        info!("[{name}] stop before delete program");
        self.wait_stopped(&process).await;
        self.drop_entry(name);
        self.retire(&process).await;
        self.broadcast(&format!("{name} deleted"));
        if persist {
            self.persist_locked().await?;
        }
        Ok(())
    }

    fn drop_entry(&self, name: &str) {
        let mut table = self.write();
        table.names.retain(|n| n != name);
        table.programs.remove(name);
        table.processes.remove(name);
        table.pending.remove(name);
    }

    /// Refuse further starts on a process that left the table and stop it.
    /// Returns whether it had been started again in the meantime.
    async fn retire(&self, process: &Process) -> bool {
        process.retire();
        let active = process.state().is_active();
        if active {
            warn!("[{}] started while leaving the table, stopping it", process.name());
            self.wait_stopped(process).await;
        }
        active
    }

    async fn persist_locked(&self) -> Result<()> {
        let programs: Vec<Program> = {
            let table = self.read();
            table
                .names
                .iter()
                .filter_map(|name| table.programs.get(name))
                .cloned()
                .collect()
        };
        self.inner
            .store
            .save(&programs)
            .await
            .map_err(Error::Store)
    }

    fn new_process(&self, program: Program) -> Result<Process> {
        let process = Process::new(program, self.inner.opts.clone())?;
        let events = self.inner.events.clone();
        let name = process.name().to_string();
        process.add_observer(move |old, new| {
            events.write(format!("[{name}] state: {old} -> {new}\n").as_bytes());
        });
        Ok(process)
    }

    /// Stop `process` and wait until it is inactive. Woken by the event stream,
    /// with a periodic poll in case an event was dropped.
    async fn wait_stopped(&self, process: &Process) {
        if !process.state().is_active() {
            return;
        }
        let id = format!(
            "stop-wait-{}-{}",
            process.name(),
            self.inner.waiter_ids.fetch_add(1, Ordering::SeqCst)
        );
        let mut events = self.inner.events.subscribe(id);
        let poll = self.inner.opts.timings.stop_poll();

        let mut request_stop = true;
        loop {
            let state = process.state();
            if !state.is_active() {
                return;
            }
            if request_stop
                && state.is_running()
                && let Err(e) = process.stop()
            {
                warn!("[{}] stop failed: {e}", process.name());
            }
            // Ask again only after a quiet poll period.
            request_stop = tokio::select! {
                _ = events.recv() => false,
                _ = sleep(poll) => true,
            };
        }
    }

    fn broadcast(&self, event: &str) {
        self.inner.events.write(format!("{event}\n").as_bytes());
    }

    fn read(&self) -> RwLockReadGuard<'_, Table> {
        self.inner.table.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Table> {
        self.inner.table.write().unwrap_or_else(PoisonError::into_inner)
    }
}
