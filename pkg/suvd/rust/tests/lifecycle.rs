// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Registry-level lifecycle tests: real `/bin/sh` children, in-memory or
//! YAML program stores, no daemon binary.

mod helpers;

use async_trait::async_trait;
use helpers::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use suvd::{
    Change, Error, MemoryStore, NotifyEvent, ProcessOptions, ProcessState, Program, ProgramStore,
    Registry, YamlStore,
};
use tokio::sync::Mutex;

fn registry_with(programs: Vec<suvd::Program>) -> (Registry, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new(programs));
    let registry = Registry::new(
        Arc::clone(&store) as Arc<dyn ProgramStore>,
        fast_options(),
        16 * 1024,
    );
    (registry, store)
}

/// Memory store whose saves wait while `gate` is held and fail while
/// `read_only` is set.
#[derive(Default)]
struct GatedStore {
    inner: MemoryStore,
    gate: Mutex<()>,
    read_only: AtomicBool,
}

#[async_trait]
impl ProgramStore for GatedStore {
    async fn load(&self) -> anyhow::Result<Vec<Program>> {
        self.inner.load().await
    }

    async fn save(&self, programs: &[Program]) -> anyhow::Result<()> {
        let _open = self.gate.lock().await;
        if self.read_only.load(Ordering::SeqCst) {
            anyhow::bail!("read-only fs");
        }
        self.inner.save(programs).await
    }
}

fn gated_registry() -> (Registry, Arc<GatedStore>) {
    let store = Arc::new(GatedStore::default());
    let registry = Registry::new(
        Arc::clone(&store) as Arc<dyn ProgramStore>,
        fast_options(),
        16 * 1024,
    );
    (registry, store)
}

async fn running_pid(registry: &Registry, name: &str) -> u32 {
    let process = registry.process(name).unwrap();
    wait_for_state(&process, ProcessState::Running).await;
    assert!(
        wait_until(DEFAULT_TIMEOUT, || process.pid().is_some()).await,
        "{name} has no pid"
    );
    process.pid().unwrap()
}

fn events_text(registry: &Registry) -> String {
    String::from_utf8_lossy(&registry.events().backlog()).into_owned()
}

// ===========================================================================
// Start / stop / remove
// ===========================================================================

#[tokio::test]
async fn test_start_then_stop_and_wait() {
    let (registry, store) = registry_with(vec![]);
    assert_eq!(
        registry.add_or_update(program("web", "sleep 30")).await.unwrap(),
        Change::Added
    );
    assert_eq!(store.save_count(), 1);

    registry.start("web").unwrap();
    let pid = running_pid(&registry, "web").await;
    assert!(pid_is_alive(pid));

    registry.stop_and_wait("web").await.unwrap();
    let status = registry.get("web").unwrap();
    assert_eq!(status.status, ProcessState::Stopped);
    assert_eq!(status.pid, None);
    assert!(wait_for_pid_gone(pid, DEFAULT_TIMEOUT));

    let events = events_text(&registry);
    for line in [
        "web added\n",
        "[web] state: stopped -> running\n",
        "[web] state: running -> stopping\n",
        "[web] state: stopping -> stopped\n",
    ] {
        assert!(events.contains(line), "missing {line:?} in {events:?}");
    }
}

#[tokio::test]
async fn test_remove_running_program_kills_child() {
    let (registry, store) = registry_with(vec![]);
    registry.add_or_update(program("web", "sleep 30")).await.unwrap();
    registry.start("web").unwrap();
    let pid = running_pid(&registry, "web").await;

    registry.remove("web").await.unwrap();
    assert!(registry.list().is_empty());
    assert!(matches!(registry.get("web"), Err(Error::NotFound(_))));
    assert!(wait_for_pid_gone(pid, DEFAULT_TIMEOUT));
    assert!(store.programs().is_empty());
}

#[tokio::test]
async fn test_unknown_program_is_not_found() {
    let (registry, _) = registry_with(vec![]);
    assert!(matches!(registry.start("ghost"), Err(Error::NotFound(_))));
    assert!(matches!(
        registry.remove("ghost").await,
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        registry.trigger_webhook("ghost").await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn test_quick_crash_ends_fatal_after_retries() {
    let (registry, _) = registry_with(vec![]);
    let mut pg = program("crash", "exit 1");
    pg.start_retries = 2;
    registry.add_or_update(pg).await.unwrap();

    registry.start("crash").unwrap();
    let process = registry.process("crash").unwrap();
    wait_for_state(&process, ProcessState::Fatal).await;
    assert_eq!(process.retries_left(), 0);
    assert_eq!(process.pid(), None);

    let events = events_text(&registry);
    assert_eq!(
        events
            .matches("[crash] state: retry wait -> running\n")
            .count(),
        2,
        "{events}"
    );
    assert!(events.contains("[crash] state: running -> fatal\n"));
}

// ===========================================================================
// Update
// ===========================================================================

#[tokio::test]
async fn test_identical_update_is_noop() {
    let (registry, store) = registry_with(vec![]);
    registry.add_or_update(program("web", "sleep 30")).await.unwrap();
    registry.start("web").unwrap();
    let pid = running_pid(&registry, "web").await;
    let before = registry.process("web").unwrap();
    let saves = store.save_count();

    assert_eq!(
        registry.add_or_update(program("web", "sleep 30")).await.unwrap(),
        Change::Unchanged
    );
    tokio::time::sleep(Duration::from_millis(200)).await;

    let after = registry.process("web").unwrap();
    assert!(after.same(&before));
    assert_eq!(after.state(), ProcessState::Running);
    assert_eq!(after.pid(), Some(pid));
    assert_eq!(store.save_count(), saves);
}

#[tokio::test]
async fn test_update_running_program_restarts_with_new_definition() {
    let (registry, store) = registry_with(vec![]);
    registry.add_or_update(program("web", "sleep 30")).await.unwrap();
    registry.start("web").unwrap();
    let old_pid = running_pid(&registry, "web").await;
    let old = registry.process("web").unwrap();

    assert_eq!(
        registry.add_or_update(program("web", "sleep 31")).await.unwrap(),
        Change::Updating
    );

    assert!(
        wait_until(DEFAULT_TIMEOUT, || {
            registry
                .process("web")
                .is_ok_and(|p| !p.same(&old) && p.state() == ProcessState::Running)
        })
        .await,
        "update never swapped in a running process"
    );
    let fresh = registry.process("web").unwrap();
    assert_eq!(fresh.program().command, "sleep 31");
    let new_pid = running_pid(&registry, "web").await;
    assert_ne!(new_pid, old_pid);
    assert!(wait_for_pid_gone(old_pid, DEFAULT_TIMEOUT));
    assert_eq!(old.state(), ProcessState::Stopped);

    assert!(
        wait_until(DEFAULT_TIMEOUT, || store
            .programs()
            .first()
            .is_some_and(|p| p.command == "sleep 31"))
        .await
    );
    assert!(events_text(&registry).contains("web update\n"));
}

#[tokio::test]
async fn test_back_to_back_updates_keep_the_latest() {
    let (registry, store) = registry_with(vec![]);
    registry.add_or_update(program("web", "sleep 30")).await.unwrap();
    registry.start("web").unwrap();
    running_pid(&registry, "web").await;

    assert_eq!(
        registry.add_or_update(program("web", "sleep 40")).await.unwrap(),
        Change::Updating
    );
    assert_eq!(
        registry.add_or_update(program("web", "sleep 50")).await.unwrap(),
        Change::Updating
    );
    // Same as the pending definition.
    assert_eq!(
        registry.add_or_update(program("web", "sleep 50")).await.unwrap(),
        Change::Unchanged
    );

    assert!(
        wait_until(DEFAULT_TIMEOUT, || registry.process("web").is_ok_and(|p| {
            p.program().command == "sleep 50" && p.state() == ProcessState::Running
        }))
        .await,
        "latest update never landed: {:?}",
        registry.get("web").map(|s| s.program.command)
    );
    assert!(
        wait_until(DEFAULT_TIMEOUT, || store
            .programs()
            .first()
            .is_some_and(|p| p.command == "sleep 50"))
        .await
    );
    // Nothing lands afterwards.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(registry.process("web").unwrap().program().command, "sleep 50");

    registry.shutdown().await;
}

#[tokio::test]
async fn test_start_during_pending_update_leaves_one_child() {
    let (registry, store) = gated_registry();
    let mut web = program("web", "trap '' TERM; sleep 30");
    web.stop_timeout = 1;
    registry.add_or_update(web.clone()).await.unwrap();
    registry.start("web").unwrap();
    running_pid(&registry, "web").await;
    let old = registry.process("web").unwrap();
    // Let the trap install so the stop takes the full timeout.
    tokio::time::sleep(Duration::from_millis(200)).await;

    web.command = "sleep 30".into();
    assert_eq!(registry.add_or_update(web).await.unwrap(), Change::Updating);

    // Park the mutation lock in a save so the swap cannot happen yet.
    let gate = store.gate.lock().await;
    let blocker = {
        let registry = registry.clone();
        tokio::spawn(async move { registry.add_or_update(program("other", "sleep 30")).await })
    };
    wait_for_state(&old, ProcessState::Stopped).await;

    assert_eq!(registry.start("web").unwrap(), ProcessState::Running);
    let revived = running_pid(&registry, "web").await;

    drop(gate);
    blocker.await.unwrap().unwrap();

    assert!(
        wait_until(Duration::from_secs(15), || registry
            .process("web")
            .is_ok_and(|p| !p.same(&old) && p.state() == ProcessState::Running))
        .await,
        "update never swapped in a running process"
    );
    assert!(wait_for_pid_gone(revived, DEFAULT_TIMEOUT));
    assert_eq!(old.state(), ProcessState::Stopped);
    assert!(old.is_retired());
    assert_eq!(old.start().unwrap(), ProcessState::Stopped);

    registry.shutdown().await;
    assert_eq!(old.pid(), None);
}

#[tokio::test]
async fn test_start_racing_remove_leaves_no_child() {
    let (registry, _) = registry_with(vec![]);
    registry.add_or_update(program("web", "sleep 30")).await.unwrap();
    registry.start("web").unwrap();
    let first = running_pid(&registry, "web").await;
    let process = registry.process("web").unwrap();

    let remove = {
        let registry = registry.clone();
        tokio::spawn(async move { registry.remove("web").await })
    };
    let mut pids = vec![first];
    while !remove.is_finished() {
        let _ = process.start();
        if let Some(pid) = process.pid()
            && !pids.contains(&pid)
        {
            pids.push(pid);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    remove.await.unwrap().unwrap();

    assert!(matches!(registry.get("web"), Err(Error::NotFound(_))));
    assert!(process.is_retired());
    assert!(!process.state().is_active());
    assert_eq!(process.start().unwrap(), ProcessState::Stopped);
    for pid in pids {
        assert!(wait_for_pid_gone(pid, DEFAULT_TIMEOUT), "pid {pid} survived");
    }
}

#[tokio::test]
async fn test_failed_save_rolls_back_add() {
    let (registry, store) = gated_registry();
    store.read_only.store(true, Ordering::SeqCst);

    assert!(matches!(
        registry.add_or_update(program("web", "sleep 30")).await,
        Err(Error::Store(_))
    ));
    assert!(registry.names().is_empty());
    assert!(matches!(registry.get("web"), Err(Error::NotFound(_))));
    assert!(!events_text(&registry).contains("web added"));

    store.read_only.store(false, Ordering::SeqCst);
    assert_eq!(
        registry.add_or_update(program("web", "sleep 30")).await.unwrap(),
        Change::Added
    );
    assert_eq!(store.inner.programs().len(), 1);
}

#[tokio::test]
async fn test_update_stopped_program_stays_stopped() {
    let (registry, _) = registry_with(vec![]);
    registry.add_or_update(program("web", "sleep 30")).await.unwrap();
    let old = registry.process("web").unwrap();

    registry.add_or_update(program("web", "sleep 31")).await.unwrap();
    assert!(
        wait_until(DEFAULT_TIMEOUT, || registry
            .process("web")
            .is_ok_and(|p| !p.same(&old)))
        .await
    );
    let fresh = registry.process("web").unwrap();
    assert_eq!(fresh.program().command, "sleep 31");
    assert_eq!(fresh.state(), ProcessState::Stopped);
}

#[tokio::test]
async fn test_invalid_program_rejected() {
    let (registry, store) = registry_with(vec![]);
    assert!(matches!(
        registry.add_or_update(program("", "sleep 1")).await,
        Err(Error::InvalidProgram(_))
    ));
    assert!(matches!(
        registry.add_or_update(program("web", "  ")).await,
        Err(Error::InvalidProgram(_))
    ));
    assert!(registry.list().is_empty());
    assert_eq!(store.save_count(), 0);
}

// ===========================================================================
// Store reconcile
// ===========================================================================

#[tokio::test]
async fn test_reload_reconciles_with_store() {
    let (registry, store) = registry_with(vec![program("a", "sleep 30"), program("b", "sleep 30")]);
    registry.load_from_store().await.unwrap();
    assert_eq!(registry.names(), vec!["a", "b"]);
    registry.start("a").unwrap();
    let old_pid = running_pid(&registry, "a").await;

    store.set(vec![program("c", "sleep 30"), program("a", "sleep 32")]);
    registry.load_from_store().await.unwrap();

    assert_eq!(registry.names(), vec!["c", "a"]);
    assert!(matches!(registry.get("b"), Err(Error::NotFound(_))));
    assert_eq!(registry.get("c").unwrap().status, ProcessState::Stopped);

    assert!(
        wait_until(DEFAULT_TIMEOUT, || registry
            .process("a")
            .is_ok_and(|p| p.program().command == "sleep 32"))
        .await
    );
    let new_pid = running_pid(&registry, "a").await;
    assert_ne!(new_pid, old_pid);
    assert_eq!(store.save_count(), 0);
}

#[tokio::test]
async fn test_reload_rejects_duplicates() {
    let (registry, store) = registry_with(vec![program("a", "sleep 30")]);
    registry.load_from_store().await.unwrap();

    store.set(vec![program("a", "sleep 30"), program("a", "sleep 31")]);
    assert!(matches!(
        registry.load_from_store().await,
        Err(Error::DuplicateProgram(name)) if name == "a"
    ));
    assert_eq!(registry.names(), vec!["a"]);
}

#[tokio::test]
async fn test_yaml_store_round_trip_through_registry() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("programs.yml");
    let store: Arc<dyn ProgramStore> = Arc::new(YamlStore::new(&path));
    let registry = Registry::new(Arc::clone(&store), fast_options(), 4096);

    let mut web = program("web", "sleep 30");
    web.environ = vec!["PORT=8000".into()];
    web.start_auto = true;
    registry.add_or_update(web.clone()).await.unwrap();
    registry.add_or_update(program("worker", "sleep 30")).await.unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.contains("name: web"), "{text}");

    let reloaded = Registry::new(store, fast_options(), 4096);
    reloaded.load_from_store().await.unwrap();
    assert_eq!(reloaded.names(), vec!["web", "worker"]);
    assert_eq!(reloaded.process("web").unwrap().program(), &web);
}

#[tokio::test]
async fn test_auto_start_only_marked_programs() {
    let mut auto = program("auto", "sleep 30");
    auto.start_auto = true;
    let (registry, _) = registry_with(vec![auto, program("manual", "sleep 30")]);
    registry.load_from_store().await.unwrap();

    registry.auto_start();
    running_pid(&registry, "auto").await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(registry.get("manual").unwrap().status, ProcessState::Stopped);

    registry.shutdown().await;
}

// ===========================================================================
// Environment, output, notifications
// ===========================================================================

#[tokio::test]
async fn test_environment_reaches_child() {
    let (registry, _) = registry_with(vec![]);
    let mut pg = program("env", "echo \"$GREETING from $TARGET\"; sleep 30");
    pg.environ = vec!["GREETING=hello".into(), "TARGET=env".into()];
    registry.add_or_update(pg).await.unwrap();
    registry.start("env").unwrap();

    let process = registry.process("env").unwrap();
    assert!(
        wait_until(DEFAULT_TIMEOUT, || String::from_utf8_lossy(&process.stdout().backlog())
            .contains("hello from env\n"))
        .await,
        "stdout: {:?}",
        process.stdout().backlog()
    );
    registry.stop_and_wait("env").await.unwrap();
}

#[tokio::test]
async fn test_launch_failure_notifies() {
    let (notifier, mut rx) = RecordingNotifier::channel();
    let opts = ProcessOptions {
        notifier,
        ..fast_options()
    };
    let registry = Registry::new(Arc::new(MemoryStore::new(vec![])), opts, 4096);

    let mut pg = program("broken", "true");
    pg.dir = "/nonexistent/suvd-test-dir".into();
    registry.add_or_update(pg).await.unwrap();

    assert_eq!(registry.start("broken").unwrap(), ProcessState::Fatal);
    let (name, event) = tokio::time::timeout(DEFAULT_TIMEOUT, rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(name, "broken");
    assert_eq!(event, NotifyEvent::Fatal);
}

// ===========================================================================
// Webhook
// ===========================================================================

#[tokio::test]
async fn test_webhook_restarts_running_program() {
    let dir = tempfile::tempdir().unwrap();
    let (registry, _) = registry_with(vec![]);
    let mut pg = program("site", "sleep 30");
    pg.dir = dir.path().to_string_lossy().into_owned();
    pg.webhook.command = "echo deploying; touch deployed".into();
    pg.webhook.timeout = 10;
    registry.add_or_update(pg).await.unwrap();

    registry.start("site").unwrap();
    let old_pid = running_pid(&registry, "site").await;

    let handle = registry.trigger_webhook("site").await.unwrap();
    assert!(wait_for_pid_gone(old_pid, DEFAULT_TIMEOUT));
    tokio::time::timeout(DEFAULT_TIMEOUT, handle)
        .await
        .unwrap()
        .unwrap();

    assert!(dir.path().join("deployed").exists());
    let new_pid = running_pid(&registry, "site").await;
    assert_ne!(new_pid, old_pid);
    let output = registry.process("site").unwrap().output().backlog();
    assert!(String::from_utf8_lossy(&output).contains("deploying\n"));

    registry.stop_and_wait("site").await.unwrap();
}

#[tokio::test]
async fn test_webhook_leaves_stopped_program_stopped() {
    let (registry, _) = registry_with(vec![]);
    let mut pg = program("site", "sleep 30");
    pg.webhook.command = "true".into();
    registry.add_or_update(pg).await.unwrap();

    let handle = registry.trigger_webhook("site").await.unwrap();
    tokio::time::timeout(DEFAULT_TIMEOUT, handle)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(registry.get("site").unwrap().status, ProcessState::Stopped);
}

#[tokio::test]
async fn test_webhook_requires_command() {
    let (registry, _) = registry_with(vec![]);
    registry.add_or_update(program("site", "sleep 30")).await.unwrap();
    assert!(matches!(
        registry.trigger_webhook("site").await,
        Err(Error::NoWebhook(_))
    ));
}

// ===========================================================================
// Shutdown
// ===========================================================================

#[tokio::test]
async fn test_shutdown_stops_everything() {
    let (registry, _) = registry_with(vec![]);
    registry.add_or_update(program("a", "sleep 30")).await.unwrap();
    registry.add_or_update(program("b", "sleep 30")).await.unwrap();
    let mut stubborn = program("stubborn", "trap '' TERM; sleep 30");
    stubborn.stop_timeout = 1;
    registry.add_or_update(stubborn).await.unwrap();
    registry.add_or_update(program("idle", "sleep 30")).await.unwrap();

    let mut pids = Vec::new();
    for name in ["a", "b", "stubborn"] {
        registry.start(name).unwrap();
        pids.push(running_pid(&registry, name).await);
    }
    // Let the trap install before the stop arrives.
    tokio::time::sleep(Duration::from_millis(200)).await;

    tokio::time::timeout(Duration::from_secs(15), registry.shutdown())
        .await
        .expect("shutdown hung");

    for status in registry.list() {
        assert_eq!(status.status, ProcessState::Stopped, "{}", status.program.name);
        assert_eq!(status.pid, None);
    }
    for pid in pids {
        assert!(wait_for_pid_gone(pid, DEFAULT_TIMEOUT), "pid {pid} survived");
    }
}
