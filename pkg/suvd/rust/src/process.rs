// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! One supervised program: its state machine, its OS child and its output.
//!
//! Every launch is owned by a single supervision task. That task races the
//! child's exit against the stop slot, applies the retry policy after an
//! unrequested exit, and performs the SIGTERM to SIGKILL escalation when a stop
//! is requested. Other callers only ever talk to it through FSM events.

use crate::broadcast::Broadcaster;
use crate::cancel::{CancelReceiver, CancelSlot, Delivery};
use crate::command::{self, Launch};
use crate::config::{Settings, Timings};
use crate::error::Result;
use crate::fsm::{Fsm, Transition};
use crate::notify::{LogNotifier, Notifier, NotifyEvent};
use crate::program::Program;
use crate::state::{ProcessEvent, ProcessState};
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use time::macros::format_description;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdout};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

/// Slack on top of the stop timeout before a restart gives up waiting.
const STOP_GRACE: Duration = Duration::from_secs(2);
const READ_CHUNK: usize = 8 * 1024;

#[derive(Clone)]
pub struct ProcessOptions {
    pub timings: Timings,
    pub output_buffer_size: usize,
    pub subscriber_queue: usize,
    /// Root of per-program output files; `None` disables them.
    pub log_dir: Option<PathBuf>,
    pub notifier: Arc<dyn Notifier>,
}

impl ProcessOptions {
    pub fn from_settings(settings: &Settings, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            timings: settings.timings,
            output_buffer_size: settings.output_buffer_size,
            subscriber_queue: settings.subscriber_queue,
            log_dir: settings.log_dir(),
            notifier,
        }
    }
}

impl Default for ProcessOptions {
    fn default() -> Self {
        let settings = Settings::default();
        Self {
            log_dir: None,
            ..Self::from_settings(&settings, Arc::new(LogNotifier))
        }
    }
}

/// Read-only view of a program and its process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramStatus {
    pub program: Program,
    pub status: ProcessState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

type ProcessFsm = Fsm<ProcessState, ProcessEvent, Arc<Shared>>;

#[derive(Clone)]
pub struct Process {
    shared: Arc<Shared>,
}

struct Shared {
    program: Program,
    opts: ProcessOptions,
    fsm: ProcessFsm,
    output: Broadcaster,
    stdout: Broadcaster,
    stderr: Broadcaster,
    retry_left: AtomicU32,
    /// Set once the registry dropped this process; starts become no-ops.
    retired: AtomicBool,
    generation: AtomicU64,
    pid: AtomicU32,
    cancel: CancelSlot,
    state_tx: watch::Sender<ProcessState>,
}

/// A launched child and everything tied to its lifetime.
struct Run {
    child: Child,
    pid: u32,
    started: Instant,
    cancel: CancelReceiver,
    sink: Arc<OutputSink>,
    pumps: JoinHandle<()>,
}

impl Process {
    /// Build a stopped process. Must be called within a Tokio runtime once
    /// events are issued, since handlers spawn tasks.
    pub fn new(program: Program, opts: ProcessOptions) -> Result<Self> {
        use ProcessEvent::*;
        use ProcessState::*;

        let mut fsm = ProcessFsm::new(Stopped);
        fsm.add_handler(Stopped, Start, start_fresh)?
            .add_handler(Fatal, Start, start_again)?
            .add_handler(Running, Stop, request_stop)?
            .add_handler(RetryWait, Stop, request_stop)?
            .add_handler(Running, Restart, restart_later)?;

        let buffer = opts.output_buffer_size;
        let queue = opts.subscriber_queue;
        let (state_tx, _) = watch::channel(Stopped);
        let shared = Arc::new(Shared {
            retry_left: AtomicU32::new(program.start_retries),
            retired: AtomicBool::new(false),
            program,
            opts,
            fsm,
            output: Broadcaster::new(buffer, queue),
            stdout: Broadcaster::new(buffer, queue),
            stderr: Broadcaster::new(buffer, queue),
            generation: AtomicU64::new(0),
            pid: AtomicU32::new(0),
            cancel: CancelSlot::new(),
            state_tx,
        });

        let weak = Arc::downgrade(&shared);
        shared.fsm.add_observer(move |old, new| {
            if let Some(shared) = weak.upgrade() {
                on_state_change(&shared, old, new);
            }
        });

        Ok(Self { shared })
    }

    pub fn start(&self) -> Result<ProcessState> {
        self.operate(ProcessEvent::Start)
    }

    pub fn stop(&self) -> Result<ProcessState> {
        self.operate(ProcessEvent::Stop)
    }

    pub fn restart(&self) -> Result<ProcessState> {
        self.operate(ProcessEvent::Restart)
    }

    pub fn operate(&self, event: ProcessEvent) -> Result<ProcessState> {
        Ok(self.shared.fsm.operate(&self.shared, event)?)
    }

    pub fn state(&self) -> ProcessState {
        self.shared.fsm.state()
    }

    /// Refuse every later start. Taken under the FSM lock, so a start racing
    /// this call either launches before it (and is stopped by the caller) or
    /// is ignored.
    pub(crate) fn retire(&self) {
        let shared = &self.shared;
        if let Err(e) = shared
            .fsm
            .transition(|_| shared.retired.store(true, Ordering::SeqCst))
        {
            warn!("[{}] cannot retire: {e}", shared.name());
            shared.retired.store(true, Ordering::SeqCst);
        }
    }

    pub fn is_retired(&self) -> bool {
        self.shared.retired.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    pub fn pid(&self) -> Option<u32> {
        match self.shared.pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    pub fn retries_left(&self) -> u32 {
        self.shared.retry_left.load(Ordering::SeqCst)
    }

    pub fn program(&self) -> &Program {
        &self.shared.program
    }

    pub fn name(&self) -> &str {
        &self.shared.program.name
    }

    /// Combined stdout and stderr.
    pub fn output(&self) -> &Broadcaster {
        &self.shared.output
    }

    pub fn stdout(&self) -> &Broadcaster {
        &self.shared.stdout
    }

    pub fn stderr(&self) -> &Broadcaster {
        &self.shared.stderr
    }

    /// Called with `(old, new)` on every state change, after the built-in
    /// observers and in registration order.
    pub fn add_observer<F>(&self, observer: F)
    where
        F: Fn(ProcessState, ProcessState) + Send + Sync + 'static,
    {
        self.shared.fsm.add_observer(observer);
    }

    pub fn watch_state(&self) -> watch::Receiver<ProcessState> {
        self.shared.state_tx.subscribe()
    }

    /// Wait until the process holds no child and has no pending relaunch.
    pub async fn wait_inactive(&self) {
        let mut rx = self.watch_state();
        // The sender lives as long as `self`.
        let _ = rx.wait_for(|s| !s.is_active()).await;
    }

    /// Same underlying process, not merely the same program.
    pub fn same(&self, other: &Process) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub fn status(&self) -> ProgramStatus {
        ProgramStatus {
            program: self.shared.program.clone(),
            status: self.state(),
            pid: self.pid(),
        }
    }

    /// Upper bound for a stop to complete, escalation included.
    pub fn stop_bound(&self) -> Duration {
        self.shared.stop_bound()
    }
}

impl Shared {
    fn name(&self) -> &str {
        &self.program.name
    }

    fn stop_bound(&self) -> Duration {
        self.program.stop_timeout() + self.opts.timings.output_drain() + STOP_GRACE
    }

    fn commit(&self, state: ProcessState) {
        if let Err(e) = self.fsm.set_state(state) {
            warn!("[{}] cannot enter {state}: {e}", self.name());
        }
    }
}

fn on_state_change(shared: &Arc<Shared>, old: ProcessState, new: ProcessState) {
    debug!("[{}] {old} -> {new}", shared.name());
    shared.state_tx.send_replace(new);
    if new == ProcessState::Fatal {
        warn!("[{}] entered fatal state", shared.name());
        let notifier = Arc::clone(&shared.opts.notifier);
        let program = shared.program.clone();
        tokio::spawn(async move {
            if let Err(e) = notifier.notify(&program, NotifyEvent::Fatal).await {
                warn!("[{}] notification failed: {e:#}", program.name);
            }
        });
    }
}

// -- FSM handlers --

fn start_fresh(shared: &Arc<Shared>, t: &mut Transition<'_, ProcessState>) {
    if shared.retired.load(Ordering::SeqCst) {
        debug!("[{}] retired, ignoring start", shared.name());
        return;
    }
    shared
        .retry_left
        .store(shared.program.start_retries, Ordering::SeqCst);
    start_again(shared, t);
}

fn start_again(shared: &Arc<Shared>, t: &mut Transition<'_, ProcessState>) {
    if shared.retired.load(Ordering::SeqCst) {
        debug!("[{}] retired, ignoring start", shared.name());
        return;
    }
    if let Some(run) = start_command(shared, t) {
        tokio::spawn(supervise(Arc::clone(shared), run));
    }
}

fn request_stop(shared: &Arc<Shared>, _t: &mut Transition<'_, ProcessState>) {
    match shared.cancel.signal(shared.opts.timings.cancel_wait()) {
        Delivery::Delivered => debug!("[{}] stop requested", shared.name()),
        Delivery::Deferred => debug!("[{}] stop already pending, retrying", shared.name()),
        Delivery::NoListener => debug!("[{}] no run to stop", shared.name()),
    }
}

fn restart_later(shared: &Arc<Shared>, _t: &mut Transition<'_, ProcessState>) {
    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        let mut rx = shared.state_tx.subscribe();
        if let Err(e) = shared.fsm.operate(&shared, ProcessEvent::Stop) {
            warn!("[{}] restart: stop failed: {e}", shared.name());
            return;
        }
        let bound = shared.stop_bound();
        if timeout(bound, rx.wait_for(|s| !s.is_active())).await.is_err() {
            warn!(
                "[{}] restart: still active after {bound:?}, not starting again",
                shared.name()
            );
            return;
        }
        sleep(shared.opts.timings.restart_settle()).await;
        if let Err(e) = shared.fsm.operate(&shared, ProcessEvent::Start) {
            warn!("[{}] restart: start failed: {e}", shared.name());
        }
    });
}

// -- launch and supervision --

/// Spawn the child and commit `Running`, or commit `Fatal` when the spawn
/// fails.
fn start_command(shared: &Arc<Shared>, t: &mut Transition<'_, ProcessState>) -> Option<Run> {
    match launch(shared) {
        Ok(run) => {
            t.set(ProcessState::Running);
            spawn_retry_reset(shared);
            Some(run)
        }
        Err(e) => {
            warn!("[{}] failed to spawn: {e}", shared.name());
            t.set(ProcessState::Fatal);
            None
        }
    }
}

fn launch(shared: &Arc<Shared>) -> std::io::Result<Run> {
    let program = &shared.program;
    let cancel = shared.cancel.arm();
    let launch = Launch::for_program(program);
    if let Some(dir) = launch.dir() {
        debug!("[{}] use dir: {}", program.name, dir.display());
    }
    let mut child = launch.command(&program.command).spawn()?;
    let pid = child.id().unwrap_or_default();
    info!("[{}] spawned (pid={}, cmd={})", program.name, pid, program.command);

    let sink = Arc::new(OutputSink {
        name: program.name.clone(),
        output: shared.output.clone(),
        stdout: shared.stdout.clone(),
        stderr: shared.stderr.clone(),
        stderr_only: program.stderr_only,
        file: Mutex::new(None),
    });
    let pumps = tokio::spawn(pump_output(
        Arc::clone(shared),
        Arc::clone(&sink),
        child.stdout.take(),
        child.stderr.take(),
    ));

    shared.generation.fetch_add(1, Ordering::SeqCst);
    shared.pid.store(pid, Ordering::SeqCst);
    Ok(Run {
        child,
        pid,
        started: Instant::now(),
        cancel,
        sink,
        pumps,
    })
}

/// Restore the retry budget once the current run has stayed up for the reset
/// window.
fn spawn_retry_reset(shared: &Arc<Shared>) {
    let generation = shared.generation.load(Ordering::SeqCst);
    let window = shared.opts.timings.retry_reset();
    let weak: Weak<Shared> = Arc::downgrade(shared);
    tokio::spawn(async move {
        sleep(window).await;
        let Some(shared) = weak.upgrade() else {
            return;
        };
        if shared.generation.load(Ordering::SeqCst) != generation
            || shared.fsm.state() != ProcessState::Running
        {
            return;
        }
        let budget = shared.program.start_retries;
        let left = shared.retry_left.swap(budget, Ordering::SeqCst);
        if left < budget {
            debug!("[{}] reset retry from {left} to {budget}", shared.name());
        }
    });
}

async fn supervise(shared: Arc<Shared>, mut run: Run) {
    loop {
        let status = tokio::select! {
            status = run.child.wait() => status,
            _ = run.cancel.recv() => {
                info!("[{}] recv stop command", shared.name());
                stop_command(&shared, Some(run)).await;
                return;
            }
        };

        let elapsed = run.started.elapsed();
        match &status {
            Ok(status) => warn!(
                "[{}] exited with {status} after {:.3}s",
                shared.name(),
                elapsed.as_secs_f64()
            ),
            Err(e) => warn!("[{}] wait failed: {e}", shared.name()),
        }
        let cancel = finish_run(&shared, run, status).await;
        if elapsed < shared.program.min_run_time() {
            debug!("[{}] program exit too quick", shared.name());
            sleep(shared.opts.timings.quick_exit_pause()).await;
        }

        match wait_next_retry(&shared, cancel).await {
            Some(next) => run = next,
            None => return,
        }
    }
}

async fn wait_next_retry(shared: &Arc<Shared>, mut cancel: CancelReceiver) -> Option<Run> {
    if cancel.take_pending() {
        shared.commit(ProcessState::Stopped);
        return None;
    }

    let left = shared.retry_left.load(Ordering::SeqCst);
    if left == 0 {
        shared.commit(ProcessState::Fatal);
        return None;
    }
    shared.retry_left.store(left - 1, Ordering::SeqCst);
    shared.commit(ProcessState::RetryWait);

    tokio::select! {
        _ = sleep(shared.opts.timings.retry_delay()) => {}
        _ = cancel.recv() => {
            info!("[{}] stop requested while waiting to retry", shared.name());
            stop_command(shared, None).await;
            return None;
        }
    }

    warn!(
        "[{}] retry start program, left times: {}",
        shared.name(),
        left - 1
    );
    let relaunched = shared.fsm.transition(|t| {
        if t.state() != ProcessState::RetryWait {
            return None;
        }
        if cancel.take_pending() || shared.retired.load(Ordering::SeqCst) {
            t.set(ProcessState::Stopped);
            return None;
        }
        start_command(shared, t)
    });
    match relaunched {
        Ok(run) => run,
        Err(e) => {
            warn!("[{}] relaunch failed: {e}", shared.name());
            None
        }
    }
}

/// Terminate the run (SIGTERM, then SIGKILL after the stop timeout) and
/// commit `Stopped`.
async fn stop_command(shared: &Arc<Shared>, run: Option<Run>) {
    let Some(mut run) = run else {
        shared.commit(ProcessState::Stopped);
        return;
    };
    shared.commit(ProcessState::Stopping);

    info!("[{}] sending SIGTERM", shared.name());
    signal_group(shared.name(), run.pid, Signal::SIGTERM);

    let stop = shared.program.stop_timeout();
    let status = match timeout(stop, run.child.wait()).await {
        Ok(status) => {
            info!("[{}] program quit normally", shared.name());
            status
        }
        Err(_) => {
            warn!(
                "[{}] stop timeout ({}s) reached, sending SIGKILL",
                shared.name(),
                stop.as_secs()
            );
            signal_group(shared.name(), run.pid, Signal::SIGKILL);
            run.child.wait().await
        }
    };

    finish_run(shared, run, status).await;
    shared.commit(ProcessState::Stopped);
}

/// Drain the output pumps, append the exit marker, close the output file and
/// clear the pid. Returns the run's stop receiver for the retry wait.
async fn finish_run(
    shared: &Shared,
    run: Run,
    status: std::io::Result<ExitStatus>,
) -> CancelReceiver {
    let Run {
        mut pumps,
        sink,
        cancel,
        ..
    } = run;

    let drain = shared.opts.timings.output_drain();
    if timeout(drain, &mut pumps).await.is_err() {
        debug!(
            "[{}] output still open after {drain:?}, detaching",
            shared.name()
        );
        pumps.abort();
    }

    sink.write(Stream::Stderr, exit_marker(&status).as_bytes())
        .await;
    sink.close().await;
    shared.pid.store(0, Ordering::SeqCst);
    cancel
}

fn exit_marker(status: &std::io::Result<ExitStatus>) -> String {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    let stamp = now
        .format(format_description!(
            "[year]-[month]-[day] [hour]:[minute]:[second]"
        ))
        .unwrap_or_default();
    match status {
        Ok(s) if s.success() => format!("\n--- SUVD LOG {stamp} exit success ---\n\n"),
        Ok(s) => format!("\n--- SUVD LOG {stamp} exit fail {s} ---\n\n"),
        Err(e) => format!("\n--- SUVD LOG {stamp} exit fail {e} ---\n\n"),
    }
}

pub(crate) fn signal_group(name: &str, pid: u32, sig: Signal) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if raw <= 0 {
        return;
    }
    match killpg(Pid::from_raw(raw), sig) {
        Ok(()) => {}
        Err(Errno::ESRCH) => debug!("[{name}] process group {pid} already gone"),
        Err(e) => warn!("[{name}] failed to send {sig} to group {pid}: {e}"),
    }
}

// -- output --

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

/// Destination of one run's output: the three broadcasters and the optional
/// output file.
struct OutputSink {
    name: String,
    output: Broadcaster,
    stdout: Broadcaster,
    stderr: Broadcaster,
    stderr_only: bool,
    file: Mutex<Option<File>>,
}

impl OutputSink {
    async fn write(&self, stream: Stream, data: &[u8]) {
        match stream {
            Stream::Stdout => self.stdout.write(data),
            Stream::Stderr => self.stderr.write(data),
        };
        self.output.write(data);

        if stream == Stream::Stdout && self.stderr_only {
            return;
        }
        let mut file = self.file.lock().await;
        if let Some(f) = file.as_mut()
            && let Err(e) = f.write_all(data).await
        {
            warn!("[{}] output file write failed, closing it: {e}", self.name);
            *file = None;
        }
    }

    async fn close(&self) {
        if let Some(mut f) = self.file.lock().await.take()
            && let Err(e) = f.flush().await
        {
            debug!("[{}] output file flush failed: {e}", self.name);
        }
    }
}

async fn pump_output(
    shared: Arc<Shared>,
    sink: Arc<OutputSink>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
) {
    if let Some(file) = command::open_output(&shared.program, shared.opts.log_dir.as_deref()).await
    {
        *sink.file.lock().await = Some(file);
    }
    drop(shared);
    tokio::join!(
        pump(&sink, stdout, Stream::Stdout),
        pump(&sink, stderr, Stream::Stderr)
    );
}

async fn pump<R: AsyncRead + Unpin>(sink: &OutputSink, reader: Option<R>, stream: Stream) {
    let Some(mut reader) = reader else {
        return;
    };
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => sink.write(stream, &buf[..n]).await,
            Err(e) => {
                debug!("[{}] {stream:?} read failed: {e}", sink.name);
                break;
            }
        }
    }
}
