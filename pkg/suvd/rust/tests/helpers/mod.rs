// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

#![allow(dead_code)]

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use suvd::{Notifier, NotifyEvent, Process, ProcessOptions, ProcessState, Program, Timings};
use tokio::sync::mpsc;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Timing settings short enough for tests, written into `config.yml`.
pub const FAST_SETTINGS: &str = "\
timings:
  retry_delay_ms: 50
  restart_settle_ms: 50
  stop_poll_ms: 50
  output_drain_ms: 500
";

// ===========================================================================
// Daemon harness
// ===========================================================================

/// Handle to a running suvd daemon process.
pub struct DaemonHandle {
    child: Child,
    log_lines: Arc<Mutex<Vec<String>>>,
    readers: Vec<std::thread::JoinHandle<()>>,
}

impl DaemonHandle {
    /// Start the daemon with `SUVD_CONFIG_DIR` pointing to the given directory.
    pub fn start(config_dir: &Path) -> Self {
        let bin = env!("CARGO_BIN_EXE_suvd");
        let mut child = Command::new(bin)
            .env("SUVD_CONFIG_DIR", config_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .expect("failed to start suvd");

        let stdout = child.stdout.take().expect("failed to capture stdout");
        let stderr = child.stderr.take().expect("failed to capture stderr");
        let log_lines = Arc::new(Mutex::new(Vec::<String>::new()));

        // Log lines may land on either stream.
        let readers = vec![
            Self::collect(stdout, "daemon", Arc::clone(&log_lines)),
            Self::collect(stderr, "daemon:err", Arc::clone(&log_lines)),
        ];

        Self {
            child,
            log_lines,
            readers,
        }
    }

    fn collect<R: std::io::Read + Send + 'static>(
        stream: R,
        tag: &'static str,
        lines: Arc<Mutex<Vec<String>>>,
    ) -> std::thread::JoinHandle<()> {
        std::thread::spawn(move || {
            for line in BufReader::new(stream).lines() {
                match line {
                    Ok(l) => {
                        eprintln!("[{tag}] {l}");
                        lines.lock().unwrap().push(l);
                    }
                    Err(_) => break,
                }
            }
        })
    }

    /// Wait until a log line containing `pattern` appears, or timeout.
    pub fn wait_for_log(&self, pattern: &str, timeout: Duration) -> bool {
        self.wait_for_log_count(pattern, 1, timeout)
    }

    pub fn wait_for_log_default(&self, pattern: &str) -> bool {
        self.wait_for_log(pattern, DEFAULT_TIMEOUT)
    }

    /// Count how many log lines contain `pattern`.
    pub fn count_log_matches(&self, pattern: &str) -> usize {
        let lines = self.log_lines.lock().unwrap();
        lines.iter().filter(|l| l.contains(pattern)).count()
    }

    /// Wait until the count of log lines matching `pattern` reaches at least `n`.
    pub fn wait_for_log_count(&self, pattern: &str, n: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.count_log_matches(pattern) >= n {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    pub fn send_signal(&self, sig: Signal) {
        let pid = self.child.id() as i32;
        signal::kill(Pid::from_raw(pid), sig).expect("failed to send signal to daemon");
    }

    /// Send SIGTERM and wait for the daemon to exit.
    pub fn stop(&mut self) -> std::process::ExitStatus {
        self.send_signal(Signal::SIGTERM);
        self.wait_with_timeout(DEFAULT_TIMEOUT)
    }

    /// Wait for the daemon to exit within the given timeout, killing it after.
    /// Every log line is collected once this returns.
    pub fn wait_with_timeout(&mut self, timeout: Duration) -> std::process::ExitStatus {
        let status = self.wait_exit(timeout);
        for reader in self.readers.drain(..) {
            let _ = reader.join();
        }
        status
    }

    fn wait_exit(&mut self, timeout: Duration) -> std::process::ExitStatus {
        let deadline = Instant::now() + timeout;
        loop {
            match self
                .child
                .try_wait()
                .expect("failed to check daemon status")
            {
                Some(status) => return status,
                None => {
                    if Instant::now() >= deadline {
                        self.child.kill().ok();
                        return self.child.wait().expect("failed to wait on killed daemon");
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
            }
        }
    }

    /// Extract PIDs from "spawned (pid=NNN" log lines.
    pub fn spawned_pids(&self) -> Vec<u32> {
        let lines = self.log_lines.lock().unwrap();
        lines
            .iter()
            .filter_map(|l| {
                let marker = "spawned (pid=";
                let start = l.find(marker)? + marker.len();
                let end = l[start..].find(|c: char| !c.is_ascii_digit())? + start;
                l[start..end].parse().ok()
            })
            .collect()
    }
}

impl Drop for DaemonHandle {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

pub fn write_settings(dir: &Path, yaml: &str) {
    write_file(&dir.join("config.yml"), yaml);
}

pub fn write_programs(dir: &Path, yaml: &str) {
    write_file(&dir.join("programs.yml"), yaml);
}

fn write_file(path: &Path, contents: &str) {
    std::fs::write(path, contents)
        .unwrap_or_else(|e| panic!("failed to write {}: {e}", path.display()));
}

pub fn pid_is_alive(pid: u32) -> bool {
    signal::kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// Wait until a PID is no longer alive, or timeout.
pub fn wait_for_pid_gone(pid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !pid_is_alive(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

// ===========================================================================
// Library harness
// ===========================================================================

pub fn fast_options() -> ProcessOptions {
    ProcessOptions {
        timings: Timings {
            retry_delay_ms: 50,
            restart_settle_ms: 50,
            stop_poll_ms: 50,
            output_drain_ms: 500,
            ..Timings::default()
        },
        ..ProcessOptions::default()
    }
}

/// Forwards every notification to a channel.
pub struct RecordingNotifier(pub mpsc::UnboundedSender<(String, NotifyEvent)>);

impl RecordingNotifier {
    pub fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<(String, NotifyEvent)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self(tx)), rx)
    }
}

#[async_trait::async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, program: &Program, event: NotifyEvent) -> anyhow::Result<()> {
        let _ = self.0.send((program.name.clone(), event));
        Ok(())
    }
}

pub fn program(name: &str, command: &str) -> Program {
    Program::new(name, command)
}

/// Poll `cond` until it holds or `within` elapses.
pub async fn wait_until(within: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}

pub async fn wait_for_state(process: &Process, want: ProcessState) {
    let mut rx = process.watch_state();
    tokio::time::timeout(DEFAULT_TIMEOUT, rx.wait_for(|s| *s == want))
        .await
        .unwrap_or_else(|_| {
            panic!(
                "{} never reached {want}, now {}",
                process.name(),
                process.state()
            )
        })
        .unwrap();
}
