// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessState {
    /// Registered, never started or explicitly stopped.
    #[serde(rename = "stopped")]
    Stopped,
    /// Child process is alive.
    #[serde(rename = "running")]
    Running,
    /// SIGTERM sent, waiting for the child to go away.
    #[serde(rename = "stopping")]
    Stopping,
    /// Exited on its own, waiting out the retry delay.
    #[serde(rename = "retry wait")]
    RetryWait,
    /// Launch failed or the retry budget ran out.
    #[serde(rename = "fatal")]
    Fatal,
}

impl ProcessState {
    pub fn is_running(self) -> bool {
        matches!(self, ProcessState::Running | ProcessState::RetryWait)
    }

    /// A child handle exists or a relaunch is pending.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ProcessState::Running | ProcessState::RetryWait | ProcessState::Stopping
        )
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessState::Stopped => write!(f, "stopped"),
            ProcessState::Running => write!(f, "running"),
            ProcessState::Stopping => write!(f, "stopping"),
            ProcessState::RetryWait => write!(f, "retry wait"),
            ProcessState::Fatal => write!(f, "fatal"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessEvent {
    Start,
    Stop,
    Restart,
}

impl fmt::Display for ProcessEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessEvent::Start => write!(f, "start"),
            ProcessEvent::Stop => write!(f, "stop"),
            ProcessEvent::Restart => write!(f, "restart"),
        }
    }
}
