// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

// Debug code that shouldn't be in production
#![deny(clippy::dbg_macro)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::todo)]

pub mod api;
pub mod broadcast;
pub mod cancel;
pub mod command;
pub mod config;
mod env;
pub mod error;
pub mod fsm;
pub mod notify;
pub mod process;
pub mod program;
pub mod registry;
pub mod shutdown;
pub mod state;
pub mod store;
pub mod webhook;

pub use broadcast::{Broadcaster, Subscription};
pub use config::{Settings, Timings};
pub use error::{Error, Result};
pub use notify::{LogNotifier, Notifier, NotifyEvent, PushoverNotifier};
pub use process::{Process, ProcessOptions, ProgramStatus};
pub use program::Program;
pub use registry::{Change, Registry};
pub use state::{ProcessEvent, ProcessState};
pub use store::{MemoryStore, ProgramStore, YamlStore};
