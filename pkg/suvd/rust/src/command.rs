// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::env::{expand_home, expand_vars, parse_assignments};
use crate::program::Program;
use log::{debug, warn};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::fs::{File, OpenOptions};
use tokio::process::Command;
use uzers::os::unix::UserExt;

pub const SHELL: &str = "/bin/sh";
pub const OUTPUT_FILE: &str = "output.log";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunAs {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: String,
}

/// Everything needed to run a shell line on behalf of a program: merged
/// environment, working directory and optional user switch.
#[derive(Debug, Clone)]
pub struct Launch {
    env: BTreeMap<String, String>,
    dir: Option<PathBuf>,
    run_as: Option<RunAs>,
}

impl Launch {
    pub fn for_program(program: &Program) -> Self {
        Self::with_base_env(program, std::env::vars())
    }

    fn with_base_env(program: &Program, inherited: impl IntoIterator<Item = (String, String)>) -> Self {
        let mut env: BTreeMap<String, String> = inherited.into_iter().collect();

        let run_as = resolve_user(program);
        if let Some(user) = &run_as {
            env.insert("HOME".into(), user.home.clone());
            env.insert("USER".into(), user.name.clone());
        }
        env.extend(parse_assignments(&program.name, &program.environ));

        let dir = if program.dir.trim().is_empty() {
            None
        } else {
            let expanded = expand_vars(&program.dir, |key| env.get(key).cloned());
            let expanded = expand_home(&expanded, env.get("HOME").map(String::as_str));
            Some(PathBuf::from(expanded))
        };

        Self { env, dir, run_as }
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub fn run_as(&self) -> Option<&RunAs> {
        self.run_as.as_ref()
    }

    /// `/bin/sh -c <line>` in its own process group, stdin closed, output piped.
    pub fn command(&self, line: &str) -> Command {
        let mut cmd = Command::new(SHELL);
        cmd.arg("-c")
            .arg(line)
            .env_clear()
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(false);
        if let Some(dir) = &self.dir {
            cmd.current_dir(dir);
        }
        if let Some(user) = &self.run_as {
            cmd.uid(user.uid).gid(user.gid);
        }
        cmd
    }
}

/// Look up the run-as user. Switching needs root; otherwise the program runs
/// as the current user.
fn resolve_user(program: &Program) -> Option<RunAs> {
    let name = program.user.trim();
    if name.is_empty() {
        return None;
    }
    if uzers::get_current_uid() != 0 {
        warn!(
            "[{}] not running as root, ignoring user {name:?}",
            program.name
        );
        return None;
    }
    let Some(user) = uzers::get_user_by_name(name) else {
        warn!("[{}] user {name:?} not found, running as root", program.name);
        return None;
    };
    debug!("[{}] running as {name} (uid={})", program.name, user.uid());
    Some(RunAs {
        name: name.to_string(),
        uid: user.uid(),
        gid: user.primary_group_id(),
        home: user.home_dir().to_string_lossy().into_owned(),
    })
}

/// Keep a program name usable as a single path component.
pub fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.chars().all(|c| c == '.') {
        cleaned.replace('.', "_")
    } else {
        cleaned
    }
}

pub fn output_path(log_dir: &Path, name: &str) -> PathBuf {
    log_dir.join(sanitize_name(name)).join(OUTPUT_FILE)
}

/// Open the program's output file for append. Failures are logged and the
/// program runs without a file.
pub async fn open_output(program: &Program, log_dir: Option<&Path>) -> Option<File> {
    if program.log_disable {
        return None;
    }
    let path = output_path(log_dir?, &program.name);
    if let Some(parent) = path.parent()
        && let Err(e) = tokio::fs::create_dir_all(parent).await
    {
        warn!("[{}] cannot create {}: {e}", program.name, parent.display());
        return None;
    }
    match OpenOptions::new().create(true).append(true).open(&path).await {
        Ok(file) => Some(file),
        Err(e) => {
            warn!("[{}] cannot open {}: {e}", program.name, path.display());
            None
        }
    }
}
