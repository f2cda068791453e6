// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::fsm::FsmError;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid program: {0}")]
    InvalidProgram(String),

    #[error("duplicated program name: {0}")]
    DuplicateProgram(String),

    #[error("program {0:?} not exists")]
    NotFound(String),

    #[error("program {0:?} has no webhook command")]
    NoWebhook(String),

    #[error(transparent)]
    Fsm(#[from] FsmError),

    #[error("program store: {0:#}")]
    Store(anyhow::Error),
}

impl Error {
    /// Status code used by the transport envelope; 0 is reserved for success.
    pub fn status(&self) -> i32 {
        match self {
            Error::NotFound(_) | Error::NoWebhook(_) => 1,
            Error::InvalidProgram(_) | Error::DuplicateProgram(_) => 2,
            Error::Fsm(_) | Error::Store(_) => 3,
        }
    }
}
