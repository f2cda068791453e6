// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Response envelope shared by every transport.

use crate::error::Error;
use serde::{Deserialize, Serialize};

/// `{"status": 0, "value": ...}` on success, `{"status": N, "error": "..."}`
/// otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response<T> {
    pub status: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> Response<T> {
    pub fn ok(value: T) -> Self {
        Self {
            status: 0,
            value: Some(value),
            error: None,
        }
    }

    pub fn err(error: &Error) -> Self {
        Self {
            status: error.status(),
            value: None,
            error: Some(error.to_string()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == 0
    }
}

impl<T> From<Result<T, Error>> for Response<T> {
    fn from(result: Result<T, Error>) -> Self {
        match result {
            Ok(value) => Response::ok(value),
            Err(e) => Response::err(&e),
        }
    }
}
