// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use log::warn;

/// Split `KEY=VALUE` entries. Entries without `=` or with an empty key are
/// skipped with a warning.
pub fn parse_assignments(name: &str, entries: &[String]) -> Vec<(String, String)> {
    let mut vars = Vec::with_capacity(entries.len());
    for entry in entries {
        match entry.split_once('=') {
            Some((key, val)) if !key.trim().is_empty() => {
                vars.push((key.trim().to_string(), val.to_string()));
            }
            _ => warn!("[{name}] ignoring malformed environ entry: {entry:?}"),
        }
    }
    vars
}

/// Expand `$VAR` and `${VAR}`. Unknown variables expand to the empty string; a
/// `$` not followed by a variable name is kept as is.
pub fn expand_vars(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        if let Some(braced) = after.strip_prefix('{')
            && let Some(end) = braced.find('}')
        {
            out.push_str(&lookup(&braced[..end]).unwrap_or_default());
            rest = &braced[end + 1..];
            continue;
        }
        let len = after
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(after.len());
        if len == 0 {
            out.push('$');
        } else {
            out.push_str(&lookup(&after[..len]).unwrap_or_default());
        }
        rest = &after[len..];
    }
    out.push_str(rest);
    out
}

/// Replace a leading `~` with `home`.
pub fn expand_home(path: &str, home: Option<&str>) -> String {
    match (path.strip_prefix('~'), home) {
        (Some(tail), Some(home)) => format!("{home}{tail}"),
        _ => path.to_string(),
    }
}
