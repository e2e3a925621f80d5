// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use std::fs::OpenOptions;
use std::str::FromStr;

use anyhow::Context;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use slog::Drain;

/// The format in which log records are emitted.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Eq,
    PartialEq,
    Deserialize,
    Serialize,
    JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Terminal-friendly, human readable output
    #[default]
    Human,
    /// Bunyan-style JSON records
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "human" => Ok(LogFormat::Human),
            "json" => Ok(LogFormat::Json),
            _ => Err(format!("invalid log format: {s}")),
        }
    }
}

fn async_root<D>(drain: D, name: &'static str) -> slog::Logger
where
    D: Drain<Ok = (), Err = slog::Never> + Send + 'static,
{
    let drain = slog_async::Async::new(drain).build().fuse();
    slog::Logger::root(drain, slog::o!("unit" => name))
}

/// Build the root logger for a process.  Records go to `log_file` if one is
/// given, and to stdout otherwise.
pub fn init(
    name: &'static str,
    log_file: &Option<String>,
    log_format: LogFormat,
) -> anyhow::Result<slog::Logger> {
    let file = match log_file {
        Some(path) => Some(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {path}"))?,
        ),
        None => None,
    };

    let log = match (log_format, file) {
        (LogFormat::Json, Some(f)) => {
            async_root(slog_bunyan::with_name(name, f).build().fuse(), name)
        }
        (LogFormat::Json, None) => async_root(
            slog_bunyan::with_name(name, std::io::stdout()).build().fuse(),
            name,
        ),
        (LogFormat::Human, Some(f)) => {
            let decorator = slog_term::PlainDecorator::new(f);
            async_root(
                slog_term::FullFormat::new(decorator).build().fuse(),
                name,
            )
        }
        (LogFormat::Human, None) => {
            let decorator = slog_term::TermDecorator::new().build();
            async_root(
                slog_term::FullFormat::new(decorator).build().fuse(),
                name,
            )
        }
    };

    Ok(log)
}
