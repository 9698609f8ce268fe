// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use std::fmt;
use std::fs::OpenOptions;
use std::str::FromStr;

use anyhow::Context;
use serde::Deserialize;
use serde::Serialize;
use slog::Drain;
use slog::Logger;

/// How log records should be rendered.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Unstructured text, intended for a person at a terminal.
    Human,
    /// Bunyan-formatted json, one record per line.
    #[default]
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Human => write!(f, "human"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "human" => Ok(LogFormat::Human),
            "json" => Ok(LogFormat::Json),
            _ => Err(format!("invalid log format: {s}")),
        }
    }
}

fn build_drain<W>(name: &'static str, writer: W, format: LogFormat) -> Logger
where
    W: std::io::Write + Send + 'static,
{
    match format {
        LogFormat::Human => {
            let decorator = slog_term::PlainDecorator::new(writer);
            let drain = slog_term::FullFormat::new(decorator).build().fuse();
            let drain = slog_async::Async::new(drain).build().fuse();
            Logger::root(drain, slog::o!("name" => name.to_string()))
        }
        LogFormat::Json => {
            let drain = slog_bunyan::with_name(name, writer).build().fuse();
            let drain = slog_async::Async::new(drain).build().fuse();
            Logger::root(drain, slog::o!())
        }
    }
}

/// Build the root logger for a daemon.  If `log_file` is set, records are
/// appended to that file, otherwise they go to stdout.
pub fn init(
    name: &'static str,
    log_file: &Option<String>,
    format: LogFormat,
) -> anyhow::Result<Logger> {
    let log = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {path}"))?;
            build_drain(name, file, format)
        }
        None => build_drain(name, std::io::stdout(), format),
    };
    Ok(log)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parse() {
        assert_eq!("human".parse::<LogFormat>(), Ok(LogFormat::Human));
        assert_eq!("JSON".parse::<LogFormat>(), Ok(LogFormat::Json));
        assert!("yaml".parse::<LogFormat>().is_err());
        assert_eq!(LogFormat::Human.to_string(), "human");
    }

    #[test]
    fn test_init_stdout() {
        let log = init("test", &None, LogFormat::Human).unwrap();
        slog::info!(log, "logger is alive"; "unit" => "test");
    }
}
