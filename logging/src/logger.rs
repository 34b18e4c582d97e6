// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::io::Write;

use chrono::Timelike;
use colored::Colorize;
use log::{Level, LevelFilter};

const TIME_FORMAT_STR: &str = "%H:%M:%S";

/// The process's logging verbosity, set once from CLI flags at startup.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    Quiet,
    Normal,
    Verbose,
    Trace,
}

impl From<Verbosity> for LevelFilter {
    fn from(v: Verbosity) -> Self {
        match v {
            Verbosity::Quiet => LevelFilter::Warn,
            Verbosity::Normal => LevelFilter::Info,
            Verbosity::Verbose => LevelFilter::Debug,
            Verbosity::Trace => LevelFilter::Trace,
        }
    }
}

/// Parse a `-v` occurrence count (as produced by e.g. clap's `ArgAction::Count`) into a
/// `Verbosity`, with `-q` taking precedence when both are set.
pub fn verbosity_from_flags(verbose_count: u8, quiet: bool) -> Verbosity {
    if quiet {
        return Verbosity::Quiet;
    }
    match verbose_count {
        0 => Verbosity::Normal,
        1 => Verbosity::Verbose,
        _ => Verbosity::Trace,
    }
}

/// Initialize the global `log` backend. Safe to call more than once; later calls are no-ops
/// (mirrors `env_logger`'s own idempotence).
pub fn init(verbosity: Verbosity, use_color: bool) {
    let level: LevelFilter = verbosity.into();
    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);
    builder.format(move |buf, record| {
        let now = chrono::Local::now();
        let time_str = format!(
            "{}.{:02}",
            now.format(TIME_FORMAT_STR),
            now.time().nanosecond() / 10_000_000
        );
        let level_marker = colorize_level(record.level(), use_color);
        writeln!(
            buf,
            "{} {} {}: {}",
            time_str,
            level_marker,
            record.target(),
            record.args()
        )
    });
    // `try_init` rather than `init`: tests in several crates in this workspace call `init`
    // more than once within the same process.
    let _ = builder.try_init();
}

fn colorize_level(level: Level, use_color: bool) -> String {
    let text = format!("[{level}]");
    if !use_color {
        return text;
    }
    match level {
        Level::Error => text.red().to_string(),
        Level::Warn => text.yellow().to_string(),
        Level::Info => text.normal().to_string(),
        Level::Debug => text.green().to_string(),
        Level::Trace => text.magenta().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_flags_map_as_expected() {
        assert_eq!(verbosity_from_flags(0, false), Verbosity::Normal);
        assert_eq!(verbosity_from_flags(1, false), Verbosity::Verbose);
        assert_eq!(verbosity_from_flags(5, false), Verbosity::Trace);
        assert_eq!(verbosity_from_flags(3, true), Verbosity::Quiet);
    }

    #[test]
    fn verbosity_orders_from_quiet_to_trace() {
        assert!(Verbosity::Quiet < Verbosity::Normal);
        assert!(Verbosity::Normal < Verbosity::Verbose);
        assert!(Verbosity::Verbose < Verbosity::Trace);
    }
}
