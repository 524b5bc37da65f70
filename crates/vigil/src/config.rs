// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 vigil contributors

//! Startup settings, merged from the environment and the command line.
//!
//! Both sources use the same comma-separated `key` / `key=value` token
//! syntax. Malformed tokens are ignored rather than fatal; monitoring is an
//! auxiliary facility and must never stop the host from starting. Settings
//! from the environment only take effect when the source also carries
//! `unlock-experimental` (a plain user environment variable must not flip on
//! monitoring by accident).

use std::fmt;
use std::time::Duration;

use log::{debug, LevelFilter};

/// Default reserved capture area: 8 MiB.
pub const DEFAULT_AREA_SIZE: usize = 8 * 1024 * 1024;

/// Default interval between periodic background flushes.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Off,
    /// Enabled, deferring to the agent's own connectivity checks.
    Auto,
    /// Enabled unconditionally.
    Force,
}

impl Mode {
    pub fn is_enabled(self) -> bool {
        self != Mode::Off
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
    Off,
}

impl LogLevel {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "trace" => Some(Self::Trace),
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warning" => Some(Self::Warning),
            "error" => Some(Self::Error),
            "off" => Some(Self::Off),
            _ => None,
        }
    }

    pub fn filter(self) -> LevelFilter {
        match self {
            Self::Trace => LevelFilter::Trace,
            Self::Debug => LevelFilter::Debug,
            Self::Info => LevelFilter::Info,
            Self::Warning => LevelFilter::Warn,
            Self::Error => LevelFilter::Error,
            Self::Off => LevelFilter::Off,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Off => "off",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub mode: Mode,
    pub log_level: LogLevel,
    pub area_size: usize,
    pub flush_interval: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            mode: Mode::Off,
            log_level: LogLevel::Warning,
            area_size: DEFAULT_AREA_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
        }
    }
}

impl Settings {
    /// The `log` filter matching the configured level.
    pub fn level_filter(&self) -> LevelFilter {
        self.log_level.filter()
    }

    /// Merge the environment source, then the command-line source on top.
    /// Later sources win per key.
    pub fn from_sources(env_args: Option<&str>, cli_args: Option<&str>) -> Self {
        let mut settings = Settings::default();
        if let Some(args) = env_args {
            settings.apply(args, true);
        }
        if let Some(args) = cli_args {
            settings.apply(args, false);
        }
        settings
    }

    fn apply(&mut self, args: &str, needs_unlock: bool) {
        let tokens: Vec<&str> = args
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .collect();
        if needs_unlock && !tokens.contains(&"unlock-experimental") {
            debug!("environment settings ignored (not unlocked): {:?}", args);
            return;
        }

        // `log+native` is more specific than `log` and wins regardless of
        // token order within the source
        let mut plain_log = None;
        let mut native_log = None;

        for token in tokens {
            let (key, value) = match token.split_once('=') {
                Some((k, v)) => (k, Some(v)),
                None => (token, None),
            };
            match (key, value) {
                ("enable", None) | ("enable", Some("force")) => self.mode = Mode::Force,
                ("enable", Some("auto")) => self.mode = Mode::Auto,
                ("enable", Some("off")) => self.mode = Mode::Off,
                ("unlock-experimental", None) => {}
                ("log", Some(v)) => plain_log = LogLevel::parse(v),
                ("log+native", Some(v)) => native_log = LogLevel::parse(v),
                ("memory", Some(v)) => {
                    if let Ok(bytes) = v.parse::<usize>() {
                        if bytes > 0 {
                            self.area_size = bytes;
                        }
                    } else {
                        debug!("ignoring malformed memory size {:?}", v);
                    }
                }
                ("flushInterval", Some(v)) => {
                    if let Ok(millis) = v.parse::<u64>() {
                        self.flush_interval = Duration::from_millis(millis);
                    } else {
                        debug!("ignoring malformed flush interval {:?}", v);
                    }
                }
                _ => debug!("ignoring unknown option {:?}", token),
            }
        }

        if let Some(level) = native_log.or(plain_log) {
            self.log_level = level;
        }
    }
}
