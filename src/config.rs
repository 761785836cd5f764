//! Configuration file handling
//!
//! Settings come from an optional TOML file (`stackscope.toml` in the working
//! directory unless `--config` points elsewhere); command-line flags override
//! individual values afterwards.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tracing::debug;

use stackscope_logs::{
    DRAIN_BATCH_SIZE, LevelFilter, LogFilter, MAX_LOGS, StreamConfig, THROTTLE_INTERVAL, TimeRange,
};
use stackscope_types::parse_timestamp;

/// Config file picked up from the working directory when `--config` is absent
pub const DEFAULT_CONFIG_FILE: &str = "stackscope.toml";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub stream: StreamSettings,
    pub report: ReportSettings,
    pub filter: FilterSettings,
    pub input: InputSettings,
    #[serde(rename = "follow")]
    pub follows: Vec<FollowSettings>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StreamSettings {
    pub capacity: usize,
    pub throttle_interval_ms: u64,
    pub drain_batch: usize,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            capacity: MAX_LOGS,
            throttle_interval_ms: THROTTLE_INTERVAL.as_millis() as u64,
            drain_batch: DRAIN_BATCH_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReportSettings {
    /// How often a summary is printed
    pub interval_ms: u64,
    /// Most recent matching lines included in each summary
    pub tail: usize,
    /// Emit JSON instead of text
    pub json: bool,
}

impl Default for ReportSettings {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            tail: 5,
            json: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FilterSettings {
    pub services: Vec<String>,
    pub level: String,
    pub time_range: String,
    /// Custom range start (RFC 3339); implies a custom range
    pub from: Option<String>,
    /// Custom range end (RFC 3339); implies a custom range
    pub to: Option<String>,
    pub search: String,
    pub regex: bool,
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self {
            services: Vec::new(),
            level: "all".to_string(),
            time_range: "all".to_string(),
            from: None,
            to: None,
            search: String::new(),
            regex: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InputSettings {
    /// Read events from stdin
    pub stdin: bool,
    /// Service name for stdin lines that are not JSON events
    pub stdin_service: String,
}

impl Default for InputSettings {
    fn default() -> Self {
        Self {
            stdin: true,
            stdin_service: "stdin".to_string(),
        }
    }
}

/// A child process whose output is streamed as one service
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FollowSettings {
    pub service: String,
    pub command: Vec<String>,
}

impl FollowSettings {
    /// Parse `SERVICE=COMMAND ARGS...` as given on the command line
    pub fn parse_arg(arg: &str) -> Result<Self, String> {
        let (service, command) = arg
            .split_once('=')
            .ok_or_else(|| format!("expected SERVICE=COMMAND, got '{arg}'"))?;
        let service = service.trim();
        let command: Vec<String> = command.split_whitespace().map(str::to_string).collect();
        if service.is_empty() || command.is_empty() {
            return Err(format!("expected SERVICE=COMMAND, got '{arg}'"));
        }
        Ok(Self {
            service: service.to_string(),
            command,
        })
    }
}

impl Settings {
    /// Load settings from `path`, or from the default file if present
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let default = Path::new(DEFAULT_CONFIG_FILE);
                if default.exists() {
                    Self::from_file(default)
                } else {
                    debug!("no {} found, using defaults", DEFAULT_CONFIG_FILE);
                    Ok(Self::default())
                }
            }
        }
    }

    fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&contents)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let settings: Self = toml::from_str(contents)?;
        Ok(settings)
    }

    /// Reject values the stream cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.stream.capacity == 0 {
            bail!("stream.capacity must be greater than zero");
        }
        if self.stream.throttle_interval_ms == 0 {
            bail!("stream.throttle_interval_ms must be greater than zero");
        }
        if self.stream.drain_batch == 0 {
            bail!("stream.drain_batch must be greater than zero");
        }
        if self.report.interval_ms == 0 {
            bail!("report.interval_ms must be greater than zero");
        }
        if let Some(follow) = self.follows.iter().find(|f| f.command.is_empty()) {
            bail!("follow command for service '{}' is empty", follow.service);
        }
        Ok(())
    }

    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            capacity: self.stream.capacity,
            throttle_interval: Duration::from_millis(self.stream.throttle_interval_ms),
            drain_batch: self.stream.drain_batch,
        }
    }

    /// Initial filter for the stream
    pub fn log_filter(&self) -> Result<LogFilter> {
        let filter = &self.filter;
        let level: LevelFilter = filter.level.parse()?;

        let time_range = if filter.from.is_some() || filter.to.is_some() {
            let start = filter.from.as_deref().map(parse_timestamp).transpose()?;
            let end = filter.to.as_deref().map(parse_timestamp).transpose()?;
            TimeRange::custom(start, end)
        } else {
            filter.time_range.parse()?
        };

        Ok(LogFilter::default()
            .with_services(filter.services.iter().cloned())
            .with_level(level)
            .with_time_range(time_range)
            .with_search(filter.search.clone(), filter.regex))
    }
}
