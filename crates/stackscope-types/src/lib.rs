//! Shared types for stackscope
//!
//! This crate contains data structures used across multiple stackscope crates:
//! the wire event delivered by an event source, the retained log entry, and the
//! small value types (levels, time ranges, rooms) the filter engine consumes.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// Errors produced when parsing wire or configuration values
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("unknown log level: {0}")]
    Level(String),

    #[error("unknown time range: {0} (expected all, 5m, 1h, 24h or custom)")]
    TimeRange(String),

    #[error("invalid room name: {0}")]
    Room(String),

    #[error("invalid timestamp: {0}")]
    Timestamp(String),
}

// ============================================================================
// Log Levels
// ============================================================================

/// Log severity level
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    #[default]
    Info,
    Warn,
    Error,
    Debug,
}

impl LogLevel {
    /// Parse log level from common spellings, `None` if unrecognised
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "info" | "inf" | "information" | "notice" => Some(Self::Info),
            "warn" | "warning" | "wrn" => Some(Self::Warn),
            "error" | "err" | "erro" | "fatal" | "panic" | "critical" | "crit" => {
                Some(Self::Error)
            }
            "debug" | "dbg" | "debg" | "trace" | "trc" => Some(Self::Debug),
            _ => None,
        }
    }

    /// Lowercase name as used on the wire
    pub fn name(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Debug => "debug",
        }
    }

    /// Short display string (3 chars)
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "INF",
            Self::Warn => "WRN",
            Self::Error => "ERR",
            Self::Debug => "DBG",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for LogLevel {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| ParseError::Level(s.to_string()))
    }
}

/// Severity selection for the filter engine
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum LevelFilter {
    #[default]
    All,
    Only(LogLevel),
}

impl LevelFilter {
    /// Check whether an entry of the given level passes
    pub fn matches(&self, level: LogLevel) -> bool {
        match self {
            Self::All => true,
            Self::Only(wanted) => *wanted == level,
        }
    }
}

impl fmt::Display for LevelFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("all"),
            Self::Only(level) => level.fmt(f),
        }
    }
}

impl FromStr for LevelFilter {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("all") {
            Ok(Self::All)
        } else {
            s.parse().map(Self::Only)
        }
    }
}

// ============================================================================
// Time Ranges
// ============================================================================

/// Time range for log filtering
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum TimeRange {
    /// No time restriction
    #[default]
    All,
    /// Last 5 minutes
    Last5m,
    /// Last 1 hour
    Last1h,
    /// Last 24 hours
    Last24h,
    /// Explicit bounds, inclusive. A missing start means the Unix epoch and a
    /// missing end means "now" at filter time.
    Custom {
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    },
}

impl TimeRange {
    /// Build a custom range
    pub fn custom(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        Self::Custom { start, end }
    }

    /// Sliding window length for the fixed ranges
    pub fn window(&self) -> Option<Duration> {
        match self {
            Self::All | Self::Custom { .. } => None,
            Self::Last5m => Some(Duration::minutes(5)),
            Self::Last1h => Some(Duration::hours(1)),
            Self::Last24h => Some(Duration::hours(24)),
        }
    }

    /// Get display label for this time range
    pub fn label(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Last5m => "5m",
            Self::Last1h => "1h",
            Self::Last24h => "24h",
            Self::Custom { .. } => "custom",
        }
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for TimeRange {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "all" => Ok(Self::All),
            "5m" => Ok(Self::Last5m),
            "1h" => Ok(Self::Last1h),
            "24h" => Ok(Self::Last24h),
            "custom" => Ok(Self::custom(None, None)),
            _ => Err(ParseError::TimeRange(s.to_string())),
        }
    }
}

// ============================================================================
// Event Source Types
// ============================================================================

/// Subscription room on the event source
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Room {
    /// `logs:all`, every service
    All,
    /// `logs:<service>`
    Service(String),
}

impl Room {
    const PREFIX: &'static str = "logs:";

    /// Check whether an event from `service` is delivered to this room
    pub fn covers(&self, service: &str) -> bool {
        match self {
            Self::All => true,
            Self::Service(name) => name == service,
        }
    }
}

impl fmt::Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "{}all", Self::PREFIX),
            Self::Service(name) => write!(f, "{}{}", Self::PREFIX, name),
        }
    }
}

impl FromStr for Room {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.strip_prefix(Self::PREFIX) {
            Some("all") => Ok(Self::All),
            Some(name) if !name.is_empty() => Ok(Self::Service(name.to_string())),
            _ => Err(ParseError::Room(s.to_string())),
        }
    }
}

/// Connection state reported by the event source
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Connecting,
    #[default]
    Disconnected,
}

impl ConnectionStatus {
    /// Data shown while not connected may be stale
    pub fn is_stale(&self) -> bool {
        !matches!(self, Self::Connected)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected => f.write_str("connected"),
            Self::Connecting => f.write_str("connecting"),
            Self::Disconnected => f.write_str("disconnected"),
        }
    }
}

/// A log event as delivered by the event source
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    pub service: String,
    pub line: String,
    pub timestamp: String,
    #[serde(
        default,
        deserialize_with = "deserialize_level",
        skip_serializing_if = "Option::is_none"
    )]
    pub level: Option<LogLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl LogEvent {
    pub fn new(service: impl Into<String>, line: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            service: service.into(),
            line: line.into(),
            timestamp: timestamp.to_rfc3339(),
            level: None,
            source: None,
        }
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = Some(level);
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Unknown level strings are treated as absent rather than failing the event
fn deserialize_level<'de, D>(deserializer: D) -> Result<Option<LogLevel>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(raw.as_ref().and_then(|v| v.as_str()).and_then(LogLevel::parse))
}

/// Parse an event timestamp (RFC 3339, naive ISO 8601 as UTC, or epoch millis)
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, ParseError> {
    let s = s.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Ok(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Ok(naive.and_utc());
        }
    }
    s.parse::<i64>()
        .ok()
        .and_then(DateTime::from_timestamp_millis)
        .ok_or_else(|| ParseError::Timestamp(s.to_string()))
}

// ============================================================================
// Log Entries
// ============================================================================

/// A single retained log entry
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    /// Unique ingestion ID
    pub id: u64,

    /// Producing service
    pub service: String,

    /// Raw log line
    pub line: String,

    /// When the source says the line was produced
    pub timestamp: DateTime<Utc>,

    /// Severity, `Info` when the source omitted it
    pub level: LogLevel,

    /// Sub-origin tag such as stdout/stderr
    pub source: Option<String>,
}

impl LogEntry {
    /// Build an entry from a wire event. `received_at` is only used when the
    /// event's own timestamp cannot be parsed.
    pub fn from_event(id: u64, event: LogEvent, received_at: DateTime<Utc>) -> Self {
        let timestamp = parse_timestamp(&event.timestamp).unwrap_or(received_at);
        Self {
            id,
            service: event.service,
            line: event.line,
            timestamp,
            level: event.level.unwrap_or_default(),
            source: event.source,
        }
    }
}
