use chrono::{DateTime, Utc};
use serde_json::Value;

use stackscope_types::{LogEvent, LogLevel};

/// Longest leading token that is still considered a timestamp prefix
const MAX_TIMESTAMP_LEN: usize = 40;

/// Turns raw container/pod output lines into wire events
pub struct LogParser;

impl LogParser {
    /// Parse a raw line as produced by `docker logs -t` / `kubectl logs --timestamps`
    /// (or without a timestamp prefix at all).
    ///
    /// The level is left unset when nothing recognisable is found, so the
    /// ingestion default applies.
    pub fn parse(raw: &str, service: &str, source: Option<&str>) -> LogEvent {
        let raw = raw.trim_end_matches(['\r', '\n']);
        let (timestamp, content) = Self::extract_timestamp(raw);
        let level = Self::try_parse_json_level(content).or_else(|| Self::extract_level_from_text(content));

        LogEvent {
            service: service.to_string(),
            line: content.to_string(),
            timestamp: timestamp.unwrap_or_else(Utc::now).to_rfc3339(),
            level,
            source: source.map(str::to_string),
        }
    }

    /// Split off a leading RFC 3339 timestamp
    fn extract_timestamp(raw: &str) -> (Option<DateTime<Utc>>, &str) {
        let token_end = raw.find(char::is_whitespace).unwrap_or(raw.len());
        if token_end < 20 || token_end > MAX_TIMESTAMP_LEN {
            return (None, raw);
        }

        match DateTime::parse_from_rfc3339(&raw[..token_end]) {
            Ok(ts) => (Some(ts.with_timezone(&Utc)), raw[token_end..].trim_start()),
            Err(_) => (None, raw),
        }
    }

    /// Extract a level from a structured (JSON object) line
    fn try_parse_json_level(content: &str) -> Option<LogLevel> {
        let trimmed = content.trim();
        if !trimmed.starts_with('{') {
            return None;
        }

        let value: Value = serde_json::from_str(trimmed).ok()?;
        let fields = value.as_object()?;

        let level_fields = [
            "level",
            "lvl",
            "severity",
            "log.level",
            "loglevel",
            "log_level",
            "Level",
            "LEVEL",
        ];

        level_fields
            .iter()
            .filter_map(|field| fields.get(*field))
            .find_map(|value| match value {
                Value::String(s) => LogLevel::parse(s),
                // pino/bunyan numeric levels
                Value::Number(n) => n.as_u64().map(|num| match num {
                    0..=20 => LogLevel::Debug,
                    21..=30 => LogLevel::Info,
                    31..=40 => LogLevel::Warn,
                    _ => LogLevel::Error,
                }),
                _ => None,
            })
    }

    /// Extract log level from plain text patterns
    fn extract_level_from_text(content: &str) -> Option<LogLevel> {
        let upper = content.to_uppercase();

        // Check for bracketed patterns first [ERROR], [WARN], etc.
        let bracket_patterns = [
            ("[FATAL]", LogLevel::Error),
            ("[PANIC]", LogLevel::Error),
            ("[CRITICAL]", LogLevel::Error),
            ("[ERROR]", LogLevel::Error),
            ("[ERR]", LogLevel::Error),
            ("[WARN]", LogLevel::Warn),
            ("[WARNING]", LogLevel::Warn),
            ("[INFO]", LogLevel::Info),
            ("[DEBUG]", LogLevel::Debug),
            ("[TRACE]", LogLevel::Debug),
        ];

        // Colon patterns: ERROR:, WARN:, etc.
        let colon_patterns = [
            ("FATAL:", LogLevel::Error),
            ("PANIC:", LogLevel::Error),
            ("ERROR:", LogLevel::Error),
            ("ERR:", LogLevel::Error),
            ("WARNING:", LogLevel::Warn),
            ("WARN:", LogLevel::Warn),
            ("INFO:", LogLevel::Info),
            ("DEBUG:", LogLevel::Debug),
            ("TRACE:", LogLevel::Debug),
        ];

        // Spaced patterns: " ERROR ", " WARN ", etc.
        let spaced_patterns = [
            (" FATAL ", LogLevel::Error),
            (" PANIC ", LogLevel::Error),
            (" ERROR ", LogLevel::Error),
            (" WARN ", LogLevel::Warn),
            (" WARNING ", LogLevel::Warn),
            (" INFO ", LogLevel::Info),
            (" DEBUG ", LogLevel::Debug),
            (" TRACE ", LogLevel::Debug),
        ];

        for (pattern, level) in bracket_patterns
            .iter()
            .chain(colon_patterns.iter())
            .chain(spaced_patterns.iter())
        {
            if upper.contains(pattern) {
                return Some(*level);
            }
        }

        // Level at start of line
        let start_patterns = [
            ("FATAL", LogLevel::Error),
            ("PANIC", LogLevel::Error),
            ("ERROR", LogLevel::Error),
            ("WARN", LogLevel::Warn),
            ("INFO", LogLevel::Info),
            ("DEBUG", LogLevel::Debug),
            ("TRACE", LogLevel::Debug),
        ];

        let trimmed_upper = upper.trim_start();
        start_patterns
            .iter()
            .find(|(pattern, _)| trimmed_upper.starts_with(pattern))
            .map(|(_, level)| *level)
    }
}
