use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use regex::{Regex, RegexBuilder};
use tracing::debug;

use stackscope_types::{LevelFilter, LogEntry, TimeRange};

use crate::store::ArcLogEntry;

/// Filter configuration as chosen by the operator
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LogFilter {
    /// Services to include (empty = all)
    pub services: BTreeSet<String>,

    /// Severity selection
    pub level: LevelFilter,

    /// Time window
    pub time_range: TimeRange,

    /// Search text (empty = no text filter)
    pub search: String,

    /// Treat `search` as a regular expression
    pub regex: bool,
}

impl LogFilter {
    pub fn with_services<I, S>(mut self, services: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.services = services.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_level(mut self, level: LevelFilter) -> Self {
        self.level = level;
        self
    }

    pub fn with_time_range(mut self, time_range: TimeRange) -> Self {
        self.time_range = time_range;
        self
    }

    pub fn with_search(mut self, search: impl Into<String>, regex: bool) -> Self {
        self.search = search.into();
        self.regex = regex;
        self
    }

    /// Check if the filter matches everything
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
            && self.level == LevelFilter::All
            && self.time_range == TimeRange::All
            && self.search.is_empty()
    }
}

/// Case-insensitive line matcher.
///
/// Regex mode falls back to a plain substring match when the pattern does not
/// compile, so a half-typed pattern never stops the view from updating.
#[derive(Clone, Debug)]
pub enum TextMatcher {
    /// No search text
    Any,
    /// Compiled case-insensitive pattern
    Pattern(Regex),
    /// Lowercased needle
    Substring(String),
}

impl TextMatcher {
    pub fn new(text: &str, regex_enabled: bool) -> Self {
        if text.is_empty() {
            return Self::Any;
        }

        if regex_enabled {
            match RegexBuilder::new(text).case_insensitive(true).build() {
                Ok(re) => return Self::Pattern(re),
                Err(e) => {
                    debug!(pattern = text, error = %e, "invalid search regex, using substring match");
                }
            }
        }

        Self::Substring(text.to_lowercase())
    }

    pub fn is_match(&self, line: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Pattern(re) => re.is_match(line),
            Self::Substring(needle) => line.to_lowercase().contains(needle.as_str()),
        }
    }

    /// Whether the search is running as a regular expression
    pub fn is_regex(&self) -> bool {
        matches!(self, Self::Pattern(_))
    }
}

#[derive(Clone, Copy, Debug)]
enum TimeWindow {
    Unbounded,
    /// Keep entries younger than `window` relative to `now`
    Sliding { now: DateTime<Utc>, window: Duration },
    /// Keep entries within `[start, end]`
    Between { start: DateTime<Utc>, end: DateTime<Utc> },
}

impl TimeWindow {
    fn new(range: TimeRange, now: DateTime<Utc>) -> Self {
        match range {
            TimeRange::All => Self::Unbounded,
            TimeRange::Custom { start, end } => Self::Between {
                start: start.unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
                end: end.unwrap_or(now),
            },
            fixed => match fixed.window() {
                Some(window) => Self::Sliding { now, window },
                None => Self::Unbounded,
            },
        }
    }

    fn contains(&self, ts: DateTime<Utc>) -> bool {
        match *self {
            Self::Unbounded => true,
            Self::Sliding { now, window } => now.signed_duration_since(ts) < window,
            Self::Between { start, end } => start <= ts && ts <= end,
        }
    }
}

/// A [`LogFilter`] evaluated once against a fixed "now"
#[derive(Clone, Debug)]
pub struct CompiledFilter {
    /// Services to include (empty = all)
    services: BTreeSet<String>,

    /// Severity selection
    level: LevelFilter,

    /// Resolved time bounds
    window: TimeWindow,

    /// Text matcher
    text: TextMatcher,
}

impl CompiledFilter {
    /// Compile a filter configuration, resolving relative time ranges against `now`
    pub fn compile(filter: &LogFilter, now: DateTime<Utc>) -> Self {
        Self {
            services: filter.services.clone(),
            level: filter.level,
            window: TimeWindow::new(filter.time_range, now),
            text: TextMatcher::new(&filter.search, filter.regex),
        }
    }

    /// Check if a log entry matches this filter
    pub fn matches(&self, entry: &LogEntry) -> bool {
        if !self.services.is_empty() && !self.services.contains(&entry.service) {
            return false;
        }

        if !self.level.matches(entry.level) {
            return false;
        }

        if !self.window.contains(entry.timestamp) {
            return false;
        }

        self.text.is_match(&entry.line)
    }

    /// Matching subset, in original order
    pub fn apply(&self, entries: &[ArcLogEntry]) -> Vec<ArcLogEntry> {
        entries
            .iter()
            .filter(|e| self.matches(e))
            .cloned()
            .collect()
    }

    pub fn text(&self) -> &TextMatcher {
        &self.text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use stackscope_types::LogLevel;
    use std::sync::Arc;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    fn entry(id: u64, service: &str, level: LogLevel, age_secs: i64, line: &str) -> ArcLogEntry {
        Arc::new(LogEntry {
            id,
            service: service.to_string(),
            line: line.to_string(),
            timestamp: now() - Duration::seconds(age_secs),
            level,
            source: None,
        })
    }

    fn ids(entries: &[ArcLogEntry]) -> Vec<u64> {
        entries.iter().map(|e| e.id).collect()
    }

    fn sample() -> Vec<ArcLogEntry> {
        vec![
            entry(0, "api", LogLevel::Info, 10, "GET /health 200"),
            entry(1, "db", LogLevel::Error, 20, "connection refused"),
            entry(2, "api", LogLevel::Error, 400, "upstream timeout [pool=main]"),
            entry(3, "cache", LogLevel::Warn, 30, "evicting keys"),
            entry(4, "api", LogLevel::Error, 60, "Upstream TIMEOUT again"),
            entry(5, "db", LogLevel::Debug, 7_200, "vacuum finished"),
        ]
    }

    #[test]
    fn test_empty_filter_keeps_everything() {
        let filter = CompiledFilter::compile(&LogFilter::default(), now());
        assert_eq!(ids(&filter.apply(&sample())), vec![0, 1, 2, 3, 4, 5]);
        assert!(LogFilter::default().is_empty());
    }

    #[test]
    fn test_service_filter() {
        let config = LogFilter::default().with_services(["api", "cache"]);
        let filter = CompiledFilter::compile(&config, now());
        assert_eq!(ids(&filter.apply(&sample())), vec![0, 2, 3, 4]);
    }

    #[test]
    fn test_level_filter_is_exact() {
        let config = LogFilter::default().with_level(LevelFilter::Only(LogLevel::Warn));
        let filter = CompiledFilter::compile(&config, now());
        assert_eq!(ids(&filter.apply(&sample())), vec![3]);
    }

    #[test]
    fn test_sliding_time_window() {
        let config = LogFilter::default().with_time_range(TimeRange::Last5m);
        let filter = CompiledFilter::compile(&config, now());
        assert_eq!(ids(&filter.apply(&sample())), vec![0, 1, 3, 4]);

        let config = LogFilter::default().with_time_range(TimeRange::Last1h);
        let filter = CompiledFilter::compile(&config, now());
        assert_eq!(ids(&filter.apply(&sample())), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_window_edge_is_exclusive() {
        let edge = vec![entry(0, "api", LogLevel::Info, 300, "exactly five minutes old")];
        let config = LogFilter::default().with_time_range(TimeRange::Last5m);
        assert!(CompiledFilter::compile(&config, now()).apply(&edge).is_empty());
    }

    #[test]
    fn test_custom_range_bounds() {
        let start = now() - Duration::seconds(100);
        let end = now() - Duration::seconds(20);
        let config = LogFilter::default().with_time_range(TimeRange::custom(Some(start), Some(end)));
        let filter = CompiledFilter::compile(&config, now());
        // bounds are inclusive
        assert_eq!(ids(&filter.apply(&sample())), vec![1, 3, 4]);

        let config = LogFilter::default().with_time_range(TimeRange::custom(None, Some(end)));
        let filter = CompiledFilter::compile(&config, now());
        assert_eq!(ids(&filter.apply(&sample())), vec![1, 2, 3, 4, 5]);

        let config = LogFilter::default().with_time_range(TimeRange::custom(Some(start), None));
        let filter = CompiledFilter::compile(&config, now());
        assert_eq!(ids(&filter.apply(&sample())), vec![0, 1, 3, 4]);
    }

    #[test]
    fn test_substring_search_is_case_insensitive() {
        let config = LogFilter::default().with_search("timeout", false);
        let filter = CompiledFilter::compile(&config, now());
        assert_eq!(ids(&filter.apply(&sample())), vec![2, 4]);
    }

    #[test]
    fn test_regex_search() {
        let config = LogFilter::default().with_search(r"^upstream\s+timeout", true);
        let filter = CompiledFilter::compile(&config, now());
        assert!(filter.text().is_regex());
        assert_eq!(ids(&filter.apply(&sample())), vec![2, 4]);
    }

    #[test]
    fn test_invalid_regex_falls_back_to_substring() {
        let config = LogFilter::default().with_search("[", true);
        let filter = CompiledFilter::compile(&config, now());
        assert!(!filter.text().is_regex());
        assert_eq!(ids(&filter.apply(&sample())), vec![2]);
    }

    #[test]
    fn test_regex_disabled_treats_metacharacters_literally() {
        let config = LogFilter::default().with_search("pool=main]", false);
        let filter = CompiledFilter::compile(&config, now());
        assert_eq!(ids(&filter.apply(&sample())), vec![2]);

        let matcher = TextMatcher::new(".*", false);
        assert!(!matcher.is_match("anything"));
        assert!(matcher.is_match("literal .* here"));
    }

    #[test]
    fn test_stages_combine() {
        let config = LogFilter::default()
            .with_services(["api"])
            .with_level(LevelFilter::Only(LogLevel::Error))
            .with_time_range(TimeRange::Last5m)
            .with_search("again", false);
        let filter = CompiledFilter::compile(&config, now());
        assert_eq!(ids(&filter.apply(&sample())), vec![4]);
    }

    #[test]
    fn test_filter_is_idempotent() {
        let config = LogFilter::default()
            .with_level(LevelFilter::Only(LogLevel::Error))
            .with_search("t", false);
        let entries = sample();
        let first = CompiledFilter::compile(&config, now()).apply(&entries);
        let second = CompiledFilter::compile(&config, now()).apply(&entries);
        assert_eq!(ids(&first), ids(&second));
        assert_eq!(entries.len(), 6);
    }
}
