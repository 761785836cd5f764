use std::collections::HashMap;

use serde::Serialize;

use stackscope_types::{LogEntry, LogLevel};

/// Characters of an error line used as its grouping key
pub const PATTERN_KEY_CHARS: usize = 100;

/// Maximum number of repeated patterns reported
pub const MAX_PATTERNS: usize = 3;

/// A recurring error message
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ErrorPattern {
    /// Truncated message shared by every occurrence
    pub message: String,
    pub count: usize,
}

/// Summary of a filtered view
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Insights {
    pub error_count: usize,
    pub warning_count: usize,
    /// Most frequent repeated errors, highest count first
    pub patterns: Vec<ErrorPattern>,
}

impl Insights {
    /// Analyze a sequence of (already filtered) entries
    pub fn analyze<'a, I>(entries: I) -> Self
    where
        I: IntoIterator<Item = &'a LogEntry>,
    {
        let mut insights = Self::default();

        // Insertion order keeps ties in first-seen order after the stable sort
        let mut order: Vec<&'a str> = Vec::new();
        let mut counts: HashMap<&'a str, usize> = HashMap::new();

        for entry in entries {
            match entry.level {
                LogLevel::Error => {
                    insights.error_count += 1;
                    let key = pattern_key(&entry.line);
                    let count = counts.entry(key).or_insert_with(|| {
                        order.push(key);
                        0
                    });
                    *count += 1;
                }
                LogLevel::Warn => insights.warning_count += 1,
                LogLevel::Info | LogLevel::Debug => {}
            }
        }

        let mut repeated: Vec<ErrorPattern> = order
            .into_iter()
            .filter_map(|key| {
                let count = counts[key];
                (count > 1).then(|| ErrorPattern {
                    message: key.to_string(),
                    count,
                })
            })
            .collect();
        repeated.sort_by(|a, b| b.count.cmp(&a.count));
        repeated.truncate(MAX_PATTERNS);

        insights.patterns = repeated;
        insights
    }
}

/// First [`PATTERN_KEY_CHARS`] characters of a line, cut on a char boundary
fn pattern_key(line: &str) -> &str {
    match line.char_indices().nth(PATTERN_KEY_CHARS) {
        Some((idx, _)) => &line[..idx],
        None => line,
    }
}
