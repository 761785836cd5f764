//! Log processing for stackscope
//!
//! This crate provides the streaming core: an unbounded ingest buffer fed by an
//! event source, a throttled drain into a bounded store, and the filter and
//! insight engine that derive the operator's view from that store.

mod drain;
mod filter;
mod ingest;
mod insight;
mod parser;
mod source;
mod store;
mod stream;
mod view;

pub use drain::{DRAIN_BATCH_SIZE, DrainScheduler, Drainer, THROTTLE_INTERVAL};
pub use filter::{CompiledFilter, LogFilter, TextMatcher};
pub use ingest::IngestBuffer;
pub use insight::{ErrorPattern, Insights, MAX_PATTERNS, PATTERN_KEY_CHARS};
pub use parser::LogParser;
pub use source::{EventCallback, EventSource, LogHub, Subscription};
pub use store::{ArcLogEntry, LevelCounts, LogStore, MAX_LOGS, StoreSnapshot};
pub use stream::{LogStream, StreamConfig};
pub use view::{FilterCache, FilteredView};

// Re-export types used in our public API
pub use stackscope_types::{
    ConnectionStatus, LevelFilter, LogEntry, LogEvent, LogLevel, ParseError, Room, TimeRange,
};
