use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::filter::{CompiledFilter, LogFilter};
use crate::insight::Insights;
use crate::store::{ArcLogEntry, StoreSnapshot};

/// Filtered entries plus their insight summary, derived from one store snapshot
#[derive(Clone, Debug, Default, Serialize)]
pub struct FilteredView {
    /// Store revision the view was computed from
    pub revision: u64,

    /// Entries in the store at that revision
    pub total: usize,

    /// Matching entries, in store order
    #[serde(skip)]
    pub entries: Vec<ArcLogEntry>,

    /// Error/warning counts and repeated error patterns
    pub insights: Insights,

    /// Regex search was requested but the pattern did not compile
    pub regex_fallback: bool,
}

impl FilteredView {
    /// Filter and analyze a snapshot
    pub fn build(snapshot: StoreSnapshot, filter: &LogFilter, now: DateTime<Utc>) -> Self {
        let compiled = CompiledFilter::compile(filter, now);
        let entries = compiled.apply(&snapshot.entries);
        let insights = Insights::analyze(entries.iter().map(|e| &**e));

        Self {
            revision: snapshot.revision,
            total: snapshot.entries.len(),
            entries,
            insights,
            regex_fallback: filter.regex && !filter.search.is_empty() && !compiled.text().is_regex(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Cache for the filtered view to avoid re-filtering when nothing changed
#[derive(Default)]
pub struct FilterCache {
    /// Filter the cached view was built with
    cached_filter: Option<LogFilter>,

    /// The cached view
    view: Option<Arc<FilteredView>>,
}

impl FilterCache {
    /// Check if the cached view is stale for this filter and store revision
    pub fn needs_refresh(&self, filter: &LogFilter, revision: u64) -> bool {
        match (&self.cached_filter, &self.view) {
            (Some(cached), Some(view)) => cached != filter || view.revision != revision,
            _ => true,
        }
    }

    /// Cached view if it is still valid
    pub fn get(&self, filter: &LogFilter, revision: u64) -> Option<Arc<FilteredView>> {
        if self.needs_refresh(filter, revision) {
            None
        } else {
            self.view.clone()
        }
    }

    /// Update the cache with new filtered results
    pub fn update(&mut self, filter: &LogFilter, view: Arc<FilteredView>) {
        self.cached_filter = Some(filter.clone());
        self.view = Some(view);
    }

    pub fn invalidate(&mut self) {
        self.cached_filter = None;
        self.view = None;
    }
}
