use anyhow::Result;
use serde::Serialize;
use std::io::Write;

use stackscope_logs::{ConnectionStatus, FilteredView, LogEntry};

use crate::config::ReportSettings;

/// JSON form of one summary
#[derive(Serialize)]
struct JsonReport<'a> {
    status: ConnectionStatus,
    stale: bool,
    pending: usize,
    matched: usize,
    #[serde(flatten)]
    view: &'a FilteredView,
    recent: Vec<&'a LogEntry>,
}

/// Prints periodic summaries of the filtered view to stdout
pub struct Reporter {
    json: bool,
    tail: usize,
}

impl Reporter {
    pub fn new(settings: &ReportSettings) -> Self {
        Self {
            json: settings.json,
            tail: settings.tail,
        }
    }

    pub fn print(&self, view: &FilteredView, pending: usize, status: ConnectionStatus) -> Result<()> {
        let report = self.render(view, pending, status)?;
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{}", report)?;
        stdout.flush()?;
        Ok(())
    }

    pub fn render(&self, view: &FilteredView, pending: usize, status: ConnectionStatus) -> Result<String> {
        if self.json {
            let report = JsonReport {
                status,
                stale: status.is_stale(),
                pending,
                matched: view.len(),
                view,
                recent: self.recent(view).collect(),
            };
            Ok(serde_json::to_string(&report)?)
        } else {
            Ok(self.render_text(view, pending, status))
        }
    }

    fn recent<'a>(&self, view: &'a FilteredView) -> impl Iterator<Item = &'a LogEntry> {
        let skip = view.len().saturating_sub(self.tail);
        view.entries[skip..].iter().map(|entry| &**entry)
    }

    fn render_text(&self, view: &FilteredView, pending: usize, status: ConnectionStatus) -> String {
        let insights = &view.insights;
        let status = if status.is_stale() {
            format!("{} (stale)", status)
        } else {
            status.to_string()
        };

        let mut lines = vec![format!(
            "[{}] {}/{} matching | pending {} | errors {} | warnings {}",
            status,
            view.len(),
            view.total,
            pending,
            insights.error_count,
            insights.warning_count
        )];

        if view.regex_fallback {
            lines.push("  invalid regex, searching as plain text".to_string());
        }

        for pattern in &insights.patterns {
            lines.push(format!("  {:>4}x {}", pattern.count, pattern.message));
        }

        for entry in self.recent(view) {
            lines.push(format!(
                "{:>5} {} {:>10} {:>3} │ {}",
                entry.id,
                entry.timestamp.format("%H:%M:%S"),
                entry.service,
                entry.level.as_str(),
                entry.line
            ));
        }

        lines.join("\n")
    }
}
