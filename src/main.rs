mod config;
mod input;
mod report;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use clap::Parser;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use stackscope_logs::{ConnectionStatus, LogHub, LogStream};

use config::{FollowSettings, Settings};
use input::InputManager;
use report::Reporter;

/// Stackscope - stream, filter and summarize logs from a stack of services
#[derive(Parser, Debug)]
#[command(name = "stackscope")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file (defaults to ./stackscope.toml when present)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Only show these services (repeatable)
    #[arg(long = "service", value_name = "NAME")]
    services: Vec<String>,

    /// Severity to show: all, info, warn, error, debug
    #[arg(long)]
    level: Option<String>,

    /// Time window: all, 5m, 1h, 24h
    #[arg(long)]
    since: Option<String>,

    /// Custom range start (RFC 3339)
    #[arg(long)]
    from: Option<String>,

    /// Custom range end (RFC 3339)
    #[arg(long)]
    to: Option<String>,

    /// Case-insensitive text search
    #[arg(long)]
    search: Option<String>,

    /// Treat the search text as a regular expression
    #[arg(long)]
    regex: bool,

    /// Maximum number of retained entries
    #[arg(long)]
    capacity: Option<usize>,

    /// Milliseconds between summaries
    #[arg(long, value_name = "MS")]
    report_interval_ms: Option<u64>,

    /// Print summaries as JSON lines
    #[arg(long)]
    json: bool,

    /// Stream a command's output as a service (SERVICE=COMMAND, repeatable)
    #[arg(long, value_name = "SERVICE=COMMAND", value_parser = FollowSettings::parse_arg)]
    follow: Vec<FollowSettings>,

    /// Service name for plain-text stdin lines
    #[arg(long, value_name = "NAME")]
    stdin_service: Option<String>,

    /// Do not read events from stdin
    #[arg(long)]
    no_stdin: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr, summaries to stdout
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = run(args).await;

    if let Err(e) = &result {
        eprintln!("Error: {:#}", e);
    }

    result
}

/// Command-line flags win over the config file
fn apply_overrides(settings: &mut Settings, args: Args) {
    if !args.services.is_empty() {
        settings.filter.services = args.services;
    }
    if let Some(level) = args.level {
        settings.filter.level = level;
    }
    if let Some(since) = args.since {
        settings.filter.time_range = since;
    }
    if args.from.is_some() || args.to.is_some() {
        settings.filter.from = args.from;
        settings.filter.to = args.to;
    }
    if let Some(search) = args.search {
        settings.filter.search = search;
    }
    if args.regex {
        settings.filter.regex = true;
    }
    if let Some(capacity) = args.capacity {
        settings.stream.capacity = capacity;
    }
    if let Some(interval) = args.report_interval_ms {
        settings.report.interval_ms = interval;
    }
    if args.json {
        settings.report.json = true;
    }
    settings.follows.extend(args.follow);
    if let Some(service) = args.stdin_service {
        settings.input.stdin_service = service;
    }
    if args.no_stdin {
        settings.input.stdin = false;
    }
}

async fn run(args: Args) -> Result<()> {
    let mut settings = Settings::load(args.config.as_deref())?;
    apply_overrides(&mut settings, args);
    settings.validate()?;

    if !settings.input.stdin && settings.follows.is_empty() {
        bail!("Nothing to read: stdin is disabled and no follow commands are configured");
    }

    let filter = settings.log_filter()?;
    let reporter = Reporter::new(&settings.report);

    let hub = LogHub::new();
    let mut stream = LogStream::new(settings.stream_config());
    stream.set_filter(filter);
    stream.attach(Arc::new(hub.clone()));

    let mut inputs = InputManager::new(hub.clone());
    inputs.spawn_follows(&settings.follows)?;
    if settings.input.stdin {
        inputs.spawn_stdin(settings.input.stdin_service.clone());
    }
    hub.set_status(ConnectionStatus::Connected);
    info!(inputs = inputs.active_count(), "streaming started");

    // One signal future for the whole run; a Ctrl-C between polls is not lost
    let ctrl_c = tokio::signal::ctrl_c();
    let shutdown = async move {
        if let Err(e) = ctrl_c.await {
            warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };
    let period = Duration::from_millis(settings.report.interval_ms);
    stream_until_done(&mut stream, &hub, &mut inputs, &reporter, period, shutdown).await?;

    inputs.stop();
    stream.detach();
    reporter.print(&stream.refresh_view(), stream.pending(), stream.status())?;

    Ok(())
}

/// Print a report every `period` until `shutdown` resolves, or until every
/// input has ended and the ingest buffer has drained
async fn stream_until_done<F>(
    stream: &mut LogStream,
    hub: &LogHub,
    inputs: &mut InputManager,
    reporter: &Reporter,
    period: Duration,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);

    let mut report_interval = tokio::time::interval(period);
    report_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    report_interval.tick().await;

    let mut inputs_open = true;

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("interrupted");
                break;
            }

            _ = report_interval.tick() => {
                reporter.print(&stream.refresh_view(), stream.pending(), stream.status())?;
            }

            more = inputs.next_finished(), if inputs_open => {
                if !more {
                    inputs_open = false;
                    hub.set_status(ConnectionStatus::Disconnected);
                    info!(pending = stream.pending(), "all inputs finished");
                }
            }
        }

        // Once the inputs are gone, stop as soon as the backlog has drained
        if !inputs_open && stream.pending() == 0 {
            break;
        }
    }

    Ok(())
}
