use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use stackscope_logs::{LogEvent, LogHub, LogParser};

use crate::config::FollowSettings;

/// Decode one stdin line: a JSON wire event if it parses as one, otherwise a
/// plain text line attributed to `default_service`.
pub fn decode_line(line: &str, default_service: &str) -> LogEvent {
    match serde_json::from_str::<LogEvent>(line) {
        Ok(event) => event,
        Err(_) => LogParser::parse(line, default_service, None),
    }
}

/// Owns the tasks that feed the hub: the stdin reader and any followed commands
pub struct InputManager {
    hub: LogHub,

    /// Cancellation token for stopping inputs
    cancel: CancellationToken,

    /// Running input tasks
    tasks: JoinSet<()>,
}

impl InputManager {
    pub fn new(hub: LogHub) -> Self {
        Self {
            hub,
            cancel: CancellationToken::new(),
            tasks: JoinSet::new(),
        }
    }

    /// Publish stdin lines until EOF
    pub fn spawn_stdin(&mut self, default_service: String) {
        let hub = self.hub.clone();
        let cancel = self.cancel.clone();

        self.tasks.spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,

                    result = lines.next_line() => match result {
                        Ok(Some(line)) => {
                            if line.trim().is_empty() {
                                continue;
                            }
                            hub.publish(decode_line(&line, &default_service));
                        }
                        Ok(None) => {
                            debug!("stdin closed");
                            break;
                        }
                        Err(e) => {
                            warn!(error = %e, "failed to read stdin");
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Run a command and publish its stdout and stderr lines as `follow.service`
    pub fn spawn_follow(&mut self, follow: &FollowSettings) -> Result<()> {
        let (program, args) = follow
            .command
            .split_first()
            .with_context(|| format!("Empty follow command for service {}", follow.service))?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| {
                format!(
                    "Failed to start `{}` for service {}",
                    follow.command.join(" "),
                    follow.service
                )
            })?;

        let stdout = child.stdout.take().context("Child stdout was not captured")?;
        let stderr = child.stderr.take().context("Child stderr was not captured")?;

        let hub = self.hub.clone();
        let cancel = self.cancel.clone();
        let service = follow.service.clone();
        info!(service = %service, command = %follow.command.join(" "), "following command output");

        self.tasks.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    if let Err(e) = child.kill().await {
                        debug!(service = %service, error = %e, "failed to kill followed command");
                    }
                }

                _ = async {
                    tokio::join!(
                        pump_lines(stdout, &hub, &service, "stdout"),
                        pump_lines(stderr, &hub, &service, "stderr"),
                    )
                } => {
                    match child.wait().await {
                        Ok(status) => info!(service = %service, %status, "followed command exited"),
                        Err(e) => warn!(service = %service, error = %e, "failed to wait for followed command"),
                    }
                }
            }
        });

        Ok(())
    }

    /// Start every configured follower
    pub fn spawn_follows(&mut self, follows: &[FollowSettings]) -> Result<()> {
        for follow in follows {
            self.spawn_follow(follow)?;
        }
        Ok(())
    }

    /// Wait for the next input to end. Returns `false` once none are left.
    pub async fn next_finished(&mut self) -> bool {
        match self.tasks.join_next().await {
            Some(Ok(())) => true,
            Some(Err(e)) => {
                if !e.is_cancelled() {
                    warn!(error = %e, "input task failed");
                }
                true
            }
            None => false,
        }
    }

    /// Get the number of running inputs
    pub fn active_count(&self) -> usize {
        self.tasks.len()
    }

    /// Stop all inputs
    pub fn stop(&mut self) {
        self.cancel.cancel();
        self.tasks.abort_all();
        // Fresh token for inputs spawned afterwards
        self.cancel = CancellationToken::new();
    }
}

impl Drop for InputManager {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn pump_lines<R>(reader: R, hub: &LogHub, service: &str, source: &str)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                hub.publish(LogParser::parse(&line, service, Some(source)));
            }
            Ok(None) => break,
            Err(e) => {
                debug!(service = %service, source, error = %e, "stopped reading output");
                break;
            }
        }
    }
}
