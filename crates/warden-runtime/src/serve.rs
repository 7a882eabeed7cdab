//! Line-oriented trigger loop.
//!
//! Reads one JSON [`Trigger`] per line, dispatches each on its own task and
//! writes one [`TriggerReport`] line per trigger in completion order.
//! Scheduler triggers are merged into the same stream.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use warden_core::{Result, WardenError};

use crate::trigger::{Trigger, TriggerReport};
use crate::warden::Warden;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServeSummary {
    pub received: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl ServeSummary {
    fn count(&mut self, report: &TriggerReport) {
        if report.ok {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
    }
}

/// Serve until input is exhausted and the schedule channel (if any) is
/// closed, or until `shutdown` fires. In-flight triggers always finish and
/// are reported before returning.
pub async fn serve<R, W>(
    warden: Arc<Warden>,
    input: R,
    mut output: W,
    mut scheduled: Option<mpsc::Receiver<Trigger>>,
    shutdown: CancellationToken,
) -> Result<ServeSummary>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    let mut input_open = true;
    let mut in_flight: JoinSet<TriggerReport> = JoinSet::new();
    let mut summary = ServeSummary::default();

    info!("serving triggers");
    loop {
        if !input_open && scheduled.is_none() && in_flight.is_empty() {
            break;
        }
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!(in_flight = in_flight.len(), "shutdown requested, draining");
                break;
            }
            line = lines.next_line(), if input_open => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    summary.received += 1;
                    match serde_json::from_str::<Trigger>(&line) {
                        Ok(trigger) => spawn_dispatch(&mut in_flight, &warden, trigger),
                        Err(e) => {
                            let report = TriggerReport::from_result(
                                trigger_id_of(&line),
                                Err(WardenError::from(e)),
                            );
                            summary.count(&report);
                            write_report(&mut output, &report).await?;
                        }
                    }
                }
                Ok(None) => {
                    debug!("trigger input closed");
                    input_open = false;
                }
                Err(e) => {
                    warn!(error = %e, "error reading trigger input");
                    input_open = false;
                }
            },
            fired = recv_scheduled(&mut scheduled), if scheduled.is_some() => match fired {
                Some(trigger) => {
                    summary.received += 1;
                    spawn_dispatch(&mut in_flight, &warden, trigger);
                }
                None => scheduled = None,
            },
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                let report = report_from_join(joined);
                summary.count(&report);
                write_report(&mut output, &report).await?;
            }
        }
    }

    while let Some(joined) = in_flight.join_next().await {
        let report = report_from_join(joined);
        summary.count(&report);
        write_report(&mut output, &report).await?;
    }
    info!(
        received = summary.received,
        succeeded = summary.succeeded,
        failed = summary.failed,
        "serve finished"
    );
    Ok(summary)
}

fn spawn_dispatch(in_flight: &mut JoinSet<TriggerReport>, warden: &Arc<Warden>, trigger: Trigger) {
    let warden = Arc::clone(warden);
    in_flight.spawn(async move {
        let trigger_id = trigger.trigger_id.clone();
        let result = warden.dispatch(trigger).await;
        if let Err(e) = &result {
            warn!(trigger_id = %trigger_id, code = e.code(), error = %e, "trigger failed");
        }
        TriggerReport::from_result(trigger_id, result)
    });
}

async fn recv_scheduled(rx: &mut Option<mpsc::Receiver<Trigger>>) -> Option<Trigger> {
    match rx {
        Some(rx) => rx.recv().await,
        None => None,
    }
}

fn report_from_join(joined: std::result::Result<TriggerReport, tokio::task::JoinError>) -> TriggerReport {
    joined.unwrap_or_else(|e| {
        error!(error = %e, "trigger task panicked");
        TriggerReport::from_result(
            "unknown".into(),
            Err(WardenError::Other(anyhow::anyhow!("trigger task failed: {e}"))),
        )
    })
}

/// Best-effort id for a line that did not parse as a trigger.
fn trigger_id_of(line: &str) -> String {
    serde_json::from_str::<Value>(line)
        .ok()
        .and_then(|v| v.get("trigger_id").and_then(|id| id.as_str()).map(String::from))
        .unwrap_or_else(|| "unknown".into())
}

async fn write_report<W: AsyncWrite + Unpin>(output: &mut W, report: &TriggerReport) -> Result<()> {
    let mut line = serde_json::to_vec(report)?;
    line.push(b'\n');
    output.write_all(&line).await?;
    output.flush().await?;
    Ok(())
}
