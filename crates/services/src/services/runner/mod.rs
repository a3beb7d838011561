pub mod client;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use serde_json::Value;
use sparkq_db::models::queue::Queue;
use sparkq_db::models::task::Task;
use tokio::io::AsyncBufReadExt;
use tokio_util::sync::CancellationToken;

use crate::services::lock::{lock_name, PidLock};
use client::{ApiClient, ApiClientError};

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub queue_id: String,
    pub poll_interval: Duration,
    pub lock_dir: PathBuf,
}

/// Outcome of a task as captured by whatever executed it.
#[derive(Debug, Clone)]
pub enum TerminalReport {
    Complete {
        result: Value,
        stdout: Option<String>,
        stderr: Option<String>,
    },
    Fail {
        error: String,
        stdout: Option<String>,
        stderr: Option<String>,
    },
}

/// Where terminal reports come from. The service never executes task
/// payloads itself; this seam is how the outcome of the downstream tool
/// reaches the runner.
#[async_trait]
pub trait ReportSource: Send {
    async fn wait_for_report(&mut self, task: &Task) -> anyhow::Result<TerminalReport>;
}

/// Operator affordance: after the prompt block is printed, read one JSON
/// line from stdin shaped `{"result": {...}}` or `{"error": "..."}`,
/// optionally with `stdout`/`stderr` strings.
pub struct StdinReportSource;

#[async_trait]
impl ReportSource for StdinReportSource {
    async fn wait_for_report(&mut self, task: &Task) -> anyhow::Result<TerminalReport> {
        eprintln!("paste the terminal report for {} as one JSON line:", task.id);
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        loop {
            let Some(line) = lines.next_line().await? else {
                anyhow::bail!("stdin closed before a terminal report for {}", task.id);
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match parse_report_line(line) {
                Ok(report) => return Ok(report),
                Err(e) => eprintln!("unusable report ({e}), try again:"),
            }
        }
    }
}

fn parse_report_line(line: &str) -> anyhow::Result<TerminalReport> {
    let value: Value = serde_json::from_str(line)?;
    let stdout = value
        .get("stdout")
        .and_then(Value::as_str)
        .map(str::to_string);
    let stderr = value
        .get("stderr")
        .and_then(Value::as_str)
        .map(str::to_string);
    if let Some(result) = value.get("result") {
        return Ok(TerminalReport::Complete {
            result: result.clone(),
            stdout,
            stderr,
        });
    }
    if let Some(error) = value.get("error").and_then(Value::as_str) {
        return Ok(TerminalReport::Fail {
            error: error.to_string(),
            stdout,
            stderr,
        });
    }
    anyhow::bail!("expected a top-level \"result\" or \"error\" key")
}

/// External worker bound to one queue: poll, claim, emit the prompt, report
/// the outcome. Time-bounded ownership is the server's job; the runner
/// carries no lease timer.
pub struct QueueRunner {
    client: ApiClient,
    settings: RunnerSettings,
}

impl QueueRunner {
    pub fn new(client: ApiClient, settings: RunnerSettings) -> Self {
        Self { client, settings }
    }

    pub async fn run(
        &self,
        source: &mut dyn ReportSource,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        let queue = self.client.get_queue(&self.settings.queue_id).await?;
        let _lock = PidLock::acquire(&self.settings.lock_dir, &lock_name(&queue.name))?;
        tracing::info!(queue = %queue.name, "runner started");

        loop {
            if cancel.is_cancelled() {
                break;
            }
            let worked = match self.poll_once(&queue, source).await {
                Ok(worked) => worked,
                Err(e) => {
                    tracing::warn!("runner poll failed: {e}");
                    false
                }
            };
            if worked {
                continue;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }
        tracing::info!(queue = %queue.name, "runner stopped");
        Ok(())
    }

    /// One pass: fetch the head of the queue, claim it, hand the prompt to
    /// the operator, report the outcome. Returns false when there was
    /// nothing to do (empty queue or lost claim race).
    async fn poll_once(
        &self,
        queue: &Queue,
        source: &mut dyn ReportSource,
    ) -> anyhow::Result<bool> {
        let Some(head) = self.client.oldest_queued(&queue.id).await? else {
            return Ok(false);
        };

        let task = match self.client.claim(&head.task.id).await {
            Ok(task) => task,
            Err(e) if e.is_not_found() => {
                tracing::debug!("lost the claim race for {}", head.task.id);
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        println!("{}", render_prompt(&task, queue));

        let report = source.wait_for_report(&task).await?;
        self.report_with_backoff(&task.id, report).await;
        Ok(true)
    }

    /// Deliver the terminal report with bounded exponential backoff. When
    /// the budget runs out the task is left `running` for the stale janitor
    /// to auto-fail.
    async fn report_with_backoff(&self, task_id: &str, report: TerminalReport) {
        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(500))
            .with_max_delay(Duration::from_secs(15))
            .with_max_times(5);

        let attempt = || async {
            match &report {
                TerminalReport::Complete {
                    result,
                    stdout,
                    stderr,
                } => {
                    self.client
                        .complete(task_id, result, stdout.as_deref(), stderr.as_deref())
                        .await
                }
                TerminalReport::Fail {
                    error,
                    stdout,
                    stderr,
                } => {
                    self.client
                        .fail(task_id, error, stdout.as_deref(), stderr.as_deref())
                        .await
                }
            }
        };

        let outcome = attempt
            .retry(backoff)
            .when(ApiClientError::is_transient)
            .notify(|err: &ApiClientError, dur: Duration| {
                tracing::warn!("report for {task_id} failed ({err}), retrying in {dur:?}");
            })
            .await;

        match outcome {
            Ok(task) => tracing::info!("task {} reported as {}", task.id, task.status),
            Err(e) => tracing::warn!(
                "giving up on reporting {task_id}: {e}; the stale janitor will auto-fail it"
            ),
        }
    }
}

/// Textual block an operator copies into a downstream tool. Not consumed by
/// the service; no compatibility promises.
pub fn render_prompt(task: &Task, queue: &Queue) -> String {
    let payload =
        serde_json::to_string_pretty(&task.payload).unwrap_or_else(|_| task.payload.to_string());
    let mut out = String::new();
    out.push_str("==== sparkq task ====\n");
    out.push_str(&format!("task:  {}\n", task.id));
    out.push_str(&format!("tool:  {}\n", task.tool_name));
    out.push_str(&format!("class: {} (timeout {}s)\n", task.task_class, task.timeout));
    out.push_str(&format!("queue: {}\n", queue.name));
    if let Some(instructions) = &queue.instructions {
        out.push_str("instructions:\n");
        for line in instructions.lines() {
            out.push_str(&format!("  {line}\n"));
        }
    }
    out.push_str("payload:\n");
    out.push_str(&payload);
    out.push_str("\n=====================");
    out
}
