use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use sparkq_db::models::queue::{Queue, QueueStatus};
use sparkq_db::models::session::{Session, SessionStatus};
use sparkq_db::models::task::{NewTask, Task, TaskClass, TaskStatus};
use sparkq_db::{Db, DomainError};

use crate::services::config::SparkqConfig;

/// Error recorded on tasks the janitor gives up on.
pub const AUTO_FAIL_ERROR: &str = "Auto-failed: exceeded 2x timeout";

/// The task state machine. Every transition is a conditional update inside
/// an exclusive transaction; a zero-row match is surfaced, never swallowed.
#[derive(Clone)]
pub struct Engine {
    db: Db,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnqueueRequest {
    pub queue_id: String,
    pub tool_name: String,
    pub task_class: Option<TaskClass>,
    pub payload: Value,
    pub timeout: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CompleteRequest {
    pub result: Value,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FailRequest {
    pub error: String,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StaleOutcome {
    pub warned: u64,
    pub auto_failed: u64,
}

impl Engine {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    /// Enqueue a task. The parent queue and its session must both be
    /// active; the timeout comes from the caller or the class default.
    pub async fn enqueue(
        &self,
        req: EnqueueRequest,
        config: &SparkqConfig,
    ) -> Result<Task, DomainError> {
        let task_class = match req.task_class {
            Some(class) => class,
            None => config.class_for_tool(&req.tool_name).ok_or_else(|| {
                DomainError::validation(format!(
                    "tool {:?} has no configured task_class, pass one explicitly",
                    req.tool_name
                ))
            })?,
        };
        let timeout_seconds = match req.timeout {
            Some(t) if t > 0 => t,
            Some(t) => {
                return Err(DomainError::validation(format!(
                    "timeout must be > 0, got {t}"
                )))
            }
            None => config.timeout_for_class(task_class),
        };

        let new_task = NewTask {
            queue_id: req.queue_id,
            tool_name: req.tool_name,
            task_class,
            payload: req.payload,
            timeout_seconds,
        };
        self.db
            .with_exclusive(move |conn| {
                Box::pin(async move {
                    let queue = Queue::require(&mut *conn, &new_task.queue_id).await?;
                    if queue.status != QueueStatus::Active {
                        return Err(DomainError::conflict(format!(
                            "queue {} is {}, enqueue requires an active queue",
                            queue.id, queue.status
                        )));
                    }
                    let session = Session::require(&mut *conn, &queue.session_id).await?;
                    if session.status != SessionStatus::Active {
                        return Err(DomainError::conflict(format!(
                            "session {} has ended, enqueue requires an active session",
                            session.id
                        )));
                    }
                    Task::insert(conn, &new_task).await
                })
            })
            .await
    }

    /// Claim the oldest queued task in a queue, if any.
    pub async fn claim_next(&self, queue_id: &str) -> Result<Option<Task>, DomainError> {
        let queue_id = queue_id.to_string();
        self.db
            .with_exclusive(move |conn| {
                Box::pin(async move {
                    Queue::require(&mut *conn, &queue_id).await?;
                    Task::claim_next(conn, &queue_id).await
                })
            })
            .await
    }

    /// Claim one specific task; `NotFound` doubles as the lost-race signal.
    pub async fn claim(&self, task_id: &str) -> Result<Task, DomainError> {
        let task_id = task_id.to_string();
        self.db
            .with_exclusive(move |conn| Box::pin(async move { Task::claim(conn, &task_id).await }))
            .await
    }

    /// Finish a running task successfully. The result must be a JSON
    /// object carrying a non-empty `summary` string.
    pub async fn complete(&self, task_id: &str, req: CompleteRequest) -> Result<Task, DomainError> {
        validate_result(&req.result)?;
        let task_id = task_id.to_string();
        self.db
            .with_exclusive(move |conn| {
                Box::pin(async move {
                    Task::complete(
                        conn,
                        &task_id,
                        &req.result,
                        req.stdout.as_deref(),
                        req.stderr.as_deref(),
                    )
                    .await
                })
            })
            .await
    }

    /// Finish a running task as failed with a non-empty error.
    pub async fn fail(&self, task_id: &str, req: FailRequest) -> Result<Task, DomainError> {
        let task_id = task_id.to_string();
        self.db
            .with_exclusive(move |conn| {
                Box::pin(async move {
                    Task::fail(
                        conn,
                        &task_id,
                        &req.error,
                        req.stdout.as_deref(),
                        req.stderr.as_deref(),
                    )
                    .await
                })
            })
            .await
    }

    /// Copy a failed task into a fresh queued one. The source row is never
    /// mutated; the target queue (and its session) must still be active.
    pub async fn requeue(&self, task_id: &str) -> Result<Task, DomainError> {
        let task_id = task_id.to_string();
        self.db
            .with_exclusive(move |conn| {
                Box::pin(async move {
                    let source = Task::require(&mut *conn, &task_id).await?;
                    if source.status != TaskStatus::Failed {
                        return Err(DomainError::conflict(format!(
                            "task {} is {}, only failed tasks can be requeued",
                            source.id, source.status
                        )));
                    }
                    let queue = Queue::require(&mut *conn, &source.queue_id).await?;
                    if queue.status != QueueStatus::Active {
                        return Err(DomainError::conflict(format!(
                            "queue {} is {}, requeue requires an active queue",
                            queue.id, queue.status
                        )));
                    }
                    let session = Session::require(&mut *conn, &queue.session_id).await?;
                    if session.status != SessionStatus::Active {
                        return Err(DomainError::conflict(format!(
                            "session {} has ended, requeue requires an active session",
                            session.id
                        )));
                    }
                    Task::insert(
                        conn,
                        &NewTask {
                            queue_id: source.queue_id.clone(),
                            tool_name: source.tool_name.clone(),
                            task_class: source.task_class,
                            payload: source.payload.clone(),
                            timeout_seconds: source.timeout,
                        },
                    )
                    .await
                })
            })
            .await
    }

    /// One stale-janitor pass: warn running tasks past 1x their timeout,
    /// auto-fail those past 2x. Idempotent on an unchanged database.
    pub async fn stale_tick(&self) -> Result<StaleOutcome, DomainError> {
        self.db
            .with_exclusive(|conn| {
                Box::pin(async move {
                    let now = Utc::now();
                    let running = Task::running(&mut *conn).await?;
                    let mut outcome = StaleOutcome::default();
                    for task in running {
                        let Some(claimed_at) = task.claimed_at else {
                            continue;
                        };
                        let age = (now - claimed_at).num_seconds();
                        if age > 2 * task.timeout {
                            Task::fail(conn, &task.id, AUTO_FAIL_ERROR, None, None).await?;
                            outcome.auto_failed += 1;
                        } else if age > task.timeout && task.stale_warned_at.is_none() {
                            if Task::mark_stale_warned(conn, &task.id).await? {
                                outcome.warned += 1;
                            }
                        }
                    }
                    Ok(outcome)
                })
            })
            .await
    }

    /// One purge-janitor pass: drop terminal tasks older than the cutoff.
    pub async fn purge_tick(&self, older_than_days: i64) -> Result<u64, DomainError> {
        let cutoff = Utc::now() - chrono::Duration::days(older_than_days);
        self.db
            .with_exclusive(move |conn| {
                Box::pin(async move { Task::purge_terminal_before(conn, cutoff).await })
            })
            .await
    }
}

fn validate_result(result: &Value) -> Result<(), DomainError> {
    let summary = result
        .as_object()
        .and_then(|obj| obj.get("summary"))
        .and_then(Value::as_str);
    match summary {
        Some(s) if !s.trim().is_empty() => Ok(()),
        _ => Err(DomainError::validation(
            "result must be a JSON object with a non-empty summary string",
        )),
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{backdate_claim, engine, enqueue_req, scaffold};
    use super::*;
    use serde_json::json;

    fn default_config() -> SparkqConfig {
        SparkqConfig::default()
    }

    #[tokio::test]
    async fn enqueue_uses_class_default_timeout() {
        let (engine, _dir) = engine().await;
        let (_, queue) = scaffold(&engine).await;

        let req = EnqueueRequest {
            timeout: None,
            ..enqueue_req(&queue.id, json!({}))
        };
        let task = engine.enqueue(req, &default_config()).await.unwrap();
        assert_eq!(task.timeout, 120);
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.attempts, 0);
    }

    #[tokio::test]
    async fn enqueue_rejects_non_positive_timeout() {
        let (engine, _dir) = engine().await;
        let (_, queue) = scaffold(&engine).await;

        let req = EnqueueRequest {
            timeout: Some(0),
            ..enqueue_req(&queue.id, json!({}))
        };
        let err = engine.enqueue(req, &default_config()).await.unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[tokio::test]
    async fn enqueue_resolves_class_from_tool_mapping() {
        let (engine, _dir) = engine().await;
        let (_, queue) = scaffold(&engine).await;

        let yaml = "tools:\n  run_script:\n    task_class: LLM_LITE\n";
        let config: SparkqConfig = serde_yaml_ng::from_str(yaml).unwrap();

        let req = EnqueueRequest {
            task_class: None,
            timeout: None,
            ..enqueue_req(&queue.id, json!({}))
        };
        let task = engine.enqueue(req, &config).await.unwrap();
        assert_eq!(task.task_class, TaskClass::LlmLite);
        assert_eq!(task.timeout, 480);
    }

    #[tokio::test]
    async fn enqueue_without_class_or_mapping_is_validation() {
        let (engine, _dir) = engine().await;
        let (_, queue) = scaffold(&engine).await;

        let req = EnqueueRequest {
            task_class: None,
            ..enqueue_req(&queue.id, json!({}))
        };
        let err = engine.enqueue(req, &default_config()).await.unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[tokio::test]
    async fn enqueue_rejects_ended_queue_and_ended_session() {
        let (engine, _dir) = engine().await;
        let (session, queue) = scaffold(&engine).await;

        let qid = queue.id.clone();
        engine
            .db()
            .with_exclusive(move |conn| {
                Box::pin(async move {
                    sparkq_db::models::queue::Queue::end(conn, &qid).await
                })
            })
            .await
            .unwrap();
        let err = engine
            .enqueue(enqueue_req(&queue.id, json!({})), &default_config())
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));

        // Second queue stays active, but its session ends.
        let sid = session.id.clone();
        let queue2 = engine
            .db()
            .with_exclusive(move |conn| {
                Box::pin(async move {
                    sparkq_db::models::queue::Queue::create(
                        conn,
                        &sparkq_db::models::queue::CreateQueue {
                            session_id: sid,
                            name: "q2".to_string(),
                            instructions: None,
                            model_profile: None,
                        },
                    )
                    .await
                })
            })
            .await
            .unwrap();
        let sid = session.id.clone();
        engine
            .db()
            .with_exclusive(move |conn| {
                Box::pin(async move {
                    sparkq_db::models::session::Session::end(conn, &sid).await
                })
            })
            .await
            .unwrap();

        let err = engine
            .enqueue(enqueue_req(&queue2.id, json!({})), &default_config())
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
    }

    #[tokio::test]
    async fn complete_requires_summary() {
        let (engine, _dir) = engine().await;
        let (_, queue) = scaffold(&engine).await;

        engine
            .enqueue(enqueue_req(&queue.id, json!({})), &default_config())
            .await
            .unwrap();
        let task = engine.claim_next(&queue.id).await.unwrap().unwrap();

        for bad in [json!({}), json!({"summary": ""}), json!("done"), json!(42)] {
            let err = engine
                .complete(
                    &task.id,
                    CompleteRequest {
                        result: bad.clone(),
                        stdout: None,
                        stderr: None,
                    },
                )
                .await
                .unwrap_err();
            assert!(matches!(err, DomainError::Validation(_)), "result {bad}");
        }

        let done = engine
            .complete(
                &task.id,
                CompleteRequest {
                    result: json!({"summary": "all good"}),
                    stdout: None,
                    stderr: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(done.status, TaskStatus::Succeeded);
    }

    #[tokio::test]
    async fn requeue_copies_fields_and_never_touches_source() {
        let (engine, _dir) = engine().await;
        let (_, queue) = scaffold(&engine).await;

        let payload = json!({"k": 1, "nested": {"deep": true}});
        engine
            .enqueue(enqueue_req(&queue.id, payload.clone()), &default_config())
            .await
            .unwrap();
        let claimed = engine.claim_next(&queue.id).await.unwrap().unwrap();
        let failed = engine
            .fail(
                &claimed.id,
                FailRequest {
                    error: "boom".to_string(),
                    stdout: None,
                    stderr: None,
                },
            )
            .await
            .unwrap();

        let requeued = engine.requeue(&failed.id).await.unwrap();
        assert_ne!(requeued.id, failed.id);
        assert_eq!(requeued.status, TaskStatus::Queued);
        assert_eq!(requeued.payload, payload);
        assert_eq!(requeued.timeout, failed.timeout);
        assert_eq!(requeued.tool_name, failed.tool_name);
        assert_eq!(requeued.task_class, failed.task_class);
        assert_eq!(requeued.attempts, 0);

        // Source is byte-for-byte what it was.
        let source = sparkq_db::models::task::Task::require(&engine.db().pool, &failed.id)
            .await
            .unwrap();
        assert_eq!(source.status, TaskStatus::Failed);
        assert_eq!(source.error.as_deref(), Some("boom"));
        assert_eq!(source.updated_at, failed.updated_at);

        // Requeueing again mints yet another task.
        let again = engine.requeue(&failed.id).await.unwrap();
        assert_ne!(again.id, requeued.id);
    }

    #[tokio::test]
    async fn requeue_rejects_non_failed_source() {
        let (engine, _dir) = engine().await;
        let (_, queue) = scaffold(&engine).await;

        let task = engine
            .enqueue(enqueue_req(&queue.id, json!({})), &default_config())
            .await
            .unwrap();
        let err = engine.requeue(&task.id).await.unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
    }

    #[tokio::test]
    async fn requeue_rejects_inactive_queue() {
        let (engine, _dir) = engine().await;
        let (_, queue) = scaffold(&engine).await;

        engine
            .enqueue(enqueue_req(&queue.id, json!({})), &default_config())
            .await
            .unwrap();
        let claimed = engine.claim_next(&queue.id).await.unwrap().unwrap();
        engine
            .fail(
                &claimed.id,
                FailRequest {
                    error: "boom".to_string(),
                    stdout: None,
                    stderr: None,
                },
            )
            .await
            .unwrap();

        let qid = queue.id.clone();
        engine
            .db()
            .with_exclusive(move |conn| {
                Box::pin(async move {
                    sparkq_db::models::queue::Queue::end(conn, &qid).await
                })
            })
            .await
            .unwrap();

        let err = engine.requeue(&claimed.id).await.unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
    }

    #[tokio::test]
    async fn stale_tick_warns_then_auto_fails() {
        let (engine, _dir) = engine().await;
        let (_, queue) = scaffold(&engine).await;

        let req = EnqueueRequest {
            timeout: Some(10),
            ..enqueue_req(&queue.id, json!({}))
        };
        engine.enqueue(req, &default_config()).await.unwrap();
        let task = engine.claim_next(&queue.id).await.unwrap().unwrap();

        // Not yet past 1x timeout: nothing happens.
        let outcome = engine.stale_tick().await.unwrap();
        assert_eq!(outcome, StaleOutcome::default());

        // Past 1x: warned, still running.
        backdate_claim(&engine, &task.id, 15).await;
        let outcome = engine.stale_tick().await.unwrap();
        assert_eq!(outcome.warned, 1);
        assert_eq!(outcome.auto_failed, 0);
        let warned = sparkq_db::models::task::Task::require(&engine.db().pool, &task.id)
            .await
            .unwrap();
        assert_eq!(warned.status, TaskStatus::Running);
        assert!(warned.stale_warned_at.is_some());

        // Re-running on the same state writes nothing (idempotence).
        let outcome = engine.stale_tick().await.unwrap();
        assert_eq!(outcome, StaleOutcome::default());

        // Past 2x: auto-failed with the recognizable marker.
        backdate_claim(&engine, &task.id, 25).await;
        let outcome = engine.stale_tick().await.unwrap();
        assert_eq!(outcome.auto_failed, 1);
        let failed = sparkq_db::models::task::Task::require(&engine.db().pool, &task.id)
            .await
            .unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some(AUTO_FAIL_ERROR));
        assert!(failed.finished_at.is_some());
    }

    #[tokio::test]
    async fn purge_tick_only_touches_old_terminal_tasks() {
        let (engine, _dir) = engine().await;
        let (_, queue) = scaffold(&engine).await;

        engine
            .enqueue(enqueue_req(&queue.id, json!({})), &default_config())
            .await
            .unwrap();
        let claimed = engine.claim_next(&queue.id).await.unwrap().unwrap();
        engine
            .fail(
                &claimed.id,
                FailRequest {
                    error: "boom".to_string(),
                    stdout: None,
                    stderr: None,
                },
            )
            .await
            .unwrap();

        // Terminal but fresh: survives the default window.
        assert_eq!(engine.purge_tick(3).await.unwrap(), 0);

        // Backdate creation past the cutoff: purged.
        let old = Utc::now() - chrono::Duration::days(10);
        sqlx::query("UPDATE tasks SET created_at = ? WHERE id = ?")
            .bind(old)
            .bind(&claimed.id)
            .execute(&engine.db().pool)
            .await
            .unwrap();
        assert_eq!(engine.purge_tick(3).await.unwrap(), 1);
        assert_eq!(engine.purge_tick(3).await.unwrap(), 0);
    }
}
