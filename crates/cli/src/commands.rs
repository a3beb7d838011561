use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use sparkq_db::models::project::{CreateProject, Project};
use sparkq_db::models::queue::{CreateQueue, Queue};
use sparkq_db::models::session::{CreateSession, Session, SessionStatus};
use sparkq_db::models::task::{Task, TaskClass, TaskStatus};
use sparkq_db::pagination::TaskListParams;
use sparkq_db::{Db, DomainError};
use sparkq_services::services::config::LoadedConfig;
use sparkq_services::services::lifecycle::{CompleteRequest, Engine, EnqueueRequest, FailRequest};
use sparkq_services::services::runner::client::ApiClient;
use sparkq_services::services::runner::{render_prompt, QueueRunner, RunnerSettings, StdinReportSource};
use tokio_util::sync::CancellationToken;

use crate::{Cli, Command, QueueCommand, SessionCommand};

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let loaded = match &cli.config {
        Some(path) => LoadedConfig::load_from(path)?,
        None => LoadedConfig::load()?,
    };

    match cli.command {
        Command::Run => sparkq_server::serve(loaded).await,
        Command::Setup => setup(&loaded).await,
        Command::Status => status(&loaded).await,
        Command::Stop => stop(&loaded).await,
        Command::Reload => reload_remote(&loaded).await,
        command => data_command(&loaded, command).await,
    }
}

async fn setup(loaded: &LoadedConfig) -> anyhow::Result<()> {
    let db = open(loaded).await?;
    let create = CreateProject {
        name: loaded.config.project.name.clone(),
        repo_path: loaded
            .config
            .project
            .repo_path
            .as_ref()
            .map(|p| loaded.resolve_path(p).display().to_string()),
        prd_path: loaded
            .config
            .project
            .prd_path
            .as_ref()
            .map(|p| loaded.resolve_path(p).display().to_string()),
    };
    let project = db
        .with_exclusive(move |conn| Box::pin(async move { Project::create(conn, &create).await }))
        .await?;
    println!("Created project {} ({})", project.id, project.name);
    println!("Database: {}", loaded.database_path().display());
    Ok(())
}

async fn status(loaded: &LoadedConfig) -> anyhow::Result<()> {
    let client = ApiClient::new(&loaded.config.queue_runner.base_url);
    let health = client
        .health()
        .await
        .context("server did not answer the health probe")?;
    println!("Server:  {}", loaded.config.queue_runner.base_url);
    println!("Health:  {}", serde_json::to_string(&health)?);
    Ok(())
}

async fn stop(loaded: &LoadedConfig) -> anyhow::Result<()> {
    let client = ApiClient::new(&loaded.config.queue_runner.base_url);
    client.shutdown().await.context("shutdown request failed")?;
    println!("Server is stopping");
    Ok(())
}

async fn reload_remote(loaded: &LoadedConfig) -> anyhow::Result<()> {
    let client = ApiClient::new(&loaded.config.queue_runner.base_url);
    client.reload().await.context("reload request failed")?;
    println!("Configuration reloaded");
    Ok(())
}

async fn data_command(loaded: &LoadedConfig, command: Command) -> anyhow::Result<()> {
    let db = open(loaded).await?;
    let engine = Engine::new(db.clone());

    match command {
        Command::Session(cmd) => session_command(&db, cmd).await,
        Command::Queue(cmd) => queue_command(&db, cmd).await,
        Command::Enqueue {
            queue,
            session,
            tool,
            class,
            payload,
            timeout,
        } => {
            let queue = resolve_queue(&db, &queue, session.as_deref()).await?;
            let task_class = class.as_deref().map(parse_class).transpose()?;
            let payload = parse_json(&payload, "payload")?;
            let task = engine
                .enqueue(
                    EnqueueRequest {
                        queue_id: queue.id,
                        tool_name: tool,
                        task_class,
                        payload,
                        timeout,
                    },
                    &loaded.config,
                )
                .await?;
            println!("Enqueued {} on {} (timeout {}s)", task.id, queue.name, task.timeout);
            Ok(())
        }
        Command::Peek { queue, session } => {
            let queue = resolve_queue(&db, &queue, session.as_deref()).await?;
            match Task::oldest_queued(&db.pool, &queue.id).await? {
                Some(task) => println!("{}", serde_json::to_string_pretty(&task)?),
                None => println!("Queue {} has no queued tasks", queue.name),
            }
            Ok(())
        }
        Command::Claim { queue, session } => {
            let queue = resolve_queue(&db, &queue, session.as_deref()).await?;
            match engine.claim_next(&queue.id).await? {
                Some(task) => println!("{}", render_prompt(&task, &queue)),
                None => println!("Queue {} has no queued tasks", queue.name),
            }
            Ok(())
        }
        Command::Complete {
            task_id,
            result,
            stdout,
            stderr,
        } => {
            let result = parse_json(&result, "result")?;
            let task = engine
                .complete(
                    &task_id,
                    CompleteRequest {
                        result,
                        stdout,
                        stderr,
                    },
                )
                .await?;
            println!("Completed {}", task.id);
            Ok(())
        }
        Command::Fail {
            task_id,
            error,
            stdout,
            stderr,
        } => {
            let task = engine
                .fail(
                    &task_id,
                    FailRequest {
                        error,
                        stdout,
                        stderr,
                    },
                )
                .await?;
            println!("Failed {}", task.id);
            Ok(())
        }
        Command::Tasks {
            queue,
            session,
            status,
            limit,
            offset,
        } => {
            let queue_id = match queue {
                Some(ident) => Some(resolve_queue(&db, &ident, session.as_deref()).await?.id),
                None => None,
            };
            let session_id = match (&queue_id, session) {
                (None, Some(ident)) => Some(resolve_session(&db, &ident).await?.id),
                _ => None,
            };
            let status = status.as_deref().map(parse_task_status).transpose()?;
            let page = Task::list(
                &db.pool,
                &TaskListParams {
                    limit,
                    offset,
                    queue_id,
                    session_id,
                    status,
                    ..TaskListParams::default()
                },
            )
            .await?;
            for item in &page.items {
                println!(
                    "{}  {:<9}  {:<16}  {}  {}",
                    item.task.id,
                    item.task.status.to_string(),
                    item.task.tool_name,
                    item.queue_name,
                    item.task.created_at.format("%Y-%m-%dT%H:%M:%SZ"),
                );
            }
            println!("{} of {} task(s)", page.items.len(), page.total_count);
            Ok(())
        }
        Command::Task { task_id } => {
            let task = Task::require(&db.pool, &task_id).await?;
            println!("{}", serde_json::to_string_pretty(&task)?);
            Ok(())
        }
        Command::Requeue { task_id } => {
            let task = engine.requeue(&task_id).await?;
            println!("Requeued {task_id} as {}", task.id);
            Ok(())
        }
        Command::Purge { older_than_days } => {
            let days = older_than_days.unwrap_or(loaded.config.purge.older_than_days);
            let purged = engine.purge_tick(days).await?;
            println!("Purged {purged} task(s) older than {days} day(s)");
            Ok(())
        }
        Command::Runner { queue, session } => {
            let queue = resolve_queue(&db, &queue, session.as_deref()).await?;
            run_runner(loaded, queue).await
        }
        // Handled before the database is opened.
        Command::Setup
        | Command::Run
        | Command::Stop
        | Command::Status
        | Command::Reload => unreachable!("routed in run()"),
    }
}

async fn session_command(db: &Db, cmd: SessionCommand) -> anyhow::Result<()> {
    match cmd {
        SessionCommand::Create { name, description } => {
            let create = CreateSession { name, description };
            let session = db
                .with_exclusive(move |conn| {
                    Box::pin(async move { Session::create(conn, &create).await })
                })
                .await?;
            println!("Created session {} ({})", session.id, session.name);
            Ok(())
        }
        SessionCommand::List { status } => {
            let status = status.as_deref().map(parse_session_status).transpose()?;
            let sessions = Session::list(&db.pool, status).await?;
            for session in &sessions {
                println!("{}  {:<6}  {}", session.id, session.status.to_string(), session.name);
            }
            println!("{} session(s)", sessions.len());
            Ok(())
        }
        SessionCommand::End { session } => {
            let session = resolve_session(db, &session).await?;
            let id = session.id.clone();
            let ended = db
                .with_exclusive(move |conn| Box::pin(async move { Session::end(conn, &id).await }))
                .await?;
            println!("Ended session {} ({})", ended.id, ended.name);
            Ok(())
        }
    }
}

async fn queue_command(db: &Db, cmd: QueueCommand) -> anyhow::Result<()> {
    match cmd {
        QueueCommand::Create {
            name,
            session,
            instructions,
            model_profile,
        } => {
            let session = resolve_session(db, &session).await?;
            let create = CreateQueue {
                session_id: session.id,
                name,
                instructions,
                model_profile,
            };
            let queue = db
                .with_exclusive(move |conn| {
                    Box::pin(async move { Queue::create(conn, &create).await })
                })
                .await?;
            println!("Created queue {} ({})", queue.id, queue.name);
            Ok(())
        }
        QueueCommand::List { session, all } => {
            let session_id = match session {
                Some(ident) => Some(resolve_session(db, &ident).await?.id),
                None => None,
            };
            let queues = Queue::list(&db.pool, session_id.as_deref(), all).await?;
            for queue in &queues {
                println!(
                    "{}  {:<8}  {}  (session {})",
                    queue.id,
                    queue.status.to_string(),
                    queue.name,
                    queue.session_id
                );
            }
            println!("{} queue(s)", queues.len());
            Ok(())
        }
        QueueCommand::End { queue, session } => {
            let queue = resolve_queue(db, &queue, session.as_deref()).await?;
            let id = queue.id.clone();
            let ended = db
                .with_exclusive(move |conn| Box::pin(async move { Queue::end(conn, &id).await }))
                .await?;
            println!("Ended queue {} ({})", ended.id, ended.name);
            Ok(())
        }
        QueueCommand::Archive { queue, session } => {
            let queue = resolve_queue(db, &queue, session.as_deref()).await?;
            let id = queue.id.clone();
            let archived = db
                .with_exclusive(move |conn| {
                    Box::pin(async move { Queue::archive(conn, &id).await })
                })
                .await?;
            println!("Archived queue {} ({})", archived.id, archived.name);
            Ok(())
        }
        QueueCommand::Unarchive { queue, session } => {
            // Archived queues are invisible to name lookup, so this wants
            // the id form.
            let queue = if queue.starts_with("que_") {
                Queue::require(&db.pool, &queue).await?
            } else {
                return Err(DomainError::validation(
                    "unarchive needs the queue id (archived names are not unique)",
                )
                .into());
            };
            let _ = session;
            let id = queue.id.clone();
            let restored = db
                .with_exclusive(move |conn| {
                    Box::pin(async move { Queue::unarchive(conn, &id).await })
                })
                .await?;
            println!(
                "Unarchived queue {} ({}) back to {}",
                restored.id, restored.name, restored.status
            );
            Ok(())
        }
    }
}

async fn run_runner(loaded: &LoadedConfig, queue: Queue) -> anyhow::Result<()> {
    let client = ApiClient::new(&loaded.config.queue_runner.base_url);
    let settings = RunnerSettings {
        queue_id: queue.id.clone(),
        poll_interval: Duration::from_secs(loaded.config.queue_runner.poll_interval),
        lock_dir: loaded.runner_lock_dir(),
    };

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut term =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
        tokio::select! {
            _ = ctrl_c => {}
            _ = async {
                match term.as_mut() {
                    Some(term) => { term.recv().await; }
                    None => std::future::pending::<()>().await,
                }
            } => {}
        }
        tracing::info!("signal received, stopping runner");
        signal_cancel.cancel();
    });

    let runner = QueueRunner::new(client, settings);
    let mut source = StdinReportSource;
    runner.run(&mut source, cancel).await
}

async fn open(loaded: &LoadedConfig) -> anyhow::Result<Db> {
    Db::connect(&loaded.database_path())
        .await
        .with_context(|| format!("failed to open {}", loaded.database_path().display()))
}

async fn resolve_session(db: &Db, ident: &str) -> Result<Session, DomainError> {
    if ident.starts_with("sess_") {
        return Session::require(&db.pool, ident).await;
    }
    Session::find_by_name(&db.pool, ident)
        .await?
        .ok_or_else(|| DomainError::not_found(format!("session {ident:?}")))
}

async fn resolve_queue(
    db: &Db,
    ident: &str,
    session: Option<&str>,
) -> Result<Queue, DomainError> {
    if ident.starts_with("que_") {
        return Queue::require(&db.pool, ident).await;
    }
    let Some(session_ident) = session else {
        return Err(DomainError::validation(
            "queue referenced by name, pass --session too (or use the queue id)",
        ));
    };
    let session = resolve_session(db, session_ident).await?;
    Queue::find_by_name(&db.pool, &session.id, ident)
        .await?
        .ok_or_else(|| {
            DomainError::not_found(format!("queue {ident:?} in session {}", session.name))
        })
}

fn parse_class(raw: &str) -> Result<TaskClass, DomainError> {
    TaskClass::from_str(raw).map_err(|_| {
        DomainError::validation(format!(
            "unknown task class {raw:?}, expected FAST_SCRIPT, MEDIUM_SCRIPT, LLM_LITE or LLM_HEAVY"
        ))
    })
}

fn parse_task_status(raw: &str) -> Result<TaskStatus, DomainError> {
    TaskStatus::from_str(raw).map_err(|_| {
        DomainError::validation(format!(
            "unknown task status {raw:?}, expected queued, running, succeeded or failed"
        ))
    })
}

fn parse_session_status(raw: &str) -> Result<SessionStatus, DomainError> {
    SessionStatus::from_str(raw)
        .map_err(|_| DomainError::validation(format!("unknown session status {raw:?}")))
}

fn parse_json(raw: &str, what: &str) -> Result<serde_json::Value, DomainError> {
    serde_json::from_str(raw)
        .map_err(|e| DomainError::validation(format!("{what} is not valid JSON: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_class_accepts_the_four_classes() {
        for (raw, class) in [
            ("FAST_SCRIPT", TaskClass::FastScript),
            ("MEDIUM_SCRIPT", TaskClass::MediumScript),
            ("LLM_LITE", TaskClass::LlmLite),
            ("LLM_HEAVY", TaskClass::LlmHeavy),
        ] {
            assert_eq!(parse_class(raw).unwrap(), class);
        }
        assert!(parse_class("fast").is_err());
    }

    #[test]
    fn parse_json_surfaces_validation() {
        assert!(parse_json("{\"k\":1}", "payload").is_ok());
        assert!(matches!(
            parse_json("{broken", "payload"),
            Err(DomainError::Validation(_))
        ));
    }
}
