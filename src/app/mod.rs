use crate::api::{ApiCommand, ApiServer, SessionsState};
use crate::bot::HttpBotClient;
use crate::calendar::HttpCalendarClient;
use crate::config::Config;
use crate::db::{Database, SessionRepository};
use crate::scheduler::StandupScheduler;
use crate::session::{OrchestratorLimits, SessionOrchestrator, SessionStore};
use crate::webhook::WebhookDispatcher;
use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub async fn run_service() -> Result<()> {
    info!("Starting meetbot service");

    let config = Config::load()?;
    config.validate()?;

    let db = Database::open_default()?;
    let store = SessionStore::default();
    let shutdown = CancellationToken::new();

    let (tx, mut rx) = mpsc::channel::<ApiCommand>(10);

    let bot = Arc::new(HttpBotClient::new(
        &config.bot.base_url,
        &config.bot.api_key,
        &config.bot.name,
        Duration::from_secs(config.bot.request_timeout_seconds),
    )?);
    let calendar = Arc::new(HttpCalendarClient::new(
        &config.calendar.base_url,
        &config.calendar.api_token,
        &config.calendar.calendar_id,
        Duration::from_secs(config.calendar.request_timeout_seconds),
    )?);
    let dispatcher = Arc::new(WebhookDispatcher::new(
        &config.webhook.url,
        &config.webhook.secret,
        &config.bot.name,
        Duration::from_secs(config.webhook.timeout_seconds),
        config.webhook.max_retries,
        Duration::from_secs(config.webhook.retry_backoff_base_seconds),
        Duration::from_secs(config.webhook.retry_backoff_cap_seconds),
        db.clone(),
    )?);

    let orchestrator = Arc::new(SessionOrchestrator::new(
        bot,
        dispatcher,
        store.clone(),
        db.clone(),
        OrchestratorLimits {
            join_timeout: Duration::from_secs(config.bot.join_timeout_seconds),
            poll_interval: Duration::from_secs(config.bot.poll_interval_seconds),
            max_meeting_duration: config.max_meeting_duration(),
            max_retries: config.bot.max_retries,
            retry_backoff_base: Duration::from_secs(config.bot.retry_backoff_base_seconds),
        },
        shutdown.clone(),
    ));

    resume_unfinished_sessions(&db, &store, &orchestrator).await?;

    let api_server = ApiServer::new(
        config.api.port,
        SessionsState {
            tx,
            store: store.clone(),
            db: db.clone(),
        },
    );
    tokio::spawn(async move {
        if let Err(e) = api_server.start().await {
            error!("API server failed: {}", e);
        }
    });

    let scheduler = Arc::new(StandupScheduler::new(
        calendar,
        store.clone(),
        db.clone(),
        orchestrator,
        config.standup_time()?,
        config.timezone()?,
        config.meeting.attendees.clone(),
        config.meeting.title.clone(),
        config.meeting_duration(),
        shutdown.clone(),
    ));
    {
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            scheduler.run().await;
        });
    }

    info!("meetbot is ready!");
    info!(
        "Trigger a standup manually: curl -X POST http://127.0.0.1:{}/trigger",
        config.api.port
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested, stopping");
                shutdown.cancel();
                break;
            }
            command = rx.recv() => {
                let Some(command) = command else { break };
                match command {
                    ApiCommand::TriggerStandup => {
                        match scheduler.trigger_once(Utc::now()).await {
                            Ok(meeting_id) => info!(%meeting_id, "Manual standup started"),
                            Err(e) => error!("Manual standup trigger failed: {e:#}"),
                        }
                    }
                }
            }
        }
    }

    Ok(())
}

/// Reload sessions that were mid-flight when the last process stopped and
/// hand each back to an orchestrator.
async fn resume_unfinished_sessions(
    db: &Database,
    store: &SessionStore,
    orchestrator: &Arc<SessionOrchestrator>,
) -> Result<()> {
    let conn = db.connect()?;
    let unfinished = SessionRepository::list_unfinished(&conn)?;
    drop(conn);

    if unfinished.is_empty() {
        return Ok(());
    }

    info!("Resuming {} unfinished session(s)", unfinished.len());
    for session in unfinished {
        let meeting_id = session.meeting_id;
        store.insert(session).await;

        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            if let Err(e) = orchestrator.run(meeting_id).await {
                warn!(%meeting_id, "Resumed session ended with error: {e:#}");
            }
        });
    }

    Ok(())
}
