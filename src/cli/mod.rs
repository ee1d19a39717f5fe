use crate::bot::HttpBotClient;
use crate::config::Config;
use crate::db::{Database, SessionRepository};
use crate::session::{
    MeetingSession, OrchestratorLimits, SessionOrchestrator, SessionStore,
};
use crate::webhook::WebhookDispatcher;
use anyhow::{anyhow, Result};
use chrono::Utc;
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "meetbot")]
#[command(about = "Automated standup meetings with transcript delivery", long_about = None)]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<CliCommand>,
}

#[derive(Subcommand, Debug)]
pub enum CliCommand {
    /// Print version information
    Version,
    /// Run one session against an existing meeting, outside the schedule
    Trigger(TriggerCliArgs),
    /// Inspect recorded sessions
    Sessions(SessionsCliArgs),
}

#[derive(ClapArgs, Debug)]
pub struct TriggerCliArgs {
    /// Join URL of the meeting to attend
    pub meeting_url: String,
    /// The meeting service's identifier; defaults to the last URL segment
    #[arg(long)]
    pub external_id: Option<String>,
}

#[derive(ClapArgs, Debug)]
pub struct SessionsCliArgs {
    /// Show one session in full, including its transcript
    #[arg(short, long)]
    pub id: Option<Uuid>,
    /// Maximum number of sessions to list
    #[arg(short, long, default_value = "20")]
    pub limit: usize,
}

pub fn handle_sessions_command(args: SessionsCliArgs) -> Result<()> {
    let db = Database::open_default()?;
    let conn = db.connect()?;

    if let Some(id) = args.id {
        let session = SessionRepository::get(&conn, id)?
            .ok_or_else(|| anyhow!("Session {} not found", id))?;

        println!("Meeting ID: {}", session.meeting_id);
        println!("URL: {}", session.meet_url);
        println!("Status: {}", session.status);
        println!("Started: {}", session.start_time);
        if let Some(end) = session.end_time {
            println!("Ended: {}", end);
        }
        println!(
            "Delivery: {} ({} attempt(s))",
            session.delivery_status, session.delivery_attempts
        );
        if let Some(error) = &session.last_error {
            println!("Last error: {}", error);
        }
        if let Some(transcript) = &session.transcript {
            println!("\nTranscript:\n{}", transcript);
        }
        return Ok(());
    }

    let sessions = SessionRepository::list(&conn, args.limit)?;
    if sessions.is_empty() {
        println!("No sessions recorded yet.");
        return Ok(());
    }

    println!("Found {} session(s):\n", sessions.len());
    for session in sessions {
        println!("ID: {}", session.meeting_id);
        println!("Started: {}", session.start_time);
        println!("Status: {}", session.status);
        println!(
            "Delivery: {} ({} attempt(s))",
            session.delivery_status, session.delivery_attempts
        );
        println!("---");
    }

    println!("\nTo view a transcript, use: meetbot sessions --id <ID>");

    Ok(())
}

/// One-shot session run against an existing meeting URL. Blocks until the
/// session reaches a terminal state.
pub async fn handle_trigger_command(args: TriggerCliArgs) -> Result<()> {
    let config = Config::load()?;
    config.validate()?;

    let external_id = match args.external_id {
        Some(id) => id,
        None => args
            .meeting_url
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow!("Could not derive an external id from the meeting URL"))?
            .to_string(),
    };

    let db = Database::open_default()?;
    let store = SessionStore::default();

    let bot = Arc::new(HttpBotClient::new(
        &config.bot.base_url,
        &config.bot.api_key,
        &config.bot.name,
        Duration::from_secs(config.bot.request_timeout_seconds),
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

    let orchestrator = SessionOrchestrator::new(
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
        CancellationToken::new(),
    );

    let session = MeetingSession::new(args.meeting_url, external_id, Utc::now());
    let meeting_id = session.meeting_id;

    store.insert(session.clone()).await;
    let conn = db.connect()?;
    SessionRepository::insert(&conn, &session)?;
    drop(conn);

    println!("Session {} started, joining the meeting...", meeting_id);

    orchestrator.run(meeting_id).await?;

    let final_state = store
        .get(meeting_id)
        .await
        .ok_or_else(|| anyhow!("Session {} vanished from the store", meeting_id))?;

    println!("Session finished with status: {}", final_state.status);
    if let Some(error) = &final_state.last_error {
        println!("Last error: {}", error);
    }

    Ok(())
}
