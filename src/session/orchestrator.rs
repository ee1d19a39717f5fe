//! Drives one session through its lifecycle.
//!
//! The orchestrator is the only writer for the session it drives. Each
//! phase persists its transition to the database before the next external
//! call, so a restarted process picks up at the last recorded status via
//! `run` and never repeats a completed phase.

use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bot::{BotClient, BotStatus, JoinTicket};
use crate::db::{Database, SessionRepository};
use crate::retry::backoff_delay;
use crate::session::{MeetingSession, SessionStatus, SessionStore, StoreError};
use crate::webhook::{DeliveryOutcome, WebhookDispatcher};

/// Timing and retry budgets for one session run.
#[derive(Debug, Clone)]
pub struct OrchestratorLimits {
    /// How long to wait for bot admission before failing the session.
    pub join_timeout: Duration,
    /// Cadence of bot status polls.
    pub poll_interval: Duration,
    /// Hard ceiling on meeting length, measured from the scheduled start.
    pub max_meeting_duration: Duration,
    /// Retry budget for join requests and transcript fetches.
    pub max_retries: u32,
    /// Base delay for exponential backoff between retries.
    pub retry_backoff_base: Duration,
}

pub struct SessionOrchestrator {
    bot: Arc<dyn BotClient>,
    dispatcher: Arc<WebhookDispatcher>,
    store: SessionStore,
    db: Database,
    limits: OrchestratorLimits,
    shutdown: CancellationToken,
}

/// Why a phase stopped without completing the session.
enum Halt {
    /// Shutdown requested; state is persisted, a later run resumes.
    Shutdown,
    /// Another driver advanced the session; this run abandons it.
    Superseded,
}

impl SessionOrchestrator {
    pub fn new(
        bot: Arc<dyn BotClient>,
        dispatcher: Arc<WebhookDispatcher>,
        store: SessionStore,
        db: Database,
        limits: OrchestratorLimits,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            bot,
            dispatcher,
            store,
            db,
            limits,
            shutdown,
        }
    }

    /// Drive the session from its current status to a terminal one. Safe to
    /// call on a resumed session; completed phases are skipped.
    pub async fn run(&self, meeting_id: Uuid) -> Result<()> {
        match self.drive(meeting_id).await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(%meeting_id, "Session run aborted: {e:#}");
                self.fail(meeting_id, &format!("{e:#}")).await;
                Err(e)
            }
        }
    }

    async fn drive(&self, meeting_id: Uuid) -> Result<()> {
        let session = self
            .store
            .get(meeting_id)
            .await
            .with_context(|| format!("Session {meeting_id} not in store"))?;

        info!(%meeting_id, status = %session.status, "Driving session");

        let mut ticket = session
            .bot_session_id
            .clone()
            .map(|bot_id| JoinTicket {
                bot_id,
                meet_external_id: session.meet_external_id.clone(),
            });

        if session.status == SessionStatus::Created {
            match self.join_phase(&session).await? {
                Ok(t) => ticket = Some(t),
                Err(halt) => return self.halted(meeting_id, halt),
            }
        }

        let current = self.status_of(meeting_id).await?;
        if current == SessionStatus::Joining {
            let Some(ticket) = ticket.as_ref() else {
                self.fail(meeting_id, "No bot session to resume polling").await;
                return Ok(());
            };
            if let Err(halt) = self.admission_phase(meeting_id, ticket).await? {
                return self.halted(meeting_id, halt);
            }
        }

        let current = self.status_of(meeting_id).await?;
        if current == SessionStatus::Active {
            let Some(ticket) = ticket.as_ref() else {
                self.fail(meeting_id, "No bot session to resume polling").await;
                return Ok(());
            };
            if let Err(halt) = self.active_phase(meeting_id, ticket).await? {
                return self.halted(meeting_id, halt);
            }
        }

        let current = self.status_of(meeting_id).await?;
        if current == SessionStatus::Ended {
            let Some(ticket) = ticket.as_ref() else {
                self.fail(meeting_id, "No bot session to fetch transcript from")
                    .await;
                return Ok(());
            };
            if let Err(halt) = self.transcript_phase(meeting_id, ticket).await? {
                return self.halted(meeting_id, halt);
            }
        }

        let current = self.status_of(meeting_id).await?;
        if matches!(
            current,
            SessionStatus::TranscriptReady | SessionStatus::Delivering
        ) {
            if let Err(halt) = self.delivery_phase(meeting_id).await? {
                return self.halted(meeting_id, halt);
            }
        }

        Ok(())
    }

    /// Request the bot join, retrying transient failures.
    async fn join_phase(&self, session: &MeetingSession) -> Result<PhaseResult<JoinTicket>> {
        let id = session.meeting_id;
        let mut attempt = 0u32;

        let ticket = loop {
            attempt += 1;
            match self
                .bot
                .join_meeting(&session.meet_url, &session.meet_external_id)
                .await
            {
                Ok(ticket) => break ticket,
                Err(e) if attempt < self.limits.max_retries => {
                    warn!(meeting_id = %id, attempt, "Bot join failed, retrying: {e:#}");
                    let delay =
                        backoff_delay(self.limits.retry_backoff_base, attempt, Duration::MAX);
                    if self.wait(delay).await {
                        return Ok(Err(Halt::Shutdown));
                    }
                }
                Err(e) => {
                    self.fail(id, &format!("Bot join failed after {attempt} attempts: {e:#}"))
                        .await;
                    return Ok(Err(Halt::Superseded));
                }
            }
        };

        self.store.set_bot_session(id, ticket.bot_id.clone()).await?;
        let conn = self.db.connect()?;
        SessionRepository::set_bot_session(&conn, id, &ticket.bot_id)?;
        drop(conn);

        if !self
            .advance(id, SessionStatus::Created, SessionStatus::Joining)
            .await?
        {
            return Ok(Err(Halt::Superseded));
        }

        Ok(Ok(ticket))
    }

    /// Poll until the bot is admitted, the meeting ends, or the join
    /// timeout elapses.
    async fn admission_phase(&self, id: Uuid, ticket: &JoinTicket) -> Result<PhaseResult<()>> {
        let deadline = tokio::time::Instant::now() + self.limits.join_timeout;

        loop {
            if tokio::time::Instant::now() >= deadline {
                let _ = self.bot.leave_meeting(ticket).await;
                self.fail(id, "Bot was not admitted before the join timeout")
                    .await;
                return Ok(Err(Halt::Superseded));
            }

            match self.bot.poll_status(ticket).await {
                Ok(BotStatus::Active) => {
                    if !self
                        .advance(id, SessionStatus::Joining, SessionStatus::Active)
                        .await?
                    {
                        return Ok(Err(Halt::Superseded));
                    }
                    info!(meeting_id = %id, "Bot admitted to meeting");
                    return Ok(Ok(()));
                }
                Ok(BotStatus::Ended) => {
                    // The call ended before admission finished. Step through
                    // Active so the machine never skips a state.
                    if !self
                        .advance(id, SessionStatus::Joining, SessionStatus::Active)
                        .await?
                    {
                        return Ok(Err(Halt::Superseded));
                    }
                    // Best-effort cleanup; the bot may already be gone.
                    let _ = self.bot.leave_meeting(ticket).await;
                    self.record_end(id).await?;
                    if !self
                        .advance(id, SessionStatus::Active, SessionStatus::Ended)
                        .await?
                    {
                        return Ok(Err(Halt::Superseded));
                    }
                    return Ok(Ok(()));
                }
                Ok(BotStatus::Joining) => {
                    debug!(meeting_id = %id, "Bot still waiting for admission");
                }
                Err(e) => {
                    warn!(meeting_id = %id, "Bot status poll failed: {e:#}");
                }
            }

            if self.wait(self.limits.poll_interval).await {
                return Ok(Err(Halt::Shutdown));
            }
        }
    }

    /// Poll the live meeting until it ends or hits the duration ceiling.
    async fn active_phase(&self, id: Uuid, ticket: &JoinTicket) -> Result<PhaseResult<()>> {
        let session = self
            .store
            .get(id)
            .await
            .with_context(|| format!("Session {id} not in store"))?;
        let ceiling = session.start_time
            + chrono::Duration::from_std(self.limits.max_meeting_duration)?;

        loop {
            if Utc::now() >= ceiling {
                warn!(meeting_id = %id, "Meeting hit the duration ceiling, forcing end");
                break;
            }

            match self.bot.poll_status(ticket).await {
                Ok(BotStatus::Ended) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!(meeting_id = %id, "Bot status poll failed: {e:#}");
                }
            }

            if self.wait(self.limits.poll_interval).await {
                return Ok(Err(Halt::Shutdown));
            }
        }

        // Best-effort cleanup; the bot may already be gone.
        let _ = self.bot.leave_meeting(ticket).await;

        self.record_end(id).await?;
        if !self
            .advance(id, SessionStatus::Active, SessionStatus::Ended)
            .await?
        {
            return Ok(Err(Halt::Superseded));
        }
        info!(meeting_id = %id, "Meeting ended");
        Ok(Ok(()))
    }

    /// Fetch the transcript, retrying transient failures. An empty
    /// transcript counts as transient; the service may still be finalizing.
    async fn transcript_phase(&self, id: Uuid, ticket: &JoinTicket) -> Result<PhaseResult<()>> {
        let mut attempt = 0u32;

        let transcript = loop {
            attempt += 1;
            match self.bot.fetch_transcript(ticket).await {
                Ok(t) if !t.is_empty() => break t,
                Ok(_) if attempt < self.limits.max_retries => {
                    debug!(meeting_id = %id, attempt, "Transcript not ready yet");
                }
                Ok(_) => {
                    self.fail(id, "Transcript was empty after all retries").await;
                    return Ok(Err(Halt::Superseded));
                }
                Err(e) if attempt < self.limits.max_retries => {
                    warn!(meeting_id = %id, attempt, "Transcript fetch failed, retrying: {e:#}");
                }
                Err(e) => {
                    self.fail(
                        id,
                        &format!("Transcript fetch failed after {attempt} attempts: {e:#}"),
                    )
                    .await;
                    return Ok(Err(Halt::Superseded));
                }
            }

            let delay = backoff_delay(self.limits.retry_backoff_base, attempt, Duration::MAX);
            if self.wait(delay).await {
                return Ok(Err(Halt::Shutdown));
            }
        };

        self.store.set_transcript(id, transcript.clone()).await?;
        let conn = self.db.connect()?;
        SessionRepository::set_transcript(&conn, id, &transcript)?;
        drop(conn);

        if !self
            .advance(id, SessionStatus::Ended, SessionStatus::TranscriptReady)
            .await?
        {
            return Ok(Err(Halt::Superseded));
        }
        info!(meeting_id = %id, "Transcript retrieved");
        Ok(Ok(()))
    }

    /// Hand the transcript to the webhook dispatcher.
    async fn delivery_phase(&self, id: Uuid) -> Result<PhaseResult<()>> {
        let current = self.status_of(id).await?;
        if current == SessionStatus::TranscriptReady
            && !self
                .advance(id, SessionStatus::TranscriptReady, SessionStatus::Delivering)
                .await?
        {
            return Ok(Err(Halt::Superseded));
        }

        let session = self
            .store
            .get(id)
            .await
            .with_context(|| format!("Session {id} not in store"))?;

        match self
            .dispatcher
            .deliver(&self.store, &session, &self.shutdown)
            .await?
        {
            DeliveryOutcome::Delivered => {
                if !self
                    .advance(id, SessionStatus::Delivering, SessionStatus::Delivered)
                    .await?
                {
                    return Ok(Err(Halt::Superseded));
                }
                info!(meeting_id = %id, "Session complete");
                Ok(Ok(()))
            }
            DeliveryOutcome::Exhausted => {
                self.fail(id, "Webhook delivery retries exhausted").await;
                Ok(Err(Halt::Superseded))
            }
            DeliveryOutcome::Interrupted => Ok(Err(Halt::Shutdown)),
        }
    }

    /// CAS the store, then persist. Returns false when another driver won
    /// the race; the caller abandons the session to the winner.
    async fn advance(&self, id: Uuid, from: SessionStatus, to: SessionStatus) -> Result<bool> {
        match self.store.update_status(id, from, to).await {
            Ok(()) => {
                let conn = self.db.connect()?;
                SessionRepository::update_status(&conn, id, to)?;
                debug!(meeting_id = %id, %from, %to, "Session advanced");
                Ok(true)
            }
            Err(StoreError::Conflict { actual, .. }) => {
                warn!(
                    meeting_id = %id, %from, %to, %actual,
                    "Session advanced elsewhere, abandoning this run"
                );
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn record_end(&self, id: Uuid) -> Result<()> {
        let end_time = Utc::now();
        self.store.set_end_time(id, end_time).await?;
        let conn = self.db.connect()?;
        SessionRepository::set_end_time(&conn, id, end_time)
    }

    /// Mark the session failed in both the store and the database.
    async fn fail(&self, id: Uuid, error: &str) {
        error!(meeting_id = %id, "Session failed: {error}");
        if let Err(e) = self.store.mark_failed(id, error).await {
            warn!(meeting_id = %id, "Could not mark session failed in store: {e}");
        }
        match self.db.connect() {
            Ok(conn) => {
                if let Err(e) = SessionRepository::fail(&conn, id, error) {
                    warn!(meeting_id = %id, "Could not persist session failure: {e:#}");
                }
            }
            Err(e) => warn!(meeting_id = %id, "Could not persist session failure: {e:#}"),
        }
    }

    /// Cancellable sleep. Returns true when shutdown was requested.
    async fn wait(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => true,
            _ = tokio::time::sleep(duration) => false,
        }
    }

    async fn status_of(&self, id: Uuid) -> Result<SessionStatus> {
        Ok(self
            .store
            .get(id)
            .await
            .with_context(|| format!("Session {id} not in store"))?
            .status)
    }

    fn halted(&self, meeting_id: Uuid, halt: Halt) -> Result<()> {
        match halt {
            Halt::Shutdown => info!(%meeting_id, "Session run paused for shutdown"),
            Halt::Superseded => {}
        }
        Ok(())
    }
}

type PhaseResult<T> = std::result::Result<T, Halt>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webhook::SIGNATURE_HEADER;
    use async_trait::async_trait;
    use axum::http::HeaderMap;
    use axum::routing::post;
    use axum::Router;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Bot that replays a scripted sequence of poll results.
    struct ScriptedBot {
        join_failures: AtomicU32,
        statuses: Mutex<Vec<BotStatus>>,
        transcript: String,
        leaves: std::sync::Arc<AtomicU32>,
    }

    impl ScriptedBot {
        fn new(join_failures: u32, statuses: Vec<BotStatus>, transcript: &str) -> Self {
            Self {
                join_failures: AtomicU32::new(join_failures),
                statuses: Mutex::new(statuses),
                transcript: transcript.to_string(),
                leaves: std::sync::Arc::new(AtomicU32::new(0)),
            }
        }
    }

    #[async_trait]
    impl BotClient for ScriptedBot {
        async fn join_meeting(
            &self,
            _meet_url: &str,
            meet_external_id: &str,
        ) -> Result<JoinTicket> {
            let remaining = self.join_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.join_failures.fetch_sub(1, Ordering::SeqCst);
                anyhow::bail!("join rejected");
            }
            Ok(JoinTicket {
                bot_id: "bot-1".to_string(),
                meet_external_id: meet_external_id.to_string(),
            })
        }

        async fn poll_status(&self, _ticket: &JoinTicket) -> Result<BotStatus> {
            let mut statuses = self.statuses.lock().unwrap();
            if statuses.len() > 1 {
                Ok(statuses.remove(0))
            } else {
                Ok(statuses[0])
            }
        }

        async fn fetch_transcript(&self, _ticket: &JoinTicket) -> Result<String> {
            Ok(self.transcript.clone())
        }

        async fn leave_meeting(&self, _ticket: &JoinTicket) -> Result<()> {
            self.leaves.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Harness {
        store: SessionStore,
        db: Database,
        session: MeetingSession,
        hits: std::sync::Arc<AtomicU32>,
        _dir: TempDir,
    }

    async fn harness(bot: ScriptedBot, limits: OrchestratorLimits) -> (SessionOrchestrator, Harness) {
        let hits = std::sync::Arc::new(AtomicU32::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            "/hook",
            post(move |headers: HeaderMap, body: axum::body::Bytes| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let signature = headers
                        .get(SIGNATURE_HEADER)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default();
                    assert!(crate::webhook::verify_signature("topsecret", &body, signature));
                    axum::http::StatusCode::OK
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let dir = TempDir::new().unwrap();
        let db = Database::at(dir.path().join("test.db"));
        let store = SessionStore::default();

        let session = MeetingSession::new(
            "https://meet.example.com/abc".to_string(),
            "abc".to_string(),
            Utc::now(),
        );
        store.insert(session.clone()).await;
        let conn = db.connect().unwrap();
        SessionRepository::insert(&conn, &session).unwrap();
        drop(conn);

        let dispatcher = WebhookDispatcher::new(
            &format!("http://{addr}/hook"),
            "topsecret",
            "meetbot",
            Duration::from_secs(5),
            3,
            Duration::from_millis(10),
            Duration::from_millis(50),
            db.clone(),
        )
        .unwrap();

        let orchestrator = SessionOrchestrator::new(
            Arc::new(bot),
            Arc::new(dispatcher),
            store.clone(),
            db.clone(),
            limits,
            CancellationToken::new(),
        );

        (
            orchestrator,
            Harness {
                store,
                db,
                session,
                hits,
                _dir: dir,
            },
        )
    }

    fn fast_limits() -> OrchestratorLimits {
        OrchestratorLimits {
            join_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(10),
            max_meeting_duration: Duration::from_secs(3600),
            max_retries: 3,
            retry_backoff_base: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn test_happy_path_reaches_delivered() {
        let bot = ScriptedBot::new(
            0,
            vec![
                BotStatus::Joining,
                BotStatus::Active,
                BotStatus::Active,
                BotStatus::Ended,
            ],
            "Alice: shipped the parser",
        );
        let (orchestrator, h) = harness(bot, fast_limits()).await;

        orchestrator.run(h.session.meeting_id).await.unwrap();

        let found = h.store.get(h.session.meeting_id).await.unwrap();
        assert_eq!(found.status, SessionStatus::Delivered);
        assert_eq!(found.delivery_attempts, 1);
        assert!(found.end_time.is_some());
        assert_eq!(found.transcript.as_deref(), Some("Alice: shipped the parser"));
        assert_eq!(h.hits.load(Ordering::SeqCst), 1);

        // Persisted state matches.
        let conn = h.db.connect().unwrap();
        let persisted = SessionRepository::get(&conn, h.session.meeting_id)
            .unwrap()
            .unwrap();
        assert_eq!(persisted.status, SessionStatus::Delivered);
    }

    #[tokio::test]
    async fn test_join_failure_exhausts_retries_without_webhook() {
        let bot = ScriptedBot::new(u32::MAX, vec![BotStatus::Ended], "");
        let (orchestrator, h) = harness(bot, fast_limits()).await;

        orchestrator.run(h.session.meeting_id).await.unwrap();

        let found = h.store.get(h.session.meeting_id).await.unwrap();
        assert_eq!(found.status, SessionStatus::Failed);
        assert!(found.last_error.is_some());
        assert_eq!(h.hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_join_retries_then_succeeds() {
        let bot = ScriptedBot::new(
            2,
            vec![BotStatus::Active, BotStatus::Ended],
            "Bob: reviewed the queue changes",
        );
        let (orchestrator, h) = harness(bot, fast_limits()).await;

        orchestrator.run(h.session.meeting_id).await.unwrap();

        let found = h.store.get(h.session.meeting_id).await.unwrap();
        assert_eq!(found.status, SessionStatus::Delivered);
    }

    #[tokio::test]
    async fn test_admission_timeout_fails_session() {
        let bot = ScriptedBot::new(0, vec![BotStatus::Joining], "");
        let mut limits = fast_limits();
        limits.join_timeout = Duration::from_millis(50);
        let (orchestrator, h) = harness(bot, limits).await;

        orchestrator.run(h.session.meeting_id).await.unwrap();

        let found = h.store.get(h.session.meeting_id).await.unwrap();
        assert_eq!(found.status, SessionStatus::Failed);
        assert_eq!(h.hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_duration_ceiling_forces_end_then_delivers() {
        // Bot never reports Ended once active.
        let bot = ScriptedBot::new(
            0,
            vec![BotStatus::Active, BotStatus::Active],
            "Carol: blocked on the schema review",
        );
        let mut limits = fast_limits();
        limits.max_meeting_duration = Duration::from_millis(50);
        let (orchestrator, h) = harness(bot, limits).await;

        orchestrator.run(h.session.meeting_id).await.unwrap();

        let found = h.store.get(h.session.meeting_id).await.unwrap();
        assert_eq!(found.status, SessionStatus::Delivered);
        assert!(found.end_time.is_some());
        assert_eq!(h.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_meeting_ending_during_admission_still_delivers() {
        let bot = ScriptedBot::new(0, vec![BotStatus::Ended], "Dave: quick one today");
        let leaves = bot.leaves.clone();
        let (orchestrator, h) = harness(bot, fast_limits()).await;

        orchestrator.run(h.session.meeting_id).await.unwrap();

        let found = h.store.get(h.session.meeting_id).await.unwrap();
        assert_eq!(found.status, SessionStatus::Delivered);
        // The bot is removed even though the call ended before admission.
        assert_eq!(leaves.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_resume_from_transcript_ready() {
        let bot = ScriptedBot::new(0, vec![BotStatus::Ended], "");
        let (orchestrator, h) = harness(bot, fast_limits()).await;
        let id = h.session.meeting_id;

        // Simulate a prior run that got as far as fetching the transcript.
        let mut resumed = h.session.clone();
        resumed.status = SessionStatus::TranscriptReady;
        resumed.transcript = Some("Erin: resumed after restart".to_string());
        resumed.bot_session_id = Some("bot-1".to_string());
        h.store.insert(resumed).await;

        orchestrator.run(id).await.unwrap();

        let found = h.store.get(id).await.unwrap();
        assert_eq!(found.status, SessionStatus::Delivered);
        assert_eq!(h.hits.load(Ordering::SeqCst), 1);
    }
}
