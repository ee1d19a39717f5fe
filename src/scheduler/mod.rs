//! Daily standup scheduling.
//!
//! Sleeps until the next configured standup slot, claims the slot in the
//! database, then creates the calendar event and spawns an orchestrator for
//! the new session. The claimed slot is written before any external call,
//! so a crash mid-trigger skips the slot on restart instead of creating a
//! duplicate standup.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::calendar::CalendarClient;
use crate::db::{self, Database, SessionRepository};
use crate::session::{MeetingSession, SessionOrchestrator, SessionStore};

const LAST_FIRED_SLOT: &str = "last_fired_slot";

pub struct StandupScheduler {
    calendar: Arc<dyn CalendarClient>,
    store: SessionStore,
    db: Database,
    orchestrator: Arc<SessionOrchestrator>,
    standup_time: NaiveTime,
    timezone: Tz,
    attendees: Vec<String>,
    title: String,
    duration: Duration,
    shutdown: CancellationToken,
}

impl StandupScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        calendar: Arc<dyn CalendarClient>,
        store: SessionStore,
        db: Database,
        orchestrator: Arc<SessionOrchestrator>,
        standup_time: NaiveTime,
        timezone: Tz,
        attendees: Vec<String>,
        title: String,
        duration: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            calendar,
            store,
            db,
            orchestrator,
            standup_time,
            timezone,
            attendees,
            title,
            duration,
            shutdown,
        }
    }

    /// Run until shutdown, firing once per day at the configured time.
    pub async fn run(&self) {
        info!(
            time = %self.standup_time,
            timezone = %self.timezone,
            "Standup scheduler running"
        );

        loop {
            let now = Utc::now().with_timezone(&self.timezone);
            let fire_at = next_fire(now, self.standup_time);
            let wait = (fire_at - now).to_std().unwrap_or(Duration::ZERO);
            info!(fire_at = %fire_at, "Next standup scheduled");

            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Standup scheduler stopping");
                    return;
                }
                _ = tokio::time::sleep(wait) => {}
            }

            let slot = slot_key(&fire_at);
            match self.claim_slot(&slot) {
                Ok(true) => {}
                Ok(false) => {
                    info!(%slot, "Standup slot already fired, skipping");
                    continue;
                }
                Err(e) => {
                    error!(%slot, "Could not claim standup slot: {e:#}");
                    continue;
                }
            }

            if let Err(e) = self.trigger_once(Utc::now()).await {
                // Slot stays claimed; a broken trigger is not retried until
                // tomorrow.
                error!(%slot, "Standup trigger failed: {e:#}");
            }
        }
    }

    /// Create the calendar event, register the session, and hand it to an
    /// orchestrator. Also the entry point for manual triggers.
    pub async fn trigger_once(&self, start: DateTime<Utc>) -> Result<Uuid> {
        let event = self
            .calendar
            .create_event(
                &self.title,
                &self.attendees,
                start,
                self.duration,
                self.timezone.name(),
            )
            .await
            .context("Failed to create standup calendar event")?;

        info!(
            event_id = %event.event_id,
            meet_url = %event.meet_url,
            "Standup event created"
        );

        let session = MeetingSession::new(event.meet_url, event.meet_external_id, start);
        let meeting_id = session.meeting_id;

        self.store.insert(session.clone()).await;
        let conn = self.db.connect()?;
        SessionRepository::insert(&conn, &session)?;
        drop(conn);

        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move {
            if let Err(e) = orchestrator.run(meeting_id).await {
                warn!(%meeting_id, "Session run ended with error: {e:#}");
            }
        });

        Ok(meeting_id)
    }

    /// Claim a standup slot. Returns false if this slot already fired,
    /// including before a restart.
    fn claim_slot(&self, slot: &str) -> Result<bool> {
        let conn = self.db.connect()?;
        if db::get_scheduler_state(&conn, LAST_FIRED_SLOT)?.as_deref() == Some(slot) {
            return Ok(false);
        }
        db::set_scheduler_state(&conn, LAST_FIRED_SLOT, slot)?;
        Ok(true)
    }
}

/// Next occurrence of `at` strictly after `now`, in `now`'s timezone.
/// Local times that do not exist (DST gaps) roll forward to the next day.
pub fn next_fire(now: DateTime<Tz>, at: NaiveTime) -> DateTime<Tz> {
    let tz = now.timezone();
    let mut date = now.date_naive();

    loop {
        if let Some(candidate) = tz.from_local_datetime(&date.and_time(at)).earliest() {
            if candidate > now {
                return candidate;
            }
        }
        date += ChronoDuration::days(1);
    }
}

fn slot_key(fire_at: &DateTime<Tz>) -> String {
    fire_at.format("%Y-%m-%d").to_string()
}
