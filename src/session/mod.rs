//! Meeting session lifecycle.
//!
//! A `MeetingSession` tracks one scheduled meeting from calendar creation
//! through bot join, transcript retrieval, and webhook delivery. The
//! `SessionStore` is the single source of truth for session state; the
//! `SessionOrchestrator` is the only writer for a given session while it
//! drives the state machine.

pub mod orchestrator;
pub mod status;
pub mod store;

pub use orchestrator::{OrchestratorLimits, SessionOrchestrator};
pub use status::{DeliveryStatus, SessionStatus};
pub use store::{SessionStore, StoreError};

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// One scheduled meeting's end-to-end lifecycle record.
#[derive(Debug, Clone)]
pub struct MeetingSession {
    /// Unique identifier, assigned at creation.
    pub meeting_id: Uuid,
    /// Join URL of the external meeting. Set once, immutable.
    pub meet_url: String,
    /// The external service's identifier for the meeting. Set once, immutable.
    pub meet_external_id: String,
    pub start_time: DateTime<Utc>,
    /// Set when the meeting is observed to end.
    pub end_time: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    /// Populated only after the meeting ended and the transcript was fetched.
    pub transcript: Option<String>,
    /// Bot session handle from the meeting-automation service, kept so a
    /// restarted process can resume polling the same bot.
    pub bot_session_id: Option<String>,
    /// Webhook delivery attempts made so far. Incremented by the dispatcher only.
    pub delivery_attempts: u32,
    pub delivery_status: DeliveryStatus,
    /// Last error context, retained for failed sessions.
    pub last_error: Option<String>,
}

impl MeetingSession {
    pub fn new(meet_url: String, meet_external_id: String, start_time: DateTime<Utc>) -> Self {
        Self {
            meeting_id: Uuid::new_v4(),
            meet_url,
            meet_external_id,
            start_time,
            end_time: None,
            status: SessionStatus::Created,
            transcript: None,
            bot_session_id: None,
            delivery_attempts: 0,
            delivery_status: DeliveryStatus::Pending,
            last_error: None,
        }
    }

    pub fn has_transcript(&self) -> bool {
        self.transcript.as_deref().is_some_and(|t| !t.is_empty())
    }
}
