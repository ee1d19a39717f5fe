//! In-memory session registry.
//!
//! Single source of truth for live session state, shared between the
//! scheduler, orchestrators, and API handlers. Status changes go through
//! `update_status`, a compare-and-swap keyed on the expected prior status,
//! so two drivers racing on one session cannot both win.

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::status::{DeliveryStatus, SessionStatus};
use super::MeetingSession;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("session {0} not found")]
    NotFound(Uuid),
    #[error("status conflict for session {id}: expected {expected}, found {actual}")]
    Conflict {
        id: Uuid,
        expected: SessionStatus,
        actual: SessionStatus,
    },
    #[error("illegal transition for session {id}: {from} -> {to}")]
    IllegalTransition {
        id: Uuid,
        from: SessionStatus,
        to: SessionStatus,
    },
}

/// Thread-safe handle to the session registry.
#[derive(Clone, Default)]
pub struct SessionStore {
    inner: Arc<Mutex<HashMap<Uuid, MeetingSession>>>,
}

impl SessionStore {
    pub async fn insert(&self, session: MeetingSession) {
        let mut sessions = self.inner.lock().await;
        sessions.insert(session.meeting_id, session);
    }

    pub async fn get(&self, id: Uuid) -> Option<MeetingSession> {
        self.inner.lock().await.get(&id).cloned()
    }

    /// All sessions, newest first.
    pub async fn list(&self) -> Vec<MeetingSession> {
        let sessions = self.inner.lock().await;
        let mut all: Vec<_> = sessions.values().cloned().collect();
        all.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        all
    }

    pub async fn list_by_status(&self, status: SessionStatus) -> Vec<MeetingSession> {
        let sessions = self.inner.lock().await;
        sessions
            .values()
            .filter(|s| s.status == status)
            .cloned()
            .collect()
    }

    /// Compare-and-swap status update. Fails with `Conflict` if the session
    /// is no longer in `expected`, and with `IllegalTransition` if the move
    /// is not a legal step of the state machine. On conflict the caller must
    /// re-read and decide whether another driver already advanced the session.
    pub async fn update_status(
        &self,
        id: Uuid,
        expected: SessionStatus,
        next: SessionStatus,
    ) -> Result<(), StoreError> {
        let mut sessions = self.inner.lock().await;
        let session = sessions.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        if session.status != expected {
            return Err(StoreError::Conflict {
                id,
                expected,
                actual: session.status,
            });
        }
        if !expected.can_advance_to(next) {
            return Err(StoreError::IllegalTransition {
                id,
                from: expected,
                to: next,
            });
        }

        session.status = next;
        Ok(())
    }

    /// Force a session into `Failed` with error context. No-op if the
    /// session is already terminal, so a late failure never overwrites a
    /// delivered outcome.
    pub async fn mark_failed(&self, id: Uuid, error: impl Into<String>) -> Result<(), StoreError> {
        let mut sessions = self.inner.lock().await;
        let session = sessions.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        if session.status.is_terminal() {
            return Ok(());
        }
        session.status = SessionStatus::Failed;
        session.last_error = Some(error.into());
        Ok(())
    }

    pub async fn set_bot_session(&self, id: Uuid, bot_session_id: String) -> Result<(), StoreError> {
        let mut sessions = self.inner.lock().await;
        let session = sessions.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        session.bot_session_id = Some(bot_session_id);
        Ok(())
    }

    pub async fn set_end_time(
        &self,
        id: Uuid,
        end_time: chrono::DateTime<chrono::Utc>,
    ) -> Result<(), StoreError> {
        let mut sessions = self.inner.lock().await;
        let session = sessions.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        session.end_time = Some(end_time);
        Ok(())
    }

    pub async fn set_transcript(&self, id: Uuid, transcript: String) -> Result<(), StoreError> {
        let mut sessions = self.inner.lock().await;
        let session = sessions.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        session.transcript = Some(transcript);
        Ok(())
    }

    /// Increment the delivery attempt counter, returning the new count.
    pub async fn record_delivery_attempt(&self, id: Uuid) -> Result<u32, StoreError> {
        let mut sessions = self.inner.lock().await;
        let session = sessions.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        session.delivery_attempts += 1;
        Ok(session.delivery_attempts)
    }

    pub async fn set_delivery_status(
        &self,
        id: Uuid,
        status: DeliveryStatus,
    ) -> Result<(), StoreError> {
        let mut sessions = self.inner.lock().await;
        let session = sessions.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        session.delivery_status = status;
        Ok(())
    }
}
