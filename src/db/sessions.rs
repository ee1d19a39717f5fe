//! Session record persistence.
//!
//! Each state transition is persisted here before the orchestrator takes
//! its next external action, so a restarted process resumes from the last
//! persisted state instead of the beginning. Raw SQL with rusqlite, no ORM.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use uuid::Uuid;

use crate::session::{DeliveryStatus, MeetingSession, SessionStatus};

/// Repository for session rows.
pub struct SessionRepository;

impl SessionRepository {
    pub fn insert(conn: &Connection, session: &MeetingSession) -> Result<()> {
        conn.execute(
            "INSERT INTO sessions (meeting_id, meet_url, meet_external_id, start_time,
             status, delivery_status) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                session.meeting_id.to_string(),
                session.meet_url,
                session.meet_external_id,
                session.start_time.to_rfc3339(),
                session.status.as_str(),
                session.delivery_status.as_str(),
            ],
        )
        .context("Failed to insert session")?;
        Ok(())
    }

    pub fn update_status(conn: &Connection, id: Uuid, status: SessionStatus) -> Result<()> {
        conn.execute(
            "UPDATE sessions SET status = ?1 WHERE meeting_id = ?2",
            params![status.as_str(), id.to_string()],
        )
        .context("Failed to update session status")?;
        Ok(())
    }

    pub fn set_bot_session(conn: &Connection, id: Uuid, bot_session_id: &str) -> Result<()> {
        conn.execute(
            "UPDATE sessions SET bot_session_id = ?1 WHERE meeting_id = ?2",
            params![bot_session_id, id.to_string()],
        )
        .context("Failed to record bot session id")?;
        Ok(())
    }

    pub fn set_end_time(conn: &Connection, id: Uuid, end_time: DateTime<Utc>) -> Result<()> {
        conn.execute(
            "UPDATE sessions SET end_time = ?1 WHERE meeting_id = ?2",
            params![end_time.to_rfc3339(), id.to_string()],
        )
        .context("Failed to record session end time")?;
        Ok(())
    }

    pub fn set_transcript(conn: &Connection, id: Uuid, transcript: &str) -> Result<()> {
        conn.execute(
            "UPDATE sessions SET transcript = ?1 WHERE meeting_id = ?2",
            params![transcript, id.to_string()],
        )
        .context("Failed to record transcript")?;
        Ok(())
    }

    pub fn set_delivery(
        conn: &Connection,
        id: Uuid,
        attempts: u32,
        status: DeliveryStatus,
    ) -> Result<()> {
        conn.execute(
            "UPDATE sessions SET delivery_attempts = ?1, delivery_status = ?2
             WHERE meeting_id = ?3",
            params![attempts, status.as_str(), id.to_string()],
        )
        .context("Failed to update delivery state")?;
        Ok(())
    }

    /// Mark a session failed with error context.
    pub fn fail(conn: &Connection, id: Uuid, error: &str) -> Result<()> {
        conn.execute(
            "UPDATE sessions SET status = ?1, last_error = ?2 WHERE meeting_id = ?3",
            params![SessionStatus::Failed.as_str(), error, id.to_string()],
        )
        .context("Failed to mark session as failed")?;
        Ok(())
    }

    /// Append one delivery attempt to the audit trail.
    pub fn record_delivery_attempt(
        conn: &Connection,
        id: Uuid,
        attempt: u32,
        success: bool,
        detail: &str,
    ) -> Result<()> {
        conn.execute(
            "INSERT INTO delivery_attempts (meeting_id, attempt, success, detail)
             VALUES (?1, ?2, ?3, ?4)",
            params![id.to_string(), attempt, success as i64, detail],
        )
        .context("Failed to record delivery attempt")?;
        Ok(())
    }

    pub fn count_delivery_attempts(conn: &Connection, id: Uuid) -> Result<i64> {
        conn.query_row(
            "SELECT COUNT(*) FROM delivery_attempts WHERE meeting_id = ?1",
            params![id.to_string()],
            |row| row.get(0),
        )
        .context("Failed to count delivery attempts")
    }

    pub fn get(conn: &Connection, id: Uuid) -> Result<Option<MeetingSession>> {
        let mut stmt = conn
            .prepare(&format!("{SELECT_COLUMNS} WHERE meeting_id = ?1"))
            .context("Failed to prepare session query")?;

        let mut rows = stmt
            .query_map(params![id.to_string()], row_to_session)
            .context("Failed to query session")?;

        match rows.next() {
            Some(Ok(session)) => Ok(Some(session)),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    /// List sessions, newest first.
    pub fn list(conn: &Connection, limit: usize) -> Result<Vec<MeetingSession>> {
        let mut stmt = conn
            .prepare(&format!(
                "{SELECT_COLUMNS} ORDER BY start_time DESC LIMIT ?1"
            ))
            .context("Failed to prepare sessions list query")?;

        let rows = stmt
            .query_map(params![limit as i64], row_to_session)
            .context("Failed to list sessions")?;

        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row?);
        }
        Ok(sessions)
    }

    /// Sessions not yet in a terminal state, for crash recovery at startup.
    pub fn list_unfinished(conn: &Connection) -> Result<Vec<MeetingSession>> {
        let mut stmt = conn
            .prepare(&format!(
                "{SELECT_COLUMNS} WHERE status NOT IN ('delivered', 'failed')
                 ORDER BY start_time ASC"
            ))
            .context("Failed to prepare unfinished sessions query")?;

        let rows = stmt
            .query_map([], row_to_session)
            .context("Failed to list unfinished sessions")?;

        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row?);
        }
        Ok(sessions)
    }
}

const SELECT_COLUMNS: &str = "SELECT meeting_id, meet_url, meet_external_id, start_time,
    end_time, status, transcript, bot_session_id, delivery_attempts, delivery_status,
    last_error FROM sessions";

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<MeetingSession> {
    let meeting_id: String = row.get(0)?;
    let start_time: String = row.get(3)?;
    let end_time: Option<String> = row.get(4)?;
    let status: String = row.get(5)?;
    let delivery_status: String = row.get(9)?;

    Ok(MeetingSession {
        meeting_id: meeting_id
            .parse()
            .map_err(|_| rusqlite::Error::InvalidQuery)?,
        meet_url: row.get(1)?,
        meet_external_id: row.get(2)?,
        start_time: parse_timestamp(&start_time)?,
        end_time: end_time.as_deref().map(parse_timestamp).transpose()?,
        status: SessionStatus::parse(&status).ok_or(rusqlite::Error::InvalidQuery)?,
        transcript: row.get(6)?,
        bot_session_id: row.get(7)?,
        delivery_attempts: row.get(8)?,
        delivery_status: DeliveryStatus::parse(&delivery_status)
            .ok_or(rusqlite::Error::InvalidQuery)?,
        last_error: row.get(10)?,
    })
}

fn parse_timestamp(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| rusqlite::Error::InvalidQuery)
}
