//! Client for the external calendar service.
//!
//! The core only needs one operation: create an event carrying an embedded
//! meeting link. Everything else about the calendar is out of scope.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::Duration;

/// Identifiers of the meeting embedded in a created calendar event.
#[derive(Debug, Clone, Deserialize)]
pub struct CreatedEvent {
    pub event_id: String,
    pub meet_url: String,
    pub meet_external_id: String,
}

#[async_trait]
pub trait CalendarClient: Send + Sync {
    async fn create_event(
        &self,
        title: &str,
        attendees: &[String],
        start: DateTime<Utc>,
        duration: Duration,
        timezone: &str,
    ) -> Result<CreatedEvent>;
}

/// HTTP implementation against the calendar service.
pub struct HttpCalendarClient {
    client: reqwest::Client,
    base_url: String,
    api_token: String,
    calendar_id: String,
}

impl HttpCalendarClient {
    pub fn new(
        base_url: &str,
        api_token: &str,
        calendar_id: &str,
        request_timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("Failed to build calendar HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token: api_token.to_string(),
            calendar_id: calendar_id.to_string(),
        })
    }
}

#[async_trait]
impl CalendarClient for HttpCalendarClient {
    async fn create_event(
        &self,
        title: &str,
        attendees: &[String],
        start: DateTime<Utc>,
        duration: Duration,
        timezone: &str,
    ) -> Result<CreatedEvent> {
        let end = start + chrono::Duration::from_std(duration)?;
        let payload = serde_json::json!({
            "summary": title,
            "attendees": attendees,
            "start": start.to_rfc3339(),
            "end": end.to_rfc3339(),
            "timezone": timezone,
            "with_meet_link": true,
        });

        let response = self
            .client
            .post(format!(
                "{}/calendars/{}/events",
                self.base_url, self.calendar_id
            ))
            .bearer_auth(&self.api_token)
            .json(&payload)
            .send()
            .await
            .context("Failed to send calendar event request")?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            anyhow::bail!("Calendar event creation failed ({}): {}", status, body);
        }

        serde_json::from_str(&body).context("Failed to parse calendar event response")
    }
}
