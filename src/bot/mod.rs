//! Client for the external meeting-automation service.
//!
//! The service is consumed as a request/poll API: request a bot join, poll
//! the bot's status until the meeting ends, then fetch the transcript. The
//! `BotClient` trait is the seam the orchestrator is tested against.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

/// Observed state of the bot inside a meeting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BotStatus {
    /// Bot requested, waiting for admission.
    Joining,
    /// Bot admitted and transcribing.
    Active,
    /// The call has ended.
    Ended,
}

/// Opaque handle identifying one join request.
#[derive(Debug, Clone)]
pub struct JoinTicket {
    pub bot_id: String,
    pub meet_external_id: String,
}

#[async_trait]
pub trait BotClient: Send + Sync {
    /// Request the bot to join a meeting. Returns a ticket used for all
    /// subsequent polling and transcript retrieval.
    async fn join_meeting(&self, meet_url: &str, meet_external_id: &str) -> Result<JoinTicket>;

    async fn poll_status(&self, ticket: &JoinTicket) -> Result<BotStatus>;

    async fn fetch_transcript(&self, ticket: &JoinTicket) -> Result<String>;

    /// Remove the bot from the meeting. Best-effort cleanup; a missing bot
    /// is not an error.
    async fn leave_meeting(&self, ticket: &JoinTicket) -> Result<()>;
}

/// HTTP implementation against the meeting-automation gateway.
pub struct HttpBotClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    bot_name: String,
}

#[derive(Debug, Deserialize)]
struct CreateBotResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct BotStatusResponse {
    status: String,
}

#[derive(Debug, Deserialize)]
struct TranscriptResponse {
    transcript: String,
}

impl HttpBotClient {
    pub fn new(
        base_url: &str,
        api_key: &str,
        bot_name: &str,
        request_timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("Failed to build bot HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            bot_name: bot_name.to_string(),
        })
    }

    fn map_status(raw: &str) -> Result<BotStatus> {
        match raw {
            "requested" | "joining" | "waiting_for_admission" | "pending" | "waiting" => {
                Ok(BotStatus::Joining)
            }
            "active" | "in_meeting" | "connected" | "admitted" => Ok(BotStatus::Active),
            "ended" | "completed" | "left" | "finished" => Ok(BotStatus::Ended),
            other => anyhow::bail!("Unknown bot status: {other}"),
        }
    }
}

#[async_trait]
impl BotClient for HttpBotClient {
    async fn join_meeting(&self, meet_url: &str, meet_external_id: &str) -> Result<JoinTicket> {
        let payload = serde_json::json!({
            "platform": "google_meet",
            "meeting_url": meet_url,
            "native_meeting_id": meet_external_id,
            "name": self.bot_name,
        });

        let response = self
            .client
            .post(format!("{}/bots", self.base_url))
            .header("X-API-Key", &self.api_key)
            .json(&payload)
            .send()
            .await
            .context("Failed to send bot join request")?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            anyhow::bail!("Bot join request failed ({}): {}", status, body);
        }

        let created: CreateBotResponse =
            serde_json::from_str(&body).context("Failed to parse bot join response")?;

        Ok(JoinTicket {
            bot_id: created.id,
            meet_external_id: meet_external_id.to_string(),
        })
    }

    async fn poll_status(&self, ticket: &JoinTicket) -> Result<BotStatus> {
        let url = format!("{}/bots/{}", self.base_url, ticket.meet_external_id);

        let response = self
            .client
            .get(&url)
            .header("X-API-Key", &self.api_key)
            .send()
            .await
            .context("Failed to poll bot status")?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            anyhow::bail!("Bot status poll failed ({}): {}", status, body);
        }

        let parsed: BotStatusResponse =
            serde_json::from_str(&body).context("Failed to parse bot status response")?;

        Self::map_status(&parsed.status)
    }

    async fn fetch_transcript(&self, ticket: &JoinTicket) -> Result<String> {
        let url = format!(
            "{}/transcripts/{}",
            self.base_url, ticket.meet_external_id
        );

        let response = self
            .client
            .get(&url)
            .header("X-API-Key", &self.api_key)
            .send()
            .await
            .context("Failed to fetch transcript")?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            anyhow::bail!("Transcript fetch failed ({}): {}", status, body);
        }

        let parsed: TranscriptResponse =
            serde_json::from_str(&body).context("Failed to parse transcript response")?;

        Ok(parsed.transcript)
    }

    async fn leave_meeting(&self, ticket: &JoinTicket) -> Result<()> {
        let url = format!("{}/bots/{}", self.base_url, ticket.meet_external_id);

        let response = self
            .client
            .delete(&url)
            .header("X-API-Key", &self.api_key)
            .send()
            .await
            .context("Failed to send bot leave request")?;

        // 404 means the bot is already gone.
        if !response.status().is_success() && response.status().as_u16() != 404 {
            anyhow::bail!("Bot leave request failed ({})", response.status());
        }

        Ok(())
    }
}
