use crate::global;
use anyhow::{bail, Context, Result};
use chrono::NaiveTime;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub meeting: MeetingConfig,
    pub bot: BotConfig,
    pub calendar: CalendarConfig,
    pub webhook: WebhookConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeetingConfig {
    /// Daily standup trigger time, local to `timezone` (HH:MM).
    pub standup_time: String,
    /// IANA timezone name the standup time is interpreted in.
    pub timezone: String,
    /// Attendee email addresses invited to the calendar event.
    pub attendees: Vec<String>,
    /// Calendar event title.
    pub title: String,
    /// Scheduled meeting length in minutes.
    pub duration_minutes: u64,
    /// Hard ceiling after which a meeting is forced to end even if the
    /// bot service never reports completion.
    pub max_meeting_duration_minutes: u64,
}

impl Default for MeetingConfig {
    fn default() -> Self {
        Self {
            standup_time: "09:00".to_string(),
            timezone: "America/New_York".to_string(),
            attendees: Vec::new(),
            title: "Daily Standup".to_string(),
            duration_minutes: 30,
            max_meeting_duration_minutes: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    /// Base URL of the meeting-automation service.
    pub base_url: String,
    /// API key sent as `X-API-Key` on every request.
    pub api_key: String,
    /// Display name the bot joins meetings with. Also sent in the
    /// webhook payload as `bot_name`.
    pub name: String,
    /// How long to wait for the bot to be admitted before giving up.
    pub join_timeout_seconds: u64,
    /// Cadence for polling the bot's in-meeting status.
    pub poll_interval_seconds: u64,
    /// Retry budget for join requests and transcript fetches.
    pub max_retries: u32,
    /// Base delay for exponential backoff between retries.
    pub retry_backoff_base_seconds: u64,
    /// Per-request HTTP timeout.
    pub request_timeout_seconds: u64,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8056".to_string(),
            api_key: String::new(),
            name: "meetbot".to_string(),
            join_timeout_seconds: 600,
            poll_interval_seconds: 30,
            max_retries: 3,
            retry_backoff_base_seconds: 2,
            request_timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalendarConfig {
    /// Base URL of the calendar service.
    pub base_url: String,
    /// Bearer token for the calendar API.
    pub api_token: String,
    /// Calendar the standup events are created on.
    pub calendar_id: String,
    /// Per-request HTTP timeout.
    pub request_timeout_seconds: u64,
}

impl Default for CalendarConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8055".to_string(),
            api_token: String::new(),
            calendar_id: "primary".to_string(),
            request_timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// Destination the final transcript payload is POSTed to.
    pub url: String,
    /// Shared secret for HMAC-SHA256 payload signing. Empty disables
    /// signing; the payload is then sent without a signature header.
    pub secret: String,
    /// Per-attempt HTTP timeout.
    pub timeout_seconds: u64,
    /// Maximum delivery attempts before the session is marked exhausted.
    pub max_retries: u32,
    /// Base delay for exponential backoff between delivery attempts.
    pub retry_backoff_base_seconds: u64,
    /// Ceiling on the backoff delay.
    pub retry_backoff_cap_seconds: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            secret: String::new(),
            timeout_seconds: 30,
            max_retries: 3,
            retry_backoff_base_seconds: 2,
            retry_backoff_cap_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { port: 3790 }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;
        if !config_path.exists() {
            info!(
                "Config file not found, creating default at {:?}",
                config_path
            );
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let content =
            std::fs::read_to_string(&config_path).context("Failed to read config file")?;

        let config: Self = toml::from_str(&content).context("Failed to parse config file")?;

        info!("Loaded config from {:?}", config_path);
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(&config_path, content).context("Failed to write config file")?;

        Ok(())
    }

    /// Validate everything the service cannot run without. Called once at
    /// startup; failures here abort before any scheduling happens.
    pub fn validate(&self) -> Result<()> {
        if self.bot.api_key.is_empty() {
            bail!("bot.api_key is not configured");
        }
        if self.webhook.url.is_empty() {
            bail!("webhook.url is not configured");
        }
        reqwest::Url::parse(&self.webhook.url)
            .with_context(|| format!("webhook.url is not a valid URL: {}", self.webhook.url))?;
        if self.webhook.max_retries == 0 {
            bail!("webhook.max_retries must be at least 1");
        }
        if self.bot.poll_interval_seconds == 0 {
            bail!("bot.poll_interval_seconds must be at least 1");
        }
        self.standup_time()?;
        self.timezone()?;
        Ok(())
    }

    pub fn standup_time(&self) -> Result<NaiveTime> {
        NaiveTime::parse_from_str(&self.meeting.standup_time, "%H:%M").with_context(|| {
            format!(
                "meeting.standup_time is not a valid HH:MM time: {}",
                self.meeting.standup_time
            )
        })
    }

    pub fn timezone(&self) -> Result<Tz> {
        self.meeting
            .timezone
            .parse()
            .map_err(|_| anyhow::anyhow!("meeting.timezone is not a valid timezone: {}", self.meeting.timezone))
    }

    pub fn meeting_duration(&self) -> Duration {
        Duration::from_secs(self.meeting.duration_minutes * 60)
    }

    pub fn max_meeting_duration(&self) -> Duration {
        Duration::from_secs(self.meeting.max_meeting_duration_minutes * 60)
    }

    fn config_path() -> Result<PathBuf> {
        global::config_file()
    }
}
