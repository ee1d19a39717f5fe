//! Signed webhook delivery of finished transcripts.
//!
//! The payload is serialized once and the same bytes are signed and sent on
//! every attempt, so a receiver verifying the signature over the raw body
//! always sees a matching pair. Delivery retries with exponential backoff
//! up to a configured budget; every attempt is recorded in the store and in
//! the delivery audit trail.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::{Database, SessionRepository};
use crate::retry::backoff_delay;
use crate::session::{DeliveryStatus, MeetingSession, SessionStore};

pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

type HmacSha256 = Hmac<Sha256>;

/// Body POSTed to the webhook destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptPayload {
    pub meeting_id: Uuid,
    pub meet_url: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub transcript: String,
    pub bot_name: String,
    pub status: String,
    /// When this payload was built, not when the meeting happened.
    pub timestamp: DateTime<Utc>,
}

impl TranscriptPayload {
    pub fn from_session(session: &MeetingSession, bot_name: &str) -> Self {
        Self {
            meeting_id: session.meeting_id,
            meet_url: session.meet_url.clone(),
            start_time: session.start_time,
            end_time: session.end_time,
            transcript: session.transcript.clone().unwrap_or_default(),
            bot_name: bot_name.to_string(),
            status: session.status.to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// `sha256=<hex>` signature over the exact payload bytes.
pub fn sign(secret: &str, payload: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC-SHA256 accepts any key length");
    mac.update(payload);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time verification of a received signature. Accepts the header
/// value with or without the `sha256=` prefix.
pub fn verify_signature(secret: &str, payload: &[u8], signature: &str) -> bool {
    let hex_digest = signature.strip_prefix("sha256=").unwrap_or(signature);
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}

/// Terminal outcome of one delivery run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The destination acknowledged with a 2xx.
    Delivered,
    /// The retry budget is spent.
    Exhausted,
    /// Shutdown was requested mid-backoff; the session stays deliverable.
    Interrupted,
}

pub struct WebhookDispatcher {
    client: reqwest::Client,
    url: String,
    secret: String,
    bot_name: String,
    max_retries: u32,
    backoff_base: Duration,
    backoff_cap: Duration,
    db: Database,
}

impl WebhookDispatcher {
    pub fn new(
        url: &str,
        secret: &str,
        bot_name: &str,
        timeout: Duration,
        max_retries: u32,
        backoff_base: Duration,
        backoff_cap: Duration,
        db: Database,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build webhook HTTP client")?;

        Ok(Self {
            client,
            url: url.to_string(),
            secret: secret.to_string(),
            bot_name: bot_name.to_string(),
            max_retries,
            backoff_base,
            backoff_cap,
            db,
        })
    }

    /// Deliver the session's transcript, retrying until success, budget
    /// exhaustion, or shutdown.
    pub async fn deliver(
        &self,
        store: &SessionStore,
        session: &MeetingSession,
        shutdown: &CancellationToken,
    ) -> Result<DeliveryOutcome> {
        let payload = TranscriptPayload::from_session(session, &self.bot_name);
        let body = serde_json::to_vec(&payload).context("Failed to serialize webhook payload")?;
        let signature = (!self.secret.is_empty()).then(|| sign(&self.secret, &body));
        let id = session.meeting_id;

        loop {
            let spent = store
                .get(id)
                .await
                .with_context(|| format!("Session {id} not in store"))?
                .delivery_attempts;
            if spent >= self.max_retries {
                // Budget was already spent in a previous run.
                self.finish(store, id, spent, DeliveryStatus::Exhausted)
                    .await?;
                return Ok(DeliveryOutcome::Exhausted);
            }

            let attempt = store.record_delivery_attempt(id).await?;

            match self.attempt_once(&body, signature.as_deref()).await {
                Ok(()) => {
                    info!(meeting_id = %id, attempt, "Webhook delivered");
                    self.record_attempt(id, attempt, true, "delivered")?;
                    self.finish(store, id, attempt, DeliveryStatus::Delivered)
                        .await?;
                    return Ok(DeliveryOutcome::Delivered);
                }
                Err(e) => {
                    warn!(meeting_id = %id, attempt, "Webhook delivery failed: {e:#}");
                    self.record_attempt(id, attempt, false, &format!("{e:#}"))?;

                    if attempt >= self.max_retries {
                        self.finish(store, id, attempt, DeliveryStatus::Exhausted)
                            .await?;
                        return Ok(DeliveryOutcome::Exhausted);
                    }

                    let delay = backoff_delay(self.backoff_base, attempt, self.backoff_cap);
                    tokio::select! {
                        _ = shutdown.cancelled() => return Ok(DeliveryOutcome::Interrupted),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn attempt_once(&self, body: &[u8], signature: Option<&str>) -> Result<()> {
        let mut request = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.to_vec());

        if let Some(signature) = signature {
            request = request.header(SIGNATURE_HEADER, signature);
        }

        let response = request.send().await.context("Failed to send webhook")?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Webhook rejected ({}): {}", status, body);
        }

        Ok(())
    }

    async fn finish(
        &self,
        store: &SessionStore,
        id: Uuid,
        attempts: u32,
        status: DeliveryStatus,
    ) -> Result<()> {
        store.set_delivery_status(id, status).await?;
        let conn = self.db.connect()?;
        SessionRepository::set_delivery(&conn, id, attempts, status)
    }

    fn record_attempt(&self, id: Uuid, attempt: u32, success: bool, detail: &str) -> Result<()> {
        let conn = self.db.connect()?;
        SessionRepository::record_delivery_attempt(&conn, id, attempt, success, detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionStatus;
    use axum::http::HeaderMap;
    use axum::routing::post;
    use axum::Router;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_signature_round_trip() {
        let body = br#"{"transcript":"Alice: shipped it"}"#;
        let signature = sign("topsecret", body);
        assert!(signature.starts_with("sha256="));
        assert!(verify_signature("topsecret", body, &signature));
    }

    #[test]
    fn test_signature_accepts_bare_hex() {
        let body = b"payload";
        let signature = sign("topsecret", body);
        let bare = signature.strip_prefix("sha256=").unwrap();
        assert!(verify_signature("topsecret", body, bare));
    }

    #[test]
    fn test_signature_rejects_wrong_secret() {
        let body = b"payload";
        let signature = sign("topsecret", body);
        assert!(!verify_signature("othersecret", body, &signature));
    }

    #[test]
    fn test_signature_rejects_tampered_body() {
        let signature = sign("topsecret", b"payload");
        assert!(!verify_signature("topsecret", b"payl0ad", &signature));
    }

    #[test]
    fn test_signature_rejects_garbage() {
        assert!(!verify_signature("topsecret", b"payload", "sha256=not-hex"));
        assert!(!verify_signature("topsecret", b"payload", ""));
    }

    #[test]
    fn test_payload_from_session() {
        let mut session = MeetingSession::new(
            "https://meet.example.com/abc".to_string(),
            "abc".to_string(),
            Utc::now(),
        );
        session.status = SessionStatus::Delivering;
        session.transcript = Some("Alice: shipped the parser".to_string());
        session.end_time = Some(Utc::now());

        let payload = TranscriptPayload::from_session(&session, "meetbot");
        assert_eq!(payload.meeting_id, session.meeting_id);
        assert_eq!(payload.transcript, "Alice: shipped the parser");
        assert_eq!(payload.bot_name, "meetbot");
        assert_eq!(payload.status, "delivering");
    }

    struct TestReceiver {
        addr: std::net::SocketAddr,
        hits: Arc<AtomicU32>,
    }

    async fn spawn_receiver(fail_first: u32) -> TestReceiver {
        let hits = Arc::new(AtomicU32::new(0));
        let counter = hits.clone();

        let app = Router::new().route(
            "/hook",
            post(move |headers: HeaderMap, body: axum::body::Bytes| {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    let signature = headers
                        .get(SIGNATURE_HEADER)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default();
                    assert!(verify_signature("topsecret", &body, signature));
                    if n <= fail_first {
                        axum::http::StatusCode::SERVICE_UNAVAILABLE
                    } else {
                        axum::http::StatusCode::OK
                    }
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        TestReceiver { addr, hits }
    }

    async fn test_fixture(dir: &TempDir) -> (SessionStore, MeetingSession, Database) {
        let db = Database::at(dir.path().join("test.db"));
        let store = SessionStore::default();
        let mut session = MeetingSession::new(
            "https://meet.example.com/abc".to_string(),
            "abc".to_string(),
            Utc::now(),
        );
        session.status = SessionStatus::Delivering;
        session.transcript = Some("Alice: shipped the parser".to_string());
        store.insert(session.clone()).await;
        let conn = db.connect().unwrap();
        SessionRepository::insert(&conn, &session).unwrap();
        (store, session, db)
    }

    fn dispatcher(url: String, db: Database) -> WebhookDispatcher {
        WebhookDispatcher::new(
            &url,
            "topsecret",
            "meetbot",
            Duration::from_secs(5),
            3,
            Duration::from_millis(10),
            Duration::from_millis(50),
            db,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_delivery_succeeds_first_attempt() {
        let dir = TempDir::new().unwrap();
        let receiver = spawn_receiver(0).await;
        let (store, session, db) = test_fixture(&dir).await;
        let dispatcher = dispatcher(format!("http://{}/hook", receiver.addr), db);

        let outcome = dispatcher
            .deliver(&store, &session, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, DeliveryOutcome::Delivered);
        assert_eq!(receiver.hits.load(Ordering::SeqCst), 1);
        let found = store.get(session.meeting_id).await.unwrap();
        assert_eq!(found.delivery_attempts, 1);
        assert_eq!(found.delivery_status, DeliveryStatus::Delivered);
    }

    #[tokio::test]
    async fn test_delivery_retries_then_succeeds() {
        let dir = TempDir::new().unwrap();
        let receiver = spawn_receiver(2).await;
        let (store, session, db) = test_fixture(&dir).await;
        let dispatcher = dispatcher(format!("http://{}/hook", receiver.addr), db.clone());

        let outcome = dispatcher
            .deliver(&store, &session, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, DeliveryOutcome::Delivered);
        assert_eq!(receiver.hits.load(Ordering::SeqCst), 3);
        let found = store.get(session.meeting_id).await.unwrap();
        assert_eq!(found.delivery_attempts, 3);

        let conn = db.connect().unwrap();
        assert_eq!(
            SessionRepository::count_delivery_attempts(&conn, session.meeting_id).unwrap(),
            3
        );
    }

    #[tokio::test]
    async fn test_delivery_exhausts_retry_budget() {
        let dir = TempDir::new().unwrap();
        let receiver = spawn_receiver(u32::MAX).await;
        let (store, session, db) = test_fixture(&dir).await;
        let dispatcher = dispatcher(format!("http://{}/hook", receiver.addr), db);

        let outcome = dispatcher
            .deliver(&store, &session, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, DeliveryOutcome::Exhausted);
        assert_eq!(receiver.hits.load(Ordering::SeqCst), 3);
        let found = store.get(session.meeting_id).await.unwrap();
        assert_eq!(found.delivery_attempts, 3);
        assert_eq!(found.delivery_status, DeliveryStatus::Exhausted);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_backoff() {
        let dir = TempDir::new().unwrap();
        let receiver = spawn_receiver(u32::MAX).await;
        let (store, session, db) = test_fixture(&dir).await;
        let dispatcher = WebhookDispatcher::new(
            &format!("http://{}/hook", receiver.addr),
            "topsecret",
            "meetbot",
            Duration::from_secs(5),
            3,
            Duration::from_secs(60),
            Duration::from_secs(60),
            db,
        )
        .unwrap();

        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let outcome = dispatcher
            .deliver(&store, &session, &shutdown)
            .await
            .unwrap();

        assert_eq!(outcome, DeliveryOutcome::Interrupted);
        assert_eq!(receiver.hits.load(Ordering::SeqCst), 1);
        // Still pending so a later run can resume.
        let found = store.get(session.meeting_id).await.unwrap();
        assert_eq!(found.delivery_status, DeliveryStatus::Pending);
    }

    #[tokio::test]
    async fn test_unsigned_when_secret_empty() {
        let dir = TempDir::new().unwrap();
        let hits = Arc::new(AtomicU32::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            "/hook",
            post(move |headers: HeaderMap| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    assert!(headers.get(SIGNATURE_HEADER).is_none());
                    axum::http::StatusCode::OK
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let (store, session, db) = test_fixture(&dir).await;
        let dispatcher = WebhookDispatcher::new(
            &format!("http://{addr}/hook"),
            "",
            "meetbot",
            Duration::from_secs(5),
            3,
            Duration::from_millis(10),
            Duration::from_millis(50),
            db,
        )
        .unwrap();

        let outcome = dispatcher
            .deliver(&store, &session, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, DeliveryOutcome::Delivered);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
