use axum::http::{HeaderMap, StatusCode};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use tracing::{info, warn};

use crate::error::HttpFailure;
use crate::state::InMemoryDb;

type HmacSha256 = Hmac<Sha256>;

pub const TIMESTAMP_TOLERANCE_SECS: i64 = 5 * 60;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WebhookError {
    #[error("Webhook signing secret is not configured.")]
    NotConfigured,
    #[error("Error occurred -- no svix headers")]
    MissingHeaders,
    #[error("Webhook signing secret is malformed.")]
    InvalidSecret,
    #[error("No matching signature found.")]
    InvalidSignature,
    #[error("Message timestamp is invalid or outside the tolerance window.")]
    StaleTimestamp,
    #[error("Webhook payload could not be parsed: {0}")]
    InvalidPayload(String),
}

impl HttpFailure for WebhookError {
    fn status(&self) -> StatusCode {
        match self {
            WebhookError::NotConfigured | WebhookError::InvalidSecret => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            WebhookError::NotConfigured | WebhookError::InvalidSecret => "INTERNAL_ERROR",
            _ => "VALIDATION_ERROR",
        }
    }
}

pub struct SignedHeaders<'a> {
    pub id: &'a str,
    pub timestamp: &'a str,
    pub signature: &'a str,
}

impl<'a> SignedHeaders<'a> {
    pub fn from_headers(headers: &'a HeaderMap) -> Result<Self, WebhookError> {
        let get = |name: &str| {
            headers
                .get(name)
                .and_then(|h| h.to_str().ok())
                .filter(|v| !v.is_empty())
                .ok_or(WebhookError::MissingHeaders)
        };
        Ok(Self {
            id: get("svix-id")?,
            timestamp: get("svix-timestamp")?,
            signature: get("svix-signature")?,
        })
    }
}

fn signing_key(secret: &str) -> Result<Vec<u8>, WebhookError> {
    let encoded = secret.strip_prefix("whsec_").unwrap_or(secret);
    BASE64.decode(encoded).map_err(|_| WebhookError::InvalidSecret)
}

fn new_mac(key: &[u8], headers: &SignedHeaders<'_>, body: &[u8]) -> Result<HmacSha256, WebhookError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| WebhookError::InvalidSecret)?;
    mac.update(headers.id.as_bytes());
    mac.update(b".");
    mac.update(headers.timestamp.as_bytes());
    mac.update(b".");
    mac.update(body);
    Ok(mac)
}

/// Produces a `v1,<base64>` signature entry for the given message.
pub fn sign(secret: &str, id: &str, timestamp: &str, body: &[u8]) -> Result<String, WebhookError> {
    let key = signing_key(secret)?;
    let headers = SignedHeaders { id, timestamp, signature: "" };
    let mac = new_mac(&key, &headers, body)?;
    Ok(format!("v1,{}", BASE64.encode(mac.finalize().into_bytes())))
}

/// Checks the timestamp window and that at least one `v1` entry in the
/// space-separated signature header matches.
pub fn verify(secret: &str, headers: &SignedHeaders<'_>, body: &[u8], now_unix: i64) -> Result<(), WebhookError> {
    let ts: i64 = headers
        .timestamp
        .trim()
        .parse()
        .map_err(|_| WebhookError::StaleTimestamp)?;
    if (now_unix - ts).abs() > TIMESTAMP_TOLERANCE_SECS {
        return Err(WebhookError::StaleTimestamp);
    }

    let key = signing_key(secret)?;
    for entry in headers.signature.split_whitespace() {
        let Some(("v1", encoded)) = entry.split_once(',') else {
            continue;
        };
        let Ok(expected) = BASE64.decode(encoded) else {
            continue;
        };
        if new_mac(&key, headers, body)?.verify_slice(&expected).is_ok() {
            return Ok(());
        }
    }
    Err(WebhookError::InvalidSignature)
}

#[derive(Debug, Deserialize)]
pub struct WebhookEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: EventUser,
}

#[derive(Debug, Deserialize)]
pub struct EventUser {
    pub id: String,
    #[serde(default)]
    pub email_addresses: Vec<EmailAddress>,
}

#[derive(Debug, Deserialize)]
pub struct EmailAddress {
    pub email_address: String,
}

impl EventUser {
    fn primary_email(&self) -> Option<String> {
        self.email_addresses.first().map(|e| e.email_address.clone())
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WebhookAck {
    pub success: bool,
    pub message: String,
}

pub fn parse_event(body: &[u8]) -> Result<WebhookEvent, WebhookError> {
    serde_json::from_slice(body).map_err(|e| WebhookError::InvalidPayload(e.to_string()))
}

pub async fn apply_event(db: &InMemoryDb, event: &WebhookEvent, signup_credits: i64) -> WebhookAck {
    let user_id = event.data.id.as_str();
    match event.event_type.as_str() {
        "user.created" => {
            db.create_user(user_id, event.data.primary_email(), signup_credits).await;
            info!(%user_id, credits = signup_credits, "user created from webhook");
        }
        "user.updated" => {
            if !db.update_email(user_id, event.data.primary_email()).await {
                warn!(%user_id, "user.updated for unknown user");
            }
        }
        "user.deleted" => {
            if db.delete_user(user_id).await {
                info!(%user_id, "user deleted from webhook");
            } else {
                warn!(%user_id, "user.deleted for unknown user");
            }
        }
        other => info!(event_type = other, "webhook event ignored"),
    }
    WebhookAck {
        success: true,
        message: format!("Webhook {} processed.", event.event_type),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_MfKQ9r8GKYqrTwjUPD8ILPZIo2LaLaSw";

    fn headers<'a>(ts: &'a str, signature: &'a str) -> SignedHeaders<'a> {
        SignedHeaders { id: "msg_1", timestamp: ts, signature }
    }

    #[test]
    fn accepts_any_matching_v1_entry() {
        let body = br#"{"type":"user.created"}"#;
        let good = sign(SECRET, "msg_1", "1700000000", body).unwrap();
        let header = format!("v1,Zm9v {}", good);
        assert!(verify(SECRET, &headers("1700000000", &header), body, 1_700_000_100).is_ok());
    }

    #[test]
    fn rejects_tampered_body_and_old_timestamp() {
        let body = br#"{"type":"user.created"}"#;
        let sig = sign(SECRET, "msg_1", "1700000000", body).unwrap();
        assert_eq!(
            verify(SECRET, &headers("1700000000", &sig), b"{}", 1_700_000_000),
            Err(WebhookError::InvalidSignature)
        );
        assert_eq!(
            verify(SECRET, &headers("1700000000", &sig), body, 1_700_000_000 + 301),
            Err(WebhookError::StaleTimestamp)
        );
        assert_eq!(
            verify(SECRET, &headers("soon", &sig), body, 1_700_000_000),
            Err(WebhookError::StaleTimestamp)
        );
    }

    #[test]
    fn missing_header_is_reported() {
        let mut map = HeaderMap::new();
        map.insert("svix-id", "msg_1".parse().unwrap());
        assert_eq!(SignedHeaders::from_headers(&map).err(), Some(WebhookError::MissingHeaders));
    }

    #[tokio::test]
    async fn lifecycle_events_apply_to_the_store() {
        let db = InMemoryDb::new(None);
        let created = parse_event(
            br#"{"type":"user.created","data":{"id":"user_1","email_addresses":[{"email_address":"a@example.com"}]}}"#,
        )
        .unwrap();
        let ack = apply_event(&db, &created, 42).await;
        assert_eq!(ack.message, "Webhook user.created processed.");
        let user = db.find_user("user_1").await.unwrap();
        assert_eq!(user.balance, 42);
        assert_eq!(user.email.as_deref(), Some("a@example.com"));

        let deleted = parse_event(br#"{"type":"user.deleted","data":{"id":"user_1"}}"#).unwrap();
        apply_event(&db, &deleted, 42).await;
        assert!(db.find_user("user_1").await.is_none());
    }
}
