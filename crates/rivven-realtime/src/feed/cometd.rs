//! CometD (Bayeux 1.0) long-polling client over reqwest

use super::long_poll::{BayeuxMessage, BayeuxTransport, PollOutcome};
use crate::error::{ReplicationError, Result};
use crate::types::SensitiveString;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

/// Must exceed the server's long-poll hold time (110s).
const POLL_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetaReply {
    channel: String,
    #[serde(default)]
    successful: Option<bool>,
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    advice: Option<Advice>,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct Advice {
    #[serde(default)]
    reconnect: Option<String>,
}

/// Bayeux transport against `{instance_url}/cometd/{version}`.
pub struct CometdTransport {
    client: reqwest::Client,
    endpoint: String,
    access_token: SensitiveString,
    next_id: AtomicU64,
}

impl std::fmt::Debug for CometdTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CometdTransport")
            .field("endpoint", &self.endpoint)
            .field("access_token", &"[REDACTED]")
            .finish()
    }
}

impl CometdTransport {
    /// `api_version` may be given with or without the leading `v`.
    pub fn new(instance_url: &str, access_token: SensitiveString, api_version: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(POLL_TIMEOUT)
            .cookie_store(true)
            .build()
            .map_err(|e| ReplicationError::config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: cometd_endpoint(instance_url, api_version),
            access_token,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn message(&self, mut body: Value) -> Value {
        body["id"] = Value::String(self.next_id.fetch_add(1, Ordering::Relaxed).to_string());
        json!([body])
    }

    async fn exchange(&self, body: Value) -> Result<Vec<MetaReply>> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(self.access_token.expose_secret())
            .json(&self.message(body))
            .send()
            .await
            .map_err(|e| ReplicationError::feed(format!("cometd request failed: {}", e)))?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let text = response.text().await.unwrap_or_default();
            return Err(ReplicationError::transport(Some(status), text));
        }

        response
            .json::<Vec<MetaReply>>()
            .await
            .map_err(|e| ReplicationError::feed(format!("malformed cometd reply: {}", e)))
    }
}

fn cometd_endpoint(instance_url: &str, api_version: &str) -> String {
    format!(
        "{}/cometd/{}",
        instance_url.trim_end_matches('/'),
        api_version.trim_start_matches('v')
    )
}

fn meta_reply<'a>(replies: &'a [MetaReply], channel: &str) -> Result<&'a MetaReply> {
    replies
        .iter()
        .find(|r| r.channel == channel)
        .ok_or_else(|| ReplicationError::feed(format!("no {} reply", channel)))
}

fn ensure_successful(reply: &MetaReply) -> Result<()> {
    if reply.successful == Some(true) {
        Ok(())
    } else {
        Err(ReplicationError::feed(format!(
            "{} failed: {}",
            reply.channel,
            reply.error.as_deref().unwrap_or("unknown error")
        )))
    }
}

fn requires_handshake(reply: &MetaReply) -> bool {
    let advised = reply
        .advice
        .as_ref()
        .and_then(|a| a.reconnect.as_deref())
        == Some("handshake");
    let unknown_client = reply
        .error
        .as_deref()
        .is_some_and(|e| e.starts_with("403::") || e.starts_with("401::"));
    reply.successful == Some(false) && (advised || unknown_client)
}

/// Split a `/meta/connect` response into data messages, or report that the
/// session is gone.
fn poll_outcome(replies: Vec<MetaReply>) -> Result<PollOutcome> {
    if let Some(connect) = replies.iter().find(|r| r.channel == "/meta/connect") {
        if requires_handshake(connect) {
            return Ok(PollOutcome::Rehandshake);
        }
        ensure_successful(connect)?;
    }

    Ok(PollOutcome::Messages(
        replies
            .into_iter()
            .filter(|r| !r.channel.starts_with("/meta/"))
            .filter_map(|r| {
                r.data.map(|data| BayeuxMessage {
                    channel: r.channel,
                    data,
                })
            })
            .collect(),
    ))
}

#[async_trait]
impl BayeuxTransport for CometdTransport {
    async fn handshake(&self) -> Result<String> {
        let replies = self
            .exchange(json!({
                "channel": "/meta/handshake",
                "version": "1.0",
                "minimumVersion": "1.0",
                "supportedConnectionTypes": ["long-polling"],
            }))
            .await?;
        let reply = meta_reply(&replies, "/meta/handshake")?;
        ensure_successful(reply)?;
        let client_id = reply
            .client_id
            .clone()
            .ok_or_else(|| ReplicationError::feed("handshake reply has no clientId"))?;
        debug!(endpoint = %self.endpoint, "Bayeux handshake complete");
        Ok(client_id)
    }

    async fn subscribe(&self, client_id: &str, channel: &str) -> Result<()> {
        let replies = self
            .exchange(json!({
                "channel": "/meta/subscribe",
                "clientId": client_id,
                "subscription": channel,
            }))
            .await?;
        ensure_successful(meta_reply(&replies, "/meta/subscribe")?)
    }

    async fn poll(&self, client_id: &str) -> Result<PollOutcome> {
        let replies = self
            .exchange(json!({
                "channel": "/meta/connect",
                "clientId": client_id,
                "connectionType": "long-polling",
            }))
            .await?;
        poll_outcome(replies)
    }

    async fn disconnect(&self, client_id: &str) -> Result<()> {
        self.exchange(json!({
            "channel": "/meta/disconnect",
            "clientId": client_id,
        }))
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replies(value: Value) -> Vec<MetaReply> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_endpoint() {
        assert_eq!(
            cometd_endpoint("https://acme.my.salesforce.com/", "v52.0"),
            "https://acme.my.salesforce.com/cometd/52.0"
        );
        assert_eq!(cometd_endpoint("https://x", "58.0"), "https://x/cometd/58.0");
    }

    #[test]
    fn test_poll_outcome_extracts_data_messages() {
        let outcome = poll_outcome(replies(json!([
            {"channel": "/topic/AccountUpdates", "data": {"event": {"type": "created"}, "sobject": {"Id": "1"}}},
            {"channel": "/meta/connect", "successful": true, "clientId": "abc"}
        ])))
        .unwrap();

        match outcome {
            PollOutcome::Messages(messages) => {
                assert_eq!(messages.len(), 1);
                assert_eq!(messages[0].channel, "/topic/AccountUpdates");
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_poll_outcome_detects_lost_session() {
        let outcome = poll_outcome(replies(json!([
            {"channel": "/meta/connect", "successful": false, "error": "403::Unknown client",
             "advice": {"reconnect": "handshake"}}
        ])))
        .unwrap();
        assert_eq!(outcome, PollOutcome::Rehandshake);

        let err = poll_outcome(replies(json!([
            {"channel": "/meta/connect", "successful": false, "error": "500::internal"}
        ])))
        .unwrap_err();
        assert!(matches!(err, ReplicationError::Feed(_)));
    }

    #[test]
    fn test_debug_redacts_token() {
        let transport =
            CometdTransport::new("https://x", SensitiveString::new("tok-123"), "v52.0").unwrap();
        assert!(!format!("{:?}", transport).contains("tok-123"));
        assert_eq!(transport.endpoint(), "https://x/cometd/52.0");
    }
}
