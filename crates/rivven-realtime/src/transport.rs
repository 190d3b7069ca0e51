//! Authenticated access to the source REST API
//!
//! The engine only needs a single-attempt request capability with the
//! bearer token already attached. [`HttpTransport`] is the reqwest
//! implementation; [`MemoryTransport`] serves an in-memory table for tests
//! and local runs.

use crate::error::{ReplicationError, Result};
use crate::record::RawRow;
use crate::types::SensitiveString;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, warn};

/// Default REST API version.
pub const DEFAULT_API_VERSION: &str = "v52.0";

/// Cap on how much of an error body ends up in error messages.
const MAX_ERROR_BODY_BYTES: usize = 2048;

/// Successful API response.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Bytes,
}

impl TransportResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// Single-attempt request capability with bearer-token injection.
///
/// Paths are relative to the versioned data API root
/// (e.g. `/query?q=...`). Implementations return `Err` for any non-success
/// status; there are no internal retries.
#[async_trait]
pub trait AuthenticatedTransport: Send + Sync {
    async fn get(&self, path: &str) -> Result<TransportResponse>;

    async fn post(&self, path: &str, body: &Value) -> Result<TransportResponse>;

    async fn patch(&self, path: &str, body: &Value) -> Result<TransportResponse>;

    async fn delete(&self, path: &str) -> Result<TransportResponse>;

    /// Absolute prefix the server puts in front of relative paths, used to
    /// turn continuation URLs back into relative paths.
    fn api_prefix(&self) -> String {
        format!("/services/data/{}", DEFAULT_API_VERSION)
    }
}

/// reqwest-backed transport.
pub struct HttpTransport {
    client: reqwest::Client,
    instance_url: String,
    api_version: String,
    access_token: SensitiveString,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("instance_url", &self.instance_url)
            .field("api_version", &self.api_version)
            .field("access_token", &"[REDACTED]")
            .finish()
    }
}

impl HttpTransport {
    pub fn new(
        instance_url: impl Into<String>,
        access_token: SensitiveString,
        api_version: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let instance_url = instance_url.into().trim_end_matches('/').to_string();
        if !instance_url.starts_with("https://") && !instance_url.starts_with("http://") {
            return Err(ReplicationError::config(format!(
                "instance_url must start with http:// or https://, got: {}",
                instance_url
            )));
        }
        if access_token.is_empty() {
            return Err(ReplicationError::config("access_token must not be empty"));
        }
        if instance_url.starts_with("http://")
            && !instance_url.contains("localhost")
            && !instance_url.contains("127.0.0.1")
        {
            warn!("instance_url uses plain HTTP, the access token will be sent in cleartext");
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ReplicationError::config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            instance_url,
            api_version: api_version.into(),
            access_token,
        })
    }

    pub fn instance_url(&self) -> &str {
        &self.instance_url
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}{}{}", self.instance_url, self.api_prefix(), path)
        }
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<TransportResponse> {
        let response = builder
            .bearer_auth(self.access_token.expose_secret())
            .send()
            .await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?;

        if !(200..300).contains(&status) {
            let end = body.len().min(MAX_ERROR_BODY_BYTES);
            let message = String::from_utf8_lossy(&body[..end]).to_string();
            return Err(ReplicationError::transport(Some(status), message));
        }

        Ok(TransportResponse { status, body })
    }
}

#[async_trait]
impl AuthenticatedTransport for HttpTransport {
    async fn get(&self, path: &str) -> Result<TransportResponse> {
        let url = self.url(path);
        debug!(url = %url, "GET");
        self.send(self.client.get(url)).await
    }

    async fn post(&self, path: &str, body: &Value) -> Result<TransportResponse> {
        let url = self.url(path);
        debug!(url = %url, "POST");
        self.send(self.client.post(url).json(body)).await
    }

    async fn patch(&self, path: &str, body: &Value) -> Result<TransportResponse> {
        let url = self.url(path);
        debug!(url = %url, "PATCH");
        self.send(self.client.patch(url).json(body)).await
    }

    async fn delete(&self, path: &str) -> Result<TransportResponse> {
        let url = self.url(path);
        debug!(url = %url, "DELETE");
        self.send(self.client.delete(url)).await
    }

    fn api_prefix(&self) -> String {
        format!("/services/data/{}", self.api_version)
    }
}

/// In-memory source table answering the queries the engine issues.
///
/// Understands the full-table query (with `limit`/`offset`), the by-id
/// re-fetch query and arbitrary explicit queries (treated as full-table).
/// Results are split into pages of `page_size` rows linked by
/// `nextRecordsUrl`, the way the real API does.
pub struct MemoryTransport {
    rows: Mutex<Vec<RawRow>>,
    page_size: usize,
    failures: Mutex<VecDeque<u16>>,
    requests: Mutex<Vec<String>>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(Vec::new()),
            page_size: 2000,
            failures: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_rows(self, rows: Vec<Value>) -> Self {
        self.set_rows(rows);
        self
    }

    /// Replace the whole table.
    pub fn set_rows(&self, rows: Vec<Value>) {
        *self.rows.lock() = rows
            .into_iter()
            .filter_map(|v| v.as_object().cloned())
            .collect();
    }

    /// Insert or replace a row by `Id`.
    pub fn upsert_row(&self, row: Value) {
        let Some(row) = row.as_object().cloned() else {
            return;
        };
        let mut rows = self.rows.lock();
        match rows.iter_mut().find(|r| r.get("Id") == row.get("Id")) {
            Some(existing) => *existing = row,
            None => rows.push(row),
        }
    }

    pub fn remove_row(&self, id: &str) {
        self.rows
            .lock()
            .retain(|r| r.get("Id").and_then(|v| v.as_str()) != Some(id));
    }

    /// Make the next request fail with the given HTTP status.
    pub fn fail_next(&self, status: u16) {
        self.failures.lock().push_back(status);
    }

    /// Paths requested so far.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }

    fn answer_query(&self, soql: &str) -> Vec<RawRow> {
        let rows = self.rows.lock();
        let lower = soql.to_ascii_lowercase();

        if let Some(start) = lower.find(" where id in (") {
            let list = &soql[start + " where id in (".len()..];
            let list = list.split(')').next().unwrap_or_default();
            let ids: Vec<&str> = list
                .split(',')
                .map(|s| s.trim().trim_matches('\''))
                .collect();
            return rows
                .iter()
                .filter(|r| {
                    r.get("Id")
                        .and_then(|v| v.as_str())
                        .is_some_and(|id| ids.contains(&id))
                })
                .cloned()
                .collect();
        }

        let offset = clause_value(&lower, " offset ").unwrap_or(0);
        let limit = clause_value(&lower, " limit ").unwrap_or(usize::MAX);
        rows.iter().skip(offset).take(limit).cloned().collect()
    }

    fn page(&self, rows: &[RawRow], start: usize, query_id: &str) -> Value {
        let end = (start + self.page_size).min(rows.len());
        let done = end >= rows.len();
        let mut body = json!({
            "totalSize": rows.len(),
            "done": done,
            "records": rows[start..end].to_vec(),
        });
        if !done {
            body["nextRecordsUrl"] = Value::String(format!(
                "{}/query/{}-{}",
                self.api_prefix(),
                query_id,
                end
            ));
        }
        body
    }
}

fn clause_value(lower_soql: &str, clause: &str) -> Option<usize> {
    let start = lower_soql.find(clause)? + clause.len();
    lower_soql[start..].split_whitespace().next()?.parse().ok()
}

#[async_trait]
impl AuthenticatedTransport for MemoryTransport {
    async fn get(&self, path: &str) -> Result<TransportResponse> {
        self.requests.lock().push(path.to_string());
        if let Some(status) = self.failures.lock().pop_front() {
            return Err(ReplicationError::transport(Some(status), "injected failure"));
        }

        if let Some(encoded) = path.strip_prefix("/query?q=") {
            let soql = url::form_urlencoded::parse(format!("q={}", encoded).as_bytes())
                .find(|(k, _)| k == "q")
                .map(|(_, v)| v.into_owned())
                .unwrap_or_default();
            let rows = self.answer_query(&soql);
            let query_id = hex::encode(soql.as_bytes());
            let body = self.page(&rows, 0, &query_id);
            return Ok(TransportResponse::new(200, serde_json::to_vec(&body)?));
        }

        if let Some(cursor) = path.strip_prefix("/query/") {
            let (query_id, start) = cursor
                .rsplit_once('-')
                .ok_or_else(|| ReplicationError::transport(Some(400), "bad cursor"))?;
            let start: usize = start
                .parse()
                .map_err(|_| ReplicationError::transport(Some(400), "bad cursor offset"))?;
            let soql = hex::decode(query_id)
                .ok()
                .and_then(|b| String::from_utf8(b).ok())
                .ok_or_else(|| ReplicationError::transport(Some(400), "bad cursor id"))?;
            let rows = self.answer_query(&soql);
            let body = self.page(&rows, start.min(rows.len()), query_id);
            return Ok(TransportResponse::new(200, serde_json::to_vec(&body)?));
        }

        Err(ReplicationError::transport(Some(404), format!("no route for {}", path)))
    }

    async fn post(&self, path: &str, _body: &Value) -> Result<TransportResponse> {
        self.requests.lock().push(path.to_string());
        Ok(TransportResponse::new(201, Bytes::new()))
    }

    async fn patch(&self, path: &str, _body: &Value) -> Result<TransportResponse> {
        self.requests.lock().push(path.to_string());
        Ok(TransportResponse::new(204, Bytes::new()))
    }

    async fn delete(&self, path: &str) -> Result<TransportResponse> {
        self.requests.lock().push(path.to_string());
        Ok(TransportResponse::new(204, Bytes::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(soql: &str) -> String {
        url::form_urlencoded::byte_serialize(soql.as_bytes()).collect()
    }

    #[test]
    fn test_http_transport_rejects_bad_config() {
        let err = HttpTransport::new(
            "ftp://example.com",
            SensitiveString::new("token"),
            DEFAULT_API_VERSION,
            Duration::from_secs(30),
        )
        .unwrap_err();
        assert!(matches!(err, ReplicationError::Config(_)));

        let err = HttpTransport::new(
            "https://example.my.salesforce.com",
            SensitiveString::new(""),
            DEFAULT_API_VERSION,
            Duration::from_secs(30),
        )
        .unwrap_err();
        assert!(matches!(err, ReplicationError::Config(_)));
    }

    #[test]
    fn test_http_transport_urls() {
        let transport = HttpTransport::new(
            "https://example.my.salesforce.com/",
            SensitiveString::new("token"),
            "v58.0",
            Duration::from_secs(30),
        )
        .unwrap();

        assert_eq!(transport.api_prefix(), "/services/data/v58.0");
        assert_eq!(
            transport.url("/query?q=x"),
            "https://example.my.salesforce.com/services/data/v58.0/query?q=x"
        );
        assert!(!format!("{:?}", transport).contains("token\""));
    }

    #[tokio::test]
    async fn test_memory_transport_pages() {
        let transport = MemoryTransport::new().with_page_size(2).with_rows(vec![
            json!({"Id": "1"}),
            json!({"Id": "2"}),
            json!({"Id": "3"}),
        ]);

        let first: Value = transport
            .get(&format!("/query?q={}", encode("select Id from Account")))
            .await
            .unwrap()
            .json()
            .unwrap();
        assert_eq!(first["done"], json!(false));
        assert_eq!(first["records"].as_array().unwrap().len(), 2);

        let next = first["nextRecordsUrl"].as_str().unwrap();
        let relative = next.strip_prefix(&transport.api_prefix()).unwrap();
        let second: Value = transport.get(relative).await.unwrap().json().unwrap();
        assert_eq!(second["done"], json!(true));
        assert_eq!(second["records"][0]["Id"], json!("3"));
    }

    #[tokio::test]
    async fn test_memory_transport_id_filter_and_failures() {
        let transport = MemoryTransport::new().with_rows(vec![
            json!({"Id": "a"}),
            json!({"Id": "b"}),
            json!({"Id": "c"}),
        ]);

        let soql = "select fields(all) from Account where id in ('a','c')";
        let body: Value = transport
            .get(&format!("/query?q={}", encode(soql)))
            .await
            .unwrap()
            .json()
            .unwrap();
        assert_eq!(body["totalSize"], json!(2));

        transport.fail_next(401);
        let err = transport.get("/query?q=x").await.unwrap_err();
        assert!(matches!(err, ReplicationError::Transport { status: Some(401), .. }));
        assert_eq!(transport.requests().len(), 2);
    }
}
