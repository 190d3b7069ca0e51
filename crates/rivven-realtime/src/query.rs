//! Query pager
//!
//! Issues a query and lazily yields every matching row, following the
//! server's `nextRecordsUrl` continuation until `done`. Pages are fetched on
//! demand; rows already yielded stay valid if a later page fails, but the
//! stream ends with that error.

use crate::error::{ReplicationError, Result};
use crate::record::RawRow;
use crate::schema::Schema;
use crate::transport::AuthenticatedTransport;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Page size of the default full-table query.
pub const DEFAULT_PAGE_LIMIT: usize = 200;

/// One page of a query response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordsResponse {
    #[serde(default)]
    pub total_size: u64,
    pub done: bool,
    #[serde(default)]
    pub next_records_url: Option<String>,
    #[serde(default)]
    pub records: Vec<RawRow>,
}

/// Default full-table query for an entity, ordered for stable paging.
pub fn default_query(entity: &str) -> String {
    format!(
        "select fields(all) from {} order by CreatedDate asc nulls last limit {}",
        entity, DEFAULT_PAGE_LIMIT
    )
}

/// Default query for the given paging round (round 0 has no offset).
pub fn default_query_page(entity: &str, round: usize) -> String {
    if round == 0 {
        default_query(entity)
    } else {
        format!("{} offset {}", default_query(entity), round * DEFAULT_PAGE_LIMIT)
    }
}

/// Query re-fetching specific records by id.
pub fn records_by_id_query(entity: &str, ids: &[String]) -> String {
    let quoted = ids
        .iter()
        .map(|id| id.replace('\'', "\\'"))
        .collect::<Vec<_>>()
        .join("','");
    format!("select fields(all) from {} where id in ('{}')", entity, quoted)
}

/// Lazily pages through query results.
#[derive(Clone)]
pub struct QueryPager {
    transport: Arc<dyn AuthenticatedTransport>,
}

impl QueryPager {
    pub fn new(transport: Arc<dyn AuthenticatedTransport>) -> Self {
        Self { transport }
    }

    /// Stream every row of `query`, one page at a time.
    pub fn fetch(&self, query: &str) -> BoxStream<'static, Result<RawRow>> {
        let path = format!("/query?q={}", encode(query));
        Box::pin(pages(self.transport.clone(), path))
    }

    /// Stream the whole entity with the default query.
    ///
    /// The default query is capped at one page per request, so further
    /// rounds re-issue it with an offset. Rows are de-duplicated by `Id`.
    /// Paging stops once a round adds nothing new or the running count is
    /// no longer a multiple of the page size.
    pub fn fetch_default(&self, entity: &str) -> BoxStream<'static, Result<RawRow>> {
        Box::pin(default_rounds(self.clone(), entity.to_string()))
    }

    /// Stream the job's base query: the explicit one, else the default.
    pub fn fetch_schema(&self, schema: &Schema) -> BoxStream<'static, Result<RawRow>> {
        match schema.explicit_query() {
            Some(query) => self.fetch(query),
            None => self.fetch_default(&schema.id),
        }
    }
}

fn pages(
    transport: Arc<dyn AuthenticatedTransport>,
    path: String,
) -> impl Stream<Item = Result<RawRow>> + Send + 'static {
    async_stream::try_stream! {
        let prefix = transport.api_prefix();
        let mut next = Some(path);
        let mut page = 0usize;

        while let Some(path) = next.take() {
            let response: RecordsResponse = transport.get(&path).await?.json()?;
            page += 1;
            debug!(page, rows = response.records.len(), done = response.done, "Fetched query page");

            if !response.done {
                let url = response.next_records_url.ok_or_else(|| {
                    ReplicationError::query("response not done but has no nextRecordsUrl")
                })?;
                next = Some(url.strip_prefix(prefix.as_str()).unwrap_or(&url).to_string());
            }

            for row in response.records {
                yield row;
            }
        }
    }
}

fn default_rounds(
    pager: QueryPager,
    entity: String,
) -> impl Stream<Item = Result<RawRow>> + Send + 'static {
    async_stream::try_stream! {
        let mut seen: HashSet<String> = HashSet::new();
        let mut last_id: Option<String> = None;
        let mut count = 0usize;
        let mut round = 0usize;

        loop {
            let previous_last_id = last_id.clone();
            let mut rows = pager.fetch(&default_query_page(&entity, round));

            while let Some(row) = rows.next().await {
                let row = row?;
                let id = row_id(&row);
                if let Some(id) = &id {
                    if !seen.insert(id.clone()) {
                        continue;
                    }
                }
                last_id = id;
                count += 1;
                yield row;
            }

            round += 1;
            if last_id == previous_last_id || count % DEFAULT_PAGE_LIMIT != 0 {
                break;
            }
        }

        debug!(entity = %entity, rows = count, rounds = round, "Default query exhausted");
    }
}

fn row_id(row: &RawRow) -> Option<String> {
    row.get("Id").and_then(|v| match v {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Null => None,
        other => Some(other.to_string()),
    })
}

fn encode(query: &str) -> String {
    url::form_urlencoded::byte_serialize(query.as_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use futures::TryStreamExt;
    use serde_json::json;

    fn rows(n: usize) -> Vec<serde_json::Value> {
        (0..n).map(|i| json!({"Id": format!("{:03}", i), "Name": format!("Row {}", i)})).collect()
    }

    #[test]
    fn test_query_builders() {
        assert_eq!(
            default_query("Account"),
            "select fields(all) from Account order by CreatedDate asc nulls last limit 200"
        );
        assert_eq!(
            default_query_page("Account", 2),
            "select fields(all) from Account order by CreatedDate asc nulls last limit 200 offset 400"
        );
        assert_eq!(
            records_by_id_query("Account", &["001A".into(), "001B".into()]),
            "select fields(all) from Account where id in ('001A','001B')"
        );
    }

    #[tokio::test]
    async fn test_fetch_follows_cursors() {
        let transport = Arc::new(MemoryTransport::new().with_page_size(3).with_rows(rows(8)));
        let pager = QueryPager::new(transport.clone());

        let all: Vec<RawRow> = pager.fetch("select Id from Account").try_collect().await.unwrap();

        assert_eq!(all.len(), 8);
        assert_eq!(all[7]["Id"], json!("007"));
        assert_eq!(transport.requests().len(), 3);
    }

    #[tokio::test]
    async fn test_fetch_is_lazy() {
        let transport = Arc::new(MemoryTransport::new().with_page_size(2).with_rows(rows(10)));
        let pager = QueryPager::new(transport.clone());

        let mut stream = pager.fetch("select Id from Account");
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first["Id"], json!("000"));
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_page_failure_aborts_after_partial_rows() {
        let transport = Arc::new(MemoryTransport::new().with_page_size(2).with_rows(rows(5)));
        let pager = QueryPager::new(transport.clone());

        let mut stream = pager.fetch("select Id from Account");
        assert!(stream.next().await.unwrap().is_ok());
        assert!(stream.next().await.unwrap().is_ok());

        transport.fail_next(500);
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(matches!(err, ReplicationError::Transport { status: Some(500), .. }));
    }

    #[tokio::test]
    async fn test_fetch_default_pages_with_offset() {
        let transport = Arc::new(MemoryTransport::new().with_page_size(2000).with_rows(rows(450)));
        let pager = QueryPager::new(transport.clone());

        let all: Vec<RawRow> = pager.fetch_default("Account").try_collect().await.unwrap();

        assert_eq!(all.len(), 450);
        let requests = transport.requests();
        assert_eq!(requests.len(), 3);
        assert!(requests[2].contains("offset+400"));
    }

    #[tokio::test]
    async fn test_fetch_default_stops_on_exact_multiple() {
        let transport = Arc::new(MemoryTransport::new().with_rows(rows(400)));
        let pager = QueryPager::new(transport.clone());

        let all: Vec<RawRow> = pager.fetch_default("Account").try_collect().await.unwrap();

        // the third round returns nothing new, which ends paging
        assert_eq!(all.len(), 400);
        assert_eq!(transport.requests().len(), 3);
    }

    #[tokio::test]
    async fn test_fetch_schema_prefers_explicit_query() {
        let transport = Arc::new(MemoryTransport::new().with_rows(rows(3)));
        let pager = QueryPager::new(transport.clone());
        let schema = Schema::new("Account").with_query("select Id, Name from Account");

        let all: Vec<RawRow> = pager.fetch_schema(&schema).try_collect().await.unwrap();

        assert_eq!(all.len(), 3);
        assert!(transport.requests()[0].contains("select+Id%2C+Name"));
    }
}
