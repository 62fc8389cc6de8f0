//! Loading rows from the server into the local store.

use crate::changes::{ChangeLog, CHANGES_TABLE};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::http::HttpClient;
use crate::registry::ResourceRegistry;
use async_trait::async_trait;
use curio_storage::{Database, Transaction, TransactionOptions};
use curio_sync_protocol::{apply_mods, ChangeKind, FETCH_SOURCE};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Field stamped on every row loaded from the server.
pub const LAST_FETCH_FIELD: &str = "__last_fetch";

/// Loads rows from the server of record.
///
/// Implementations store what they load before returning it, so a caller
/// can always re-read the local store afterwards.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Loads one row. `None` if the server does not know it.
    async fn fetch_model(&self, table: &str, id: &Value) -> SyncResult<Option<Value>>;

    /// Loads every row matching `params`.
    async fn fetch_collection(&self, table: &str, params: &Value) -> SyncResult<Vec<Value>>;
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// True if `row` was never fetched or was fetched longer than `ttl` ago.
pub(crate) fn is_stale(row: &Value, ttl: Duration) -> bool {
    match row.get(LAST_FETCH_FIELD).and_then(Value::as_i64) {
        Some(fetched) => now_millis().saturating_sub(fetched) > ttl.as_millis() as i64,
        None => true,
    }
}

/// Fetcher talking to the REST endpoints under [`SyncConfig::resource_url`].
pub struct RemoteFetcher {
    client: Arc<dyn HttpClient>,
    db: Arc<Database>,
    registry: Arc<ResourceRegistry>,
    config: Arc<SyncConfig>,
}

impl RemoteFetcher {
    /// Creates a fetcher storing into `db`.
    pub fn new(
        client: Arc<dyn HttpClient>,
        db: Arc<Database>,
        registry: Arc<ResourceRegistry>,
        config: Arc<SyncConfig>,
    ) -> Self {
        Self {
            client,
            db,
            registry,
            config,
        }
    }

    /// Writes fetched rows, keeping local edits that have not synced yet.
    ///
    /// Returns the rows as stored. Rows with a pending delete stay absent
    /// and are left out.
    fn store(&self, table: &str, rows: Vec<Value>) -> SyncResult<Vec<Value>> {
        let id_field = self.registry.descriptor(table)?.id_field().to_string();
        let fetched_at = now_millis();
        let options = TransactionOptions::new()
            .with_tables([table, CHANGES_TABLE])
            .with_source(FETCH_SOURCE);
        let stored = self.db.transaction(options, |txn| -> SyncResult<Vec<Value>> {
            let mut stored = Vec::with_capacity(rows.len());
            for mut row in rows {
                let Some(id) = row.get(&id_field).cloned() else {
                    debug!(%table, "fetched row without id, skipping");
                    continue;
                };
                if !overlay_pending(txn, table, &id, &mut row)? {
                    continue;
                }
                if let Some(map) = row.as_object_mut() {
                    map.insert(LAST_FETCH_FIELD.into(), json!(fetched_at));
                }
                txn.put(table, row.clone())?;
                stored.push(row);
            }
            Ok(stored)
        })?;
        debug!(%table, count = stored.len(), "fetched rows stored");
        Ok(stored)
    }
}

/// Re-applies pending local updates for `(table, id)` onto `row`. Returns
/// false if a pending delete means the row must stay absent.
fn overlay_pending(txn: &Transaction<'_>, table: &str, id: &Value, row: &mut Value) -> SyncResult<bool> {
    for change in ChangeLog::pending_for_in(txn, table, id)? {
        match &change.kind {
            ChangeKind::Deleted { .. } => return Ok(false),
            ChangeKind::Updated { mods, .. } => apply_mods(row, mods),
            _ => {}
        }
    }
    Ok(true)
}

#[async_trait]
impl Fetcher for RemoteFetcher {
    async fn fetch_model(&self, table: &str, id: &Value) -> SyncResult<Option<Value>> {
        let id_text = match id {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let url = format!("{}{}/", self.config.resource_url(table), id_text);
        let response = self.client.get(&url, &json!({})).await?;
        if response.status == 404 {
            debug!(%table, id = %id_text, "row unknown to the server");
            return Ok(None);
        }
        let response = response.error_for_status(&url)?;
        if !response.data.is_object() {
            return Err(SyncError::transport_fatal(format!("{url} did not return an object")));
        }
        Ok(self.store(table, vec![response.data])?.into_iter().next())
    }

    async fn fetch_collection(&self, table: &str, params: &Value) -> SyncResult<Vec<Value>> {
        let url = self.config.resource_url(table);
        let response = self.client.get(&url, params).await?.error_for_status(&url)?;
        let rows = match response.data {
            Value::Array(rows) => rows,
            // Paginated endpoints wrap the page in `results`.
            Value::Object(mut page) => match page.remove("results") {
                Some(Value::Array(rows)) => rows,
                _ => Vec::new(),
            },
            _ => Vec::new(),
        };
        self.store(table, rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{HttpResponse, MockHttpClient};
    use crate::registry::CONTENTNODE;
    use curio_sync_protocol::ChangeBuilder;

    struct Fixture {
        http: Arc<MockHttpClient>,
        db: Arc<Database>,
        registry: Arc<ResourceRegistry>,
        fetcher: RemoteFetcher,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(ResourceRegistry::standard());
        let db = Arc::new(registry.open_in_memory().unwrap());
        let http = Arc::new(MockHttpClient::new());
        let config = Arc::new(SyncConfig::new("http://studio.test"));
        let fetcher = RemoteFetcher::new(http.clone(), db.clone(), registry.clone(), config);
        Fixture {
            http,
            db,
            registry,
            fetcher,
        }
    }

    #[tokio::test]
    async fn fetched_model_is_stamped_and_stored() {
        let fx = fixture();
        fx.http.respond(
            "GET",
            "http://studio.test/api/contentnode/n1/",
            HttpResponse::ok(json!({"id": "n1", "title": "server"})),
        );
        let row = fx.fetcher.fetch_model(CONTENTNODE, &json!("n1")).await.unwrap().unwrap();
        assert!(row.get(LAST_FETCH_FIELD).is_some());
        assert!(!is_stale(&row, Duration::from_secs(60)));
        let stored = fx.db.get(CONTENTNODE, &"n1".into()).unwrap().unwrap();
        assert_eq!(stored["title"], json!("server"));
    }

    #[tokio::test]
    async fn missing_model_is_none() {
        let fx = fixture();
        assert!(fx.fetcher.fetch_model(CONTENTNODE, &json!("nope")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pending_edits_survive_fetch() {
        let fx = fixture();
        let log = ChangeLog::new(fx.db.clone());
        let builder = ChangeBuilder::new(fx.registry.as_ref());
        log.save(
            &builder
                .updated(CONTENTNODE, json!("a"), json!({"id": "a", "title": "old"}), json!({"title": "mine"}))
                .unwrap(),
        )
        .unwrap();
        log.save(&builder.deleted(CONTENTNODE, json!("b"), None).unwrap()).unwrap();

        fx.http.respond(
            "GET",
            "http://studio.test/api/contentnode/",
            HttpResponse::ok(json!({"results": [
                {"id": "a", "title": "theirs", "lft": 1},
                {"id": "b", "title": "gone"}
            ]})),
        );
        let rows = fx
            .fetcher
            .fetch_collection(CONTENTNODE, &json!({"parent": "root"}))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["title"], json!("mine"));
        assert_eq!(rows[0]["lft"], json!(1));
        assert!(fx.db.get(CONTENTNODE, &"b".into()).unwrap().is_none());
        assert_eq!(fx.http.calls()[0].2, json!({"parent": "root"}));
    }

    #[test]
    fn rows_without_stamp_are_stale() {
        assert!(is_stale(&json!({"id": 1}), Duration::from_secs(300)));
        let old = json!({"id": 1, LAST_FETCH_FIELD: now_millis() - 10_000});
        assert!(is_stale(&old, Duration::from_secs(5)));
        assert!(!is_stale(&old, Duration::from_secs(60)));
    }
}
