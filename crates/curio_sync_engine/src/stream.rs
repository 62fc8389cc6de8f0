//! Change dispatch with per-table write lanes.

use crate::error::SyncResult;
use async_trait::async_trait;
use curio_sync_protocol::{Change, ChangeType};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Receives changes to apply, one hook per change type.
///
/// Hooks default to doing nothing, so a dispatcher only implements the
/// types it cares about.
#[async_trait]
pub trait ChangeDispatcher: Send + Sync {
    /// Applies a created change.
    async fn apply_created(&self, _change: &Change) -> SyncResult<Option<Value>> {
        Ok(None)
    }

    /// Applies an updated change.
    async fn apply_updated(&self, _change: &Change) -> SyncResult<Option<Value>> {
        Ok(None)
    }

    /// Applies a deleted change.
    async fn apply_deleted(&self, _change: &Change) -> SyncResult<Option<Value>> {
        Ok(None)
    }

    /// Applies a moved change.
    async fn apply_moved(&self, _change: &Change) -> SyncResult<Option<Value>> {
        Ok(None)
    }

    /// Applies a copied change.
    async fn apply_copied(&self, _change: &Change) -> SyncResult<Option<Value>> {
        Ok(None)
    }

    /// Applies a published change.
    async fn apply_published(&self, _change: &Change) -> SyncResult<Option<Value>> {
        Ok(None)
    }

    /// Routes `change` to its hook. Types without a hook are skipped.
    async fn apply(&self, change: &Change) -> SyncResult<Option<Value>> {
        match change.change_type() {
            ChangeType::Created => self.apply_created(change).await,
            ChangeType::Updated => self.apply_updated(change).await,
            ChangeType::Deleted => self.apply_deleted(change).await,
            ChangeType::Moved => self.apply_moved(change).await,
            ChangeType::Copied => self.apply_copied(change).await,
            ChangeType::Published => self.apply_published(change).await,
            other => {
                debug!(change_type = ?other, "no apply hook, skipping");
                Ok(None)
            }
        }
    }
}

/// Serializes writes per table and fans each one out to every dispatcher.
///
/// Queueing discipline: at most one outstanding write per table, and a
/// write completes only once every dispatcher finished with it. This
/// contract is inferred from how the stream is driven rather than
/// documented anywhere; applying changes in order through a single
/// [`crate::StoreDispatcher`] is already correct without it.
pub struct ChangeStream {
    dispatchers: Vec<Arc<dyn ChangeDispatcher>>,
    lanes: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ChangeStream {
    /// Creates a stream over a fixed set of dispatchers.
    pub fn new(dispatchers: Vec<Arc<dyn ChangeDispatcher>>) -> Self {
        Self {
            dispatchers,
            lanes: Mutex::new(HashMap::new()),
        }
    }

    /// Number of dispatchers.
    pub fn dispatcher_count(&self) -> usize {
        self.dispatchers.len()
    }

    fn lane(&self, table: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.lanes
            .lock()
            .entry(table.to_string())
            .or_default()
            .clone()
    }

    /// Writes `change` through every dispatcher.
    ///
    /// Returns the first non-null result. Waits for earlier writes to the
    /// same table; writes to other tables proceed independently.
    pub async fn write(&self, change: &Change) -> SyncResult<Option<Value>> {
        let lane = self.lane(&change.table);
        let _turn = lane.lock().await;
        let mut result = None;
        for dispatcher in &self.dispatchers {
            let applied = dispatcher.apply(change).await?;
            if result.is_none() {
                result = applied;
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use curio_sync_protocol::ChangeBuilder;
    use serde_json::json;
    use std::time::Duration;

    /// Records the order in which hooks run.
    struct Recorder {
        name: &'static str,
        delay: Duration,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl ChangeDispatcher for Recorder {
        async fn apply_created(&self, change: &Change) -> SyncResult<Option<Value>> {
            self.log.lock().push(format!("{}:start:{}", self.name, change.key));
            tokio::time::sleep(self.delay).await;
            self.log.lock().push(format!("{}:end:{}", self.name, change.key));
            Ok(Some(json!(self.name)))
        }
    }

    fn created(table: &str, key: &str) -> Change {
        let tables = ["a", "b"];
        ChangeBuilder::new(&tables)
            .created(table, json!(key), json!({"id": key}))
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn same_table_writes_do_not_overlap() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let stream = Arc::new(ChangeStream::new(vec![Arc::new(Recorder {
            name: "d",
            delay: Duration::from_millis(10),
            log: log.clone(),
        })]));

        let first = {
            let stream = stream.clone();
            tokio::spawn(async move { stream.write(&created("a", "1")).await })
        };
        let second = {
            let stream = stream.clone();
            tokio::spawn(async move { stream.write(&created("a", "2")).await })
        };
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        let log = log.lock().clone();
        assert_eq!(log, vec!["d:start:\"1\"", "d:end:\"1\"", "d:start:\"2\"", "d:end:\"2\""]);
    }

    #[tokio::test(start_paused = true)]
    async fn write_waits_for_every_dispatcher() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let fast: Arc<dyn ChangeDispatcher> = Arc::new(Recorder {
            name: "fast",
            delay: Duration::from_millis(1),
            log: log.clone(),
        });
        let slow: Arc<dyn ChangeDispatcher> = Arc::new(Recorder {
            name: "slow",
            delay: Duration::from_millis(50),
            log: log.clone(),
        });
        let stream = ChangeStream::new(vec![fast, slow]);

        let result = stream.write(&created("b", "x")).await.unwrap();
        assert_eq!(result, Some(json!("fast")));
        assert_eq!(log.lock().last().map(String::as_str), Some("slow:end:\"x\""));
    }

    #[tokio::test]
    async fn unhandled_types_are_skipped() {
        let stream = ChangeStream::new(vec![Arc::new(Recorder {
            name: "d",
            delay: Duration::ZERO,
            log: Arc::new(Mutex::new(Vec::new())),
        })]);
        let tables = ["a"];
        let deployed = ChangeBuilder::new(&tables).deployed("a", json!("c1")).unwrap();
        assert_eq!(stream.write(&deployed).await.unwrap(), None);
    }
}
