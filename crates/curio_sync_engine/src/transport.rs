//! Transport layer abstraction for sync operations.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use curio_sync_protocol::SyncResponse;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

/// A sync transport carries one change batch to the server and brings back
/// its verdict.
///
/// This trait abstracts the network layer, allowing for different
/// implementations (HTTP, mock for testing, etc.).
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Posts a batch of wire-format changes.
    async fn sync(&self, changes: Vec<Value>) -> SyncResult<SyncResponse>;
}

/// A mock transport for testing.
///
/// Records every batch and answers with queued responses; once the queue is
/// empty it answers with an empty response.
#[derive(Debug)]
pub struct MockTransport {
    connected: AtomicBool,
    requests: Mutex<Vec<Vec<Value>>>,
    responses: Mutex<VecDeque<SyncResponse>>,
}

impl MockTransport {
    /// Creates a new mock transport.
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            requests: Mutex::new(Vec::new()),
            responses: Mutex::new(VecDeque::new()),
        }
    }

    /// Queues the response to the next request.
    pub fn push_response(&self, response: SyncResponse) {
        self.responses.lock().push_back(response);
    }

    /// Sets the connected state. Requests fail while disconnected.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Batches received so far.
    pub fn requests(&self) -> Vec<Vec<Value>> {
        self.requests.lock().clone()
    }

    /// Number of batches received so far.
    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SyncTransport for MockTransport {
    async fn sync(&self, changes: Vec<Value>) -> SyncResult<SyncResponse> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(SyncError::transport_retryable("not connected to server"));
        }
        self.requests.lock().push(changes);
        Ok(self.responses.lock().pop_front().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use curio_sync_protocol::RevRef;
    use serde_json::json;

    #[tokio::test]
    async fn mock_transport_serves_queue_in_order() {
        let transport = MockTransport::new();
        transport.push_response(SyncResponse {
            disallowed: vec![RevRef { rev: 1 }],
            ..SyncResponse::default()
        });

        let first = transport.sync(vec![json!({"rev": 1})]).await.unwrap();
        assert_eq!(first.disallowed.len(), 1);
        let second = transport.sync(vec![]).await.unwrap();
        assert!(second.is_empty());
        assert_eq!(transport.request_count(), 2);
    }

    #[tokio::test]
    async fn mock_transport_connection() {
        let transport = MockTransport::new();
        transport.set_connected(false);
        let err = transport.sync(vec![json!({})]).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(transport.request_count(), 0);
    }
}
