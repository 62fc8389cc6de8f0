//! HTTP transport implementation.
//!
//! The actual HTTP client is abstracted via [`HttpClient`] so any library
//! (reqwest, hyper, a browser fetch bridge) can carry the requests.

use crate::error::{SyncError, SyncResult};
use crate::transport::SyncTransport;
use async_trait::async_trait;
use curio_sync_protocol::SyncResponse;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// A response with a decoded JSON body.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Decoded body.
    pub data: Value,
}

impl HttpResponse {
    /// A 200 response.
    pub fn ok(data: Value) -> Self {
        Self { status: 200, data }
    }

    /// A 404 response.
    pub fn not_found() -> Self {
        Self {
            status: 404,
            data: Value::Null,
        }
    }

    /// True for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Turns error statuses into errors: 5xx are retryable server errors,
    /// other failures are fatal.
    pub fn error_for_status(self, url: &str) -> SyncResult<Self> {
        match self.status {
            200..=299 => Ok(self),
            500..=599 => Err(SyncError::ServerError(format!("{url} answered {}", self.status))),
            status => Err(SyncError::transport_fatal(format!("{url} answered {status}"))),
        }
    }
}

/// HTTP client abstraction.
///
/// Network failures are reported as [`SyncError::Transport`]; any response
/// the server sent, including error statuses, is returned as `Ok`.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends a GET request with query parameters.
    async fn get(&self, url: &str, params: &Value) -> SyncResult<HttpResponse>;

    /// Sends a POST request with a JSON body.
    async fn post(&self, url: &str, body: &Value) -> SyncResult<HttpResponse>;

    /// Sends a PUT request with a JSON body.
    async fn put(&self, url: &str, body: &Value) -> SyncResult<HttpResponse>;

    /// Sends a PATCH request with a JSON body.
    async fn patch(&self, url: &str, body: &Value) -> SyncResult<HttpResponse>;

    /// Sends a DELETE request.
    async fn delete(&self, url: &str) -> SyncResult<HttpResponse>;
}

#[async_trait]
impl<C: HttpClient + ?Sized> HttpClient for Arc<C> {
    async fn get(&self, url: &str, params: &Value) -> SyncResult<HttpResponse> {
        (**self).get(url, params).await
    }

    async fn post(&self, url: &str, body: &Value) -> SyncResult<HttpResponse> {
        (**self).post(url, body).await
    }

    async fn put(&self, url: &str, body: &Value) -> SyncResult<HttpResponse> {
        (**self).put(url, body).await
    }

    async fn patch(&self, url: &str, body: &Value) -> SyncResult<HttpResponse> {
        (**self).patch(url, body).await
    }

    async fn delete(&self, url: &str) -> SyncResult<HttpResponse> {
        (**self).delete(url).await
    }
}

/// HTTP-based sync transport posting the change batch as a JSON array.
pub struct HttpTransport<C: HttpClient> {
    sync_url: String,
    client: C,
    last_error: RwLock<Option<String>>,
}

impl<C: HttpClient> HttpTransport<C> {
    /// Creates a transport posting to `sync_url`.
    pub fn new(sync_url: impl Into<String>, client: C) -> Self {
        Self {
            sync_url: sync_url.into(),
            client,
            last_error: RwLock::new(None),
        }
    }

    /// The sync endpoint.
    pub fn sync_url(&self) -> &str {
        &self.sync_url
    }

    /// The underlying client.
    pub fn client(&self) -> &C {
        &self.client
    }

    /// Message of the last failed request.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }
}

#[async_trait]
impl<C: HttpClient> SyncTransport for HttpTransport<C> {
    async fn sync(&self, changes: Vec<Value>) -> SyncResult<SyncResponse> {
        let body = Value::Array(changes);
        let outcome = match self.client.post(&self.sync_url, &body).await {
            Ok(response) => response.error_for_status(&self.sync_url),
            Err(e) => Err(e),
        };
        match outcome {
            Ok(response) => {
                *self.last_error.write() = None;
                debug!(status = response.status, "sync response received");
                if response.data.is_null() {
                    return Ok(SyncResponse::default());
                }
                Ok(serde_json::from_value(response.data)?)
            }
            Err(e) => {
                *self.last_error.write() = Some(e.to_string());
                Err(e)
            }
        }
    }
}

/// A scripted HTTP client for testing.
///
/// Responses are served per `(method, url)` in the order they were queued;
/// requests without a queued response get a 404.
#[derive(Debug, Default)]
pub struct MockHttpClient {
    routes: Mutex<HashMap<(String, String), VecDeque<HttpResponse>>>,
    calls: Mutex<Vec<(String, String, Value)>>,
    offline: AtomicBool,
}

impl MockHttpClient {
    /// Creates a client with no routes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a response for `method` on `url`.
    pub fn respond(&self, method: &str, url: &str, response: HttpResponse) {
        self.routes
            .lock()
            .entry((method.to_uppercase(), url.to_string()))
            .or_default()
            .push_back(response);
    }

    /// Makes every request fail as if the network were down.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Requests seen so far as `(method, url, body or params)`.
    pub fn calls(&self) -> Vec<(String, String, Value)> {
        self.calls.lock().clone()
    }

    fn serve(&self, method: &str, url: &str, payload: &Value) -> SyncResult<HttpResponse> {
        self.calls
            .lock()
            .push((method.to_string(), url.to_string(), payload.clone()));
        if self.offline.load(Ordering::SeqCst) {
            return Err(SyncError::transport_retryable("network unreachable"));
        }
        Ok(self
            .routes
            .lock()
            .get_mut(&(method.to_string(), url.to_string()))
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(HttpResponse::not_found))
    }
}

#[async_trait]
impl HttpClient for MockHttpClient {
    async fn get(&self, url: &str, params: &Value) -> SyncResult<HttpResponse> {
        self.serve("GET", url, params)
    }

    async fn post(&self, url: &str, body: &Value) -> SyncResult<HttpResponse> {
        self.serve("POST", url, body)
    }

    async fn put(&self, url: &str, body: &Value) -> SyncResult<HttpResponse> {
        self.serve("PUT", url, body)
    }

    async fn patch(&self, url: &str, body: &Value) -> SyncResult<HttpResponse> {
        self.serve("PATCH", url, body)
    }

    async fn delete(&self, url: &str) -> SyncResult<HttpResponse> {
        self.serve("DELETE", url, &Value::Null)
    }
}
