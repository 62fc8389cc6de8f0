//! Cross-tab coordination.
//!
//! Several engine instances ("tabs") share one store and one [`TabBus`].
//! At most one of them holds the fetcher role: it performs network fetches
//! and sync cycles, and answers fetch requests broadcast by the others.

use crate::error::{SyncError, SyncResult};
use crate::fetch::Fetcher;
use async_trait::async_trait;
use curio_sync_protocol::{ResponseStatus, TabMessage};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};
use uuid::Uuid;

const BUS_CAPACITY: usize = 256;

/// A message on the bus with the id of the tab that sent it.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Client id of the sender.
    pub sender: String,
    /// The message.
    pub message: TabMessage,
}

/// Broadcast medium shared by every tab, plus the fetcher-role slot.
#[derive(Clone)]
pub struct TabBus {
    tx: broadcast::Sender<Envelope>,
    leader: Arc<Mutex<Option<String>>>,
}

impl TabBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            tx,
            leader: Arc::new(Mutex::new(None)),
        }
    }

    /// Client id of the tab holding the fetcher role.
    pub fn leader(&self) -> Option<String> {
        self.leader.lock().clone()
    }

    /// Takes the fetcher role if nobody holds it. Returns true if
    /// `client_id` holds it afterwards.
    pub fn try_claim(&self, client_id: &str) -> bool {
        let mut leader = self.leader.lock();
        match leader.as_deref() {
            Some(current) => current == client_id,
            None => {
                *leader = Some(client_id.to_string());
                debug!(client_id, "fetcher role claimed");
                true
            }
        }
    }

    /// Gives up the fetcher role if `client_id` holds it.
    pub fn release(&self, client_id: &str) {
        let mut leader = self.leader.lock();
        if leader.as_deref() == Some(client_id) {
            *leader = None;
            debug!(client_id, "fetcher role released");
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }

    fn send(&self, envelope: Envelope) -> SyncResult<()> {
        self.tx
            .send(envelope)
            .map(|_| ())
            .map_err(|_| SyncError::CrossTab("no tab is listening".into()))
    }
}

impl Default for TabBus {
    fn default() -> Self {
        Self::new()
    }
}

type Reply = Result<Value, String>;
type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<Reply>>>>;

/// One tab's end of the bus.
///
/// The channel is itself a [`Fetcher`]: the fetcher-role holder fetches
/// directly, every other tab asks the holder over the bus.
pub struct CrossTabChannel {
    client_id: String,
    bus: TabBus,
    fetcher: Arc<dyn Fetcher>,
    pending: Pending,
    timeout: Duration,
    receiver: JoinHandle<()>,
}

impl CrossTabChannel {
    /// Joins `bus` as `client_id`, answering requests with `fetcher` while
    /// holding the fetcher role.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        client_id: impl Into<String>,
        bus: TabBus,
        fetcher: Arc<dyn Fetcher>,
        timeout: Duration,
    ) -> Self {
        let client_id = client_id.into();
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let receiver = tokio::spawn(listen(
            bus.subscribe(),
            Responder {
                client_id: client_id.clone(),
                bus: bus.clone(),
                fetcher: fetcher.clone(),
                pending: pending.clone(),
            },
        ));
        Self {
            client_id,
            bus,
            fetcher,
            pending,
            timeout,
            receiver,
        }
    }

    /// This tab's client id.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// True if this tab holds the fetcher role.
    pub fn is_leader(&self) -> bool {
        self.bus.leader().as_deref() == Some(self.client_id.as_str())
    }

    /// Takes the fetcher role if it is free.
    pub fn try_claim(&self) -> bool {
        self.bus.try_claim(&self.client_id)
    }

    /// Number of requests waiting for an answer.
    pub fn pending_requests(&self) -> usize {
        self.pending.lock().len()
    }

    /// Broadcasts a fetch request and waits for the fetcher tab's answer.
    ///
    /// # Errors
    ///
    /// [`SyncError::Timeout`] if no answer arrives in time,
    /// [`SyncError::CrossTab`] if the fetcher tab reports a failure.
    pub async fn request<F>(&self, make: F) -> SyncResult<Value>
    where
        F: FnOnce(String) -> TabMessage,
    {
        let message_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(message_id.clone(), tx);

        let sent = self.bus.send(Envelope {
            sender: self.client_id.clone(),
            message: make(message_id.clone()),
        });
        if let Err(e) = sent {
            self.pending.lock().remove(&message_id);
            return Err(e);
        }
        debug!(%message_id, "cross-tab request sent");

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(Ok(data))) => Ok(data),
            Ok(Ok(Err(message))) => Err(SyncError::CrossTab(message)),
            Ok(Err(_)) => Err(SyncError::CrossTab("request dropped".into())),
            Err(_) => {
                self.pending.lock().remove(&message_id);
                warn!(%message_id, "cross-tab request timed out");
                Err(SyncError::Timeout)
            }
        }
    }

    fn holds_role(&self) -> bool {
        self.is_leader() || self.try_claim()
    }
}

#[async_trait]
impl Fetcher for CrossTabChannel {
    async fn fetch_model(&self, table: &str, id: &Value) -> SyncResult<Option<Value>> {
        if self.holds_role() {
            return self.fetcher.fetch_model(table, id).await;
        }
        let data = self
            .request(|message_id| TabMessage::FetchModel {
                table_name: table.to_string(),
                id: id.clone(),
                message_id,
            })
            .await?;
        Ok(Some(data).filter(|v| !v.is_null()))
    }

    async fn fetch_collection(&self, table: &str, params: &Value) -> SyncResult<Vec<Value>> {
        if self.holds_role() {
            return self.fetcher.fetch_collection(table, params).await;
        }
        let data = self
            .request(|message_id| TabMessage::FetchCollection {
                table_name: table.to_string(),
                params: params.clone(),
                message_id,
            })
            .await?;
        match data {
            Value::Array(rows) => Ok(rows),
            Value::Null => Ok(Vec::new()),
            other => Err(SyncError::CrossTab(format!("expected a list of rows, got {other}"))),
        }
    }
}

impl Drop for CrossTabChannel {
    /// Stops the receiver, which aborts the fetches it is serving for other
    /// tabs, and gives up the fetcher role.
    fn drop(&mut self) {
        self.receiver.abort();
        self.bus.release(&self.client_id);
    }
}

/// Everything the receiver task needs, detached from the channel itself.
#[derive(Clone)]
struct Responder {
    client_id: String,
    bus: TabBus,
    fetcher: Arc<dyn Fetcher>,
    pending: Pending,
}

impl Responder {
    fn resolve(&self, message_id: &str, reply: Reply) {
        match self.pending.lock().remove(message_id) {
            // The requester may have timed out meanwhile.
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => debug!(message_id, "response for unknown request"),
        }
    }

    async fn serve(self, message: TabMessage) {
        let message_id = message.message_id().to_string();
        let outcome = match message {
            TabMessage::FetchModel { table_name, id, .. } => self
                .fetcher
                .fetch_model(&table_name, &id)
                .await
                .map(|row| row.unwrap_or(Value::Null)),
            TabMessage::FetchCollection {
                table_name, params, ..
            } => self
                .fetcher
                .fetch_collection(&table_name, &params)
                .await
                .map(Value::Array),
            TabMessage::RequestResponse { .. } => return,
        };
        let response = match outcome {
            Ok(data) => TabMessage::RequestResponse {
                message_id,
                status: ResponseStatus::Success,
                data: Some(data),
                err: None,
            },
            Err(e) => {
                warn!(error = %e, "fetch for another tab failed");
                TabMessage::RequestResponse {
                    message_id,
                    status: ResponseStatus::Error,
                    data: None,
                    err: Some(e.to_string()),
                }
            }
        };
        if let Err(e) = self.bus.send(Envelope {
            sender: self.client_id.clone(),
            message: response,
        }) {
            warn!(error = %e, "could not answer cross-tab request");
        }
    }
}

async fn listen(mut rx: broadcast::Receiver<Envelope>, responder: Responder) {
    // Requests being served for other tabs; dropped with the receiver.
    let mut serving = JoinSet::new();
    loop {
        let received = tokio::select! {
            received = rx.recv() => received,
            Some(_) = serving.join_next(), if !serving.is_empty() => continue,
        };
        let envelope = match received {
            Ok(envelope) => envelope,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "cross-tab receiver lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        if envelope.sender == responder.client_id {
            continue;
        }
        match envelope.message {
            TabMessage::RequestResponse {
                message_id,
                status,
                data,
                err,
            } => {
                let reply = match status {
                    ResponseStatus::Success => Ok(data.unwrap_or(Value::Null)),
                    ResponseStatus::Error => Err(err.unwrap_or_else(|| "fetch failed".into())),
                };
                responder.resolve(&message_id, reply);
            }
            request => {
                if responder.bus.leader().as_deref() != Some(responder.client_id.as_str()) {
                    continue;
                }
                serving.spawn(responder.clone().serve(request));
            }
        }
    }
}
