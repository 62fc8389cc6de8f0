//! Shared state of one engine instance.

use crate::abort::AbortController;
use crate::config::SyncConfig;
use crate::error::SyncResult;
use crate::registry::ResourceRegistry;
use crate::session::Session;
use curio_storage::Database;
use curio_sync_protocol::{ChangeBuilder, ProtocolResult};
use std::sync::Arc;
use uuid::Uuid;

/// Handles every component of one engine instance shares.
///
/// The client id doubles as the source tag of locally made changes, so
/// each instance can tell its own writes from those of other tabs.
#[derive(Clone)]
pub struct SyncContext {
    client_id: String,
    db: Arc<Database>,
    registry: Arc<ResourceRegistry>,
    session: Arc<Session>,
    config: Arc<SyncConfig>,
    abort: Arc<AbortController>,
}

impl SyncContext {
    /// Creates a context with a fresh client id and session.
    pub fn new(db: Arc<Database>, registry: Arc<ResourceRegistry>, config: SyncConfig) -> Self {
        Self {
            client_id: Uuid::new_v4().simple().to_string(),
            db,
            registry,
            session: Arc::new(Session::new()),
            config: Arc::new(config),
            abort: Arc::new(AbortController::new()),
        }
    }

    /// Replaces the client id.
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    /// Shares `session` instead of a private one.
    pub fn with_session(mut self, session: Arc<Session>) -> Self {
        self.session = session;
        self
    }

    /// Client id of this instance.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// The local store.
    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    /// Registered resources.
    pub fn registry(&self) -> &Arc<ResourceRegistry> {
        &self.registry
    }

    /// Session state.
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Configuration.
    pub fn config(&self) -> &Arc<SyncConfig> {
        &self.config
    }

    /// Cancellation of in-flight requests.
    pub fn abort(&self) -> &Arc<AbortController> {
        &self.abort
    }

    /// Runs `f` with a builder scoped to the session's channel and tagged
    /// with this instance's client id.
    pub fn build<T, F>(&self, f: F) -> SyncResult<T>
    where
        F: FnOnce(ChangeBuilder<'_>) -> ProtocolResult<T>,
    {
        let channel = self.session.channel_id();
        let builder = ChangeBuilder::new(self.registry.as_ref())
            .with_channel_opt(channel.as_deref())
            .with_source(&self.client_id);
        Ok(f(builder)?)
    }
}
