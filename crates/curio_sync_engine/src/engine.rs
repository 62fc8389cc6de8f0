//! Assembly of one engine instance.

use crate::apply::ApplyEngine;
use crate::changes::{ChangeLog, UnsyncedWatch};
use crate::config::SyncConfig;
use crate::context::SyncContext;
use crate::error::{SyncError, SyncResult};
use crate::fetch::{Fetcher, RemoteFetcher};
use crate::http::{HttpClient, HttpTransport};
use crate::registry::ResourceRegistry;
use crate::resource::Resource;
use crate::session::Session;
use crate::sync::SyncClient;
use crate::tabs::{CrossTabChannel, TabBus};
use crate::tracker::ChangeTracker;
use crate::transport::SyncTransport;
use curio_storage::Database;
use std::sync::Arc;
use tracing::debug;

/// Builder for [`ReplicationEngine`].
pub struct EngineBuilder {
    db: Arc<Database>,
    registry: Arc<ResourceRegistry>,
    config: SyncConfig,
    transport: Option<Arc<dyn SyncTransport>>,
    http: Option<Arc<dyn HttpClient>>,
    fetcher: Option<Arc<dyn Fetcher>>,
    bus: Option<TabBus>,
    session: Option<Arc<Session>>,
    client_id: Option<String>,
}

impl EngineBuilder {
    /// Sets the configuration.
    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Uses `transport` for sync requests instead of HTTP.
    pub fn with_transport(mut self, transport: Arc<dyn SyncTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Talks to the server through `client`, for both sync requests and
    /// fetches unless those are set separately.
    pub fn with_http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.http = Some(client);
        self
    }

    /// Uses `fetcher` to refresh resources.
    pub fn with_fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Joins `bus`, so fetches and sync cycles run in one tab at a time.
    pub fn with_tab_bus(mut self, bus: TabBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Shares `session` instead of a private one.
    pub fn with_session(mut self, session: Arc<Session>) -> Self {
        self.session = Some(session);
        self
    }

    /// Sets the client id instead of generating one.
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Builds the engine.
    ///
    /// Joining a tab bus spawns the bus receiver, so that case must run
    /// inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// [`SyncError::Config`] if neither a transport nor an HTTP client was
    /// given.
    pub fn build(self) -> SyncResult<ReplicationEngine> {
        let mut ctx = SyncContext::new(self.db.clone(), self.registry.clone(), self.config);
        if let Some(client_id) = self.client_id {
            ctx = ctx.with_client_id(client_id);
        }
        if let Some(session) = self.session {
            ctx = ctx.with_session(session);
        }

        let transport: Arc<dyn SyncTransport> = match (self.transport, &self.http) {
            (Some(transport), _) => transport,
            (None, Some(http)) => Arc::new(HttpTransport::new(ctx.config().sync_url(), http.clone())),
            (None, None) => {
                return Err(SyncError::Config(
                    "an engine needs a sync transport or an HTTP client".into(),
                ))
            }
        };
        let fetcher: Option<Arc<dyn Fetcher>> = match (self.fetcher, self.http) {
            (Some(fetcher), _) => Some(fetcher),
            (None, Some(http)) => Some(Arc::new(RemoteFetcher::new(
                http,
                self.db.clone(),
                self.registry.clone(),
                ctx.config().clone(),
            ))),
            (None, None) => None,
        };
        let tabs = match (self.bus, &fetcher) {
            (Some(bus), Some(fetcher)) => Some(Arc::new(CrossTabChannel::new(
                ctx.client_id(),
                bus,
                fetcher.clone(),
                ctx.config().cross_tab_timeout,
            ))),
            _ => None,
        };

        let apply = Arc::new(ApplyEngine::with_store(self.db, self.registry));
        let mut sync = SyncClient::new(ctx.clone(), transport, apply.clone());
        if let Some(tabs) = &tabs {
            sync = sync.with_tabs(tabs.clone());
        }
        debug!(client_id = ctx.client_id(), cross_tab = tabs.is_some(), "engine assembled");

        Ok(ReplicationEngine {
            ctx,
            apply,
            sync: Arc::new(sync),
            fetcher,
            tabs,
        })
    }
}

/// One engine instance: the resources of a tab plus its sync machinery.
pub struct ReplicationEngine {
    ctx: SyncContext,
    apply: Arc<ApplyEngine>,
    sync: Arc<SyncClient>,
    fetcher: Option<Arc<dyn Fetcher>>,
    tabs: Option<Arc<CrossTabChannel>>,
}

impl ReplicationEngine {
    /// Starts building an engine over `db`, which must have been opened
    /// with the schemas of `registry`.
    pub fn builder(db: Arc<Database>, registry: Arc<ResourceRegistry>) -> EngineBuilder {
        EngineBuilder {
            db,
            registry,
            config: SyncConfig::default(),
            transport: None,
            http: None,
            fetcher: None,
            bus: None,
            session: None,
            client_id: None,
        }
    }

    /// Shared handles of this instance.
    pub fn context(&self) -> &SyncContext {
        &self.ctx
    }

    /// Client id of this instance.
    pub fn client_id(&self) -> &str {
        self.ctx.client_id()
    }

    /// Session state.
    pub fn session(&self) -> &Arc<Session> {
        self.ctx.session()
    }

    /// The facade of `table`.
    ///
    /// Reads refresh through the cross-tab channel when one is attached,
    /// otherwise through the fetcher directly.
    pub fn resource(&self, table: &str) -> SyncResult<Resource> {
        let descriptor = self.ctx.registry().descriptor(table)?.clone();
        let fetcher = match &self.tabs {
            Some(tabs) => Some(tabs.clone() as Arc<dyn Fetcher>),
            None => self.fetcher.clone(),
        };
        Ok(Resource::new(self.ctx.clone(), descriptor, fetcher))
    }

    /// A new change tracker over this instance's log.
    pub fn tracker(&self) -> ChangeTracker {
        ChangeTracker::new(self.ctx.db().clone())
    }

    /// The sync client. Spawn [`SyncClient::run`] to sync in the background.
    pub fn sync_client(&self) -> &Arc<SyncClient> {
        &self.sync
    }

    /// The apply engine.
    pub fn apply(&self) -> &Arc<ApplyEngine> {
        &self.apply
    }

    /// This tab's end of the cross-tab bus.
    pub fn tabs(&self) -> Option<&Arc<CrossTabChannel>> {
        self.tabs.as_ref()
    }

    /// The change log.
    pub fn log(&self) -> ChangeLog {
        ChangeLog::new(self.ctx.db().clone())
    }

    /// True while any local change still needs the server.
    pub fn has_unsynced(&self) -> SyncResult<bool> {
        self.log().has_unsynced()
    }

    /// A live view of [`ReplicationEngine::has_unsynced`].
    pub fn watch_unsynced(&self) -> SyncResult<UnsyncedWatch> {
        self.log().watch_unsynced()
    }

    /// Aborts in-flight requests, as when the user leaves the page.
    pub fn navigate(&self) {
        self.sync.navigate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{HttpResponse, MockHttpClient};
    use crate::registry::{CHANNEL, CONTENTNODE};
    use serde_json::json;

    fn parts() -> (Arc<Database>, Arc<ResourceRegistry>) {
        let registry = Arc::new(ResourceRegistry::standard());
        let db = Arc::new(registry.open_in_memory().unwrap());
        (db, registry)
    }

    #[test]
    fn build_requires_a_transport() {
        let (db, registry) = parts();
        let result = ReplicationEngine::builder(db, registry).build();
        assert!(matches!(result, Err(SyncError::Config(_))));
    }

    #[tokio::test]
    async fn http_client_serves_sync_and_fetch() {
        let (db, registry) = parts();
        let http = Arc::new(MockHttpClient::new());
        http.respond(
            "GET",
            "http://studio.test/api/channel/ch1/",
            HttpResponse::ok(json!({"id": "ch1", "name": "Physics"})),
        );
        http.respond("POST", "http://studio.test/api/sync/", HttpResponse::ok(json!({})));
        let engine = ReplicationEngine::builder(db, registry)
            .with_config(SyncConfig::new("http://studio.test"))
            .with_http_client(http.clone())
            .with_client_id("tab-a")
            .build()
            .unwrap();

        let channel = engine.resource(CHANNEL).unwrap();
        let row = channel.get(&json!("ch1")).await.unwrap().unwrap();
        assert_eq!(row["name"], json!("Physics"));

        let nodes = engine.resource(CONTENTNODE).unwrap();
        nodes.add(json!({"title": "intro", "parent": "root", "lft": 1})).unwrap();
        assert!(engine.has_unsynced().unwrap());

        let result = engine.sync_client().sync().await.unwrap();
        assert_eq!(result.sent, 1);
        let posts: Vec<_> = http.calls().into_iter().filter(|c| c.0 == "POST").collect();
        assert_eq!(posts[0].2[0]["obj"]["title"], json!("intro"));
        assert!(engine.resource("unknown").is_err());
    }
}
