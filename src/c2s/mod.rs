//! C2S service: the per-connection stream state machine and its supervisor.

mod stream;

pub use stream::LocalStream;

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use jid::Jid;
use minidom::Element;
use tracing::info;

use crate::config::C2sConfig;
use crate::context::StreamState;
use crate::error::StreamErrorCondition;
use crate::module::Modules;
use crate::router::Router;
use crate::stanza::Presence;
use crate::storage::Storage;
use crate::transport::Transport;

/// The face a bound client stream shows to the router and to modules.
#[async_trait]
pub trait C2sStream: Send + Sync {
    /// Stable identifier assigned at creation.
    fn id(&self) -> &str;

    /// Authenticated account node; empty before authentication.
    fn username(&self) -> String;

    /// Domain negotiated on stream open.
    fn domain(&self) -> String;

    /// Bound resource; empty before binding.
    fn resource(&self) -> String;

    /// Current stream JID (server, bare or full depending on progress).
    fn jid(&self) -> Jid;

    /// Whether the transport has been secured.
    fn is_secured(&self) -> bool;

    /// Whether SASL completed.
    fn is_authenticated(&self) -> bool;

    /// Whether stream compression is active.
    fn is_compressed(&self) -> bool;

    /// Last observed self-addressed available/unavailable presence.
    fn presence(&self) -> Option<Presence>;

    /// Enqueue an outbound element; dropped silently once disconnected.
    async fn send_element(&self, elem: Element);

    /// Tear the stream down; returns only after `Disconnected` is reached.
    /// Idempotent.
    async fn disconnect(&self, error: Option<StreamErrorCondition>);
}

/// Supervisor owning every live stream, bound or not.
pub struct C2sServer {
    cfg: Arc<C2sConfig>,
    router: Arc<Router>,
    storage: Arc<dyn Storage>,
    modules: Arc<Modules>,
    streams: Arc<DashMap<String, Arc<LocalStream>>>,
}

impl C2sServer {
    /// Create the service around an initialized router and module set.
    pub fn new(
        cfg: C2sConfig,
        router: Arc<Router>,
        storage: Arc<dyn Storage>,
        modules: Arc<Modules>,
    ) -> Self {
        Self {
            cfg: Arc::new(cfg),
            router,
            storage,
            modules,
            streams: Arc::new(DashMap::new()),
        }
    }

    /// Accept a transport: create its stream and start negotiating.
    pub fn register(&self, transport: Box<dyn Transport>) -> Arc<LocalStream> {
        let stream = LocalStream::spawn(
            transport,
            Arc::clone(&self.cfg),
            Arc::clone(&self.router),
            Arc::clone(&self.storage),
            Arc::clone(&self.modules),
            Arc::clone(&self.streams),
        );
        info!(stream_id = %stream.id(), "registered C2S stream");
        stream
    }

    /// Number of live streams, bound or not.
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Look up a live stream by id.
    pub fn stream(&self, id: &str) -> Option<Arc<LocalStream>> {
        self.streams.get(id).map(|s| Arc::clone(&s))
    }

    /// The router this service feeds.
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Disconnect every stream with `system-shutdown`, then stop the module
    /// actors.
    pub async fn shutdown(&self) {
        let streams: Vec<Arc<LocalStream>> = self
            .streams
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for stream in streams {
            if stream.state() != StreamState::Disconnected {
                stream
                    .disconnect(Some(StreamErrorCondition::SystemShutdown))
                    .await;
            }
        }
        self.modules.shutdown();
        info!("C2S service stopped");
    }
}
