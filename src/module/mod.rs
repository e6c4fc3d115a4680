//! IQ-handler framework and the server-hosted module set.
//!
//! Modules answer IQs on behalf of the server. Each one owns an actor task
//! draining a bounded mailbox; `matches_iq` is a pure predicate evaluated by
//! the stream in registration order, and the first match owns the IQ. All
//! actors exit when the shared shutdown token fires.

pub mod disco;
pub mod last_activity;
pub mod offline;
pub mod ping;
pub mod private;
pub mod roster;
pub mod vcard;
pub mod version;

use std::sync::Arc;

use async_trait::async_trait;
use minidom::Element;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::C2sConfig;
use crate::router::Router;
use crate::stanza::{Iq, Stanza};
use crate::storage::Storage;

/// Mailbox bound of a module actor; posting blocks when full.
pub(crate) const MAILBOX_SIZE: usize = 1024;

/// A module that answers IQs addressed to the server or a local bare JID.
#[async_trait]
pub trait IqHandler: Send + Sync {
    /// Pure predicate: whether this module owns the IQ. No side effects.
    fn matches_iq(&self, iq: &Iq) -> bool;

    /// Enqueue the IQ onto the module's actor.
    async fn process_iq(&self, iq: Iq);
}

/// Route a module response back to the requester.
pub(crate) async fn respond(router: &Router, original: &Iq, element: Element) {
    let response = match Iq::from_element(
        element,
        original.to_jid().clone(),
        original.from_jid().clone(),
    ) {
        Ok(iq) => Stanza::Iq(iq),
        Err(e) => {
            warn!(error = %e, "dropping malformed module response");
            return;
        }
    };
    if let Err(outcome) = router.route(&response).await {
        debug!(?outcome, id = %original.id(), "module response not delivered");
    }
}

/// The instantiated module set, in registration order.
pub struct Modules {
    /// Service discovery; always active, other modules register into it.
    pub disco: Arc<disco::Disco>,
    iq_handlers: Vec<Arc<dyn IqHandler>>,
    shutdown: CancellationToken,
}

impl Modules {
    /// Instantiate the modules named in `cfg.modules.enabled`.
    ///
    /// Registration order is fixed: disco first, then last_activity,
    /// private, vcard, version, ping.
    pub fn new(cfg: &C2sConfig, router: Arc<Router>, storage: Arc<dyn Storage>) -> Self {
        let shutdown = CancellationToken::new();
        let mut iq_handlers: Vec<Arc<dyn IqHandler>> = Vec::new();

        let disco = disco::Disco::new(
            cfg.domain.clone(),
            Arc::clone(&router),
            Arc::clone(&storage),
            shutdown.clone(),
        );
        iq_handlers.push(Arc::clone(&disco) as Arc<dyn IqHandler>);

        if cfg.modules.is_enabled("last_activity") {
            let last_activity = last_activity::LastActivity::new(
                &disco,
                Arc::clone(&router),
                Arc::clone(&storage),
                shutdown.clone(),
            );
            iq_handlers.push(last_activity);
        }
        if cfg.modules.is_enabled("private") {
            let private = private::Private::new(
                Arc::clone(&router),
                Arc::clone(&storage),
                shutdown.clone(),
            );
            iq_handlers.push(private);
        }
        if cfg.modules.is_enabled("vcard") {
            let vcard = vcard::VCard::new(
                &disco,
                Arc::clone(&router),
                Arc::clone(&storage),
                shutdown.clone(),
            );
            iq_handlers.push(vcard);
        }
        if cfg.modules.is_enabled("version") {
            let version = version::Version::new(
                &disco,
                cfg.version.clone(),
                Arc::clone(&router),
                shutdown.clone(),
            );
            iq_handlers.push(version);
        }
        if cfg.modules.is_enabled("ping") {
            let ping = ping::Ping::new(&disco, Arc::clone(&router), shutdown.clone());
            iq_handlers.push(ping);
        }

        Self {
            disco,
            iq_handlers,
            shutdown,
        }
    }

    /// Registered IQ handlers, in registration order.
    pub fn iq_handlers(&self) -> &[Arc<dyn IqHandler>] {
        &self.iq_handlers
    }

    /// Token observed by every module actor.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Fire the shutdown broadcast; every module actor exits promptly.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
