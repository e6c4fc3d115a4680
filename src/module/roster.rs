//! Roster presence hand-off.
//!
//! One instance per stream. Receives the presences the stream does not
//! route directly: self-addressed availability changes and subscription
//! presences. Availability is reflected to the user's other bound
//! resources; subscription presences are delivered to every bound stream of
//! the local contact. Roster item pushes and versioning live outside this
//! core.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::c2s::C2sStream;
use crate::router::Router;
use crate::stanza::{JidExt, Presence};

const ROSTER_MAILBOX_SIZE: usize = 64;

/// Per-stream roster presence module.
pub struct Roster {
    tx: mpsc::Sender<Presence>,
}

impl Roster {
    /// Spawn the module actor for `stream`; it exits when the stream's
    /// `done` token fires.
    pub fn new(
        stream: Arc<dyn C2sStream>,
        router: Arc<Router>,
        done: CancellationToken,
    ) -> Arc<Self> {
        let (tx, mut rx) = mpsc::channel(ROSTER_MAILBOX_SIZE);
        let inner = Inner { stream, router };
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    // drain handed-off presences before observing termination,
                    // so the final unavailable broadcast is not lost
                    biased;
                    presence = rx.recv() => match presence {
                        Some(presence) => inner.process_presence(presence).await,
                        None => return,
                    },
                    _ = done.cancelled() => return,
                }
            }
        });
        Arc::new(Self { tx })
    }

    /// Hand a presence to the module.
    pub async fn process_presence(&self, presence: Presence) {
        let _ = self.tx.send(presence).await;
    }
}

struct Inner {
    stream: Arc<dyn C2sStream>,
    router: Arc<Router>,
}

impl Inner {
    async fn process_presence(&self, presence: Presence) {
        if presence.is_available() || presence.is_unavailable() {
            self.reflect_to_own_resources(&presence).await;
        } else if presence.is_subscription() {
            self.deliver_to_contact(&presence).await;
        }
    }

    /// Availability changes are visible to the user's other sessions.
    async fn reflect_to_own_resources(&self, presence: &Presence) {
        let own_resource = self.stream.resource();
        for other in self.router.user_streams(&self.stream.username()) {
            if other.resource() == own_resource {
                continue;
            }
            let mut elem = presence.element().clone();
            elem.set_attr("to", other.jid().to_string());
            other.send_element(elem).await;
        }
    }

    /// Subscription presences go to every bound stream of a local contact.
    async fn deliver_to_contact(&self, presence: &Presence) {
        let to = presence.to_jid();
        if !self.router.is_local_domain(to.domain_str()) {
            debug!(to = %to, "subscription presence to remote contact not handled");
            return;
        }
        let node = match to.node_str() {
            Some(node) => node,
            None => return,
        };
        for contact_stream in self.router.user_streams(node) {
            contact_stream.send_element(presence.element().clone()).await;
        }
    }
}
