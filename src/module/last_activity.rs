//! XEP-0012: Last Activity.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use jid::Jid;
use minidom::Element;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{respond, disco::Disco, IqHandler, MAILBOX_SIZE};
use crate::error::StanzaErrorCondition;
use crate::router::Router;
use crate::stanza::{Iq, JidExt};
use crate::storage::{Storage, Subscription};
use crate::xml::ns;

/// Last activity namespace.
pub const NS_LAST_ACTIVITY: &str = "jabber:iq:last";

/// Last activity module.
pub struct LastActivity {
    tx: mpsc::Sender<Iq>,
}

impl LastActivity {
    pub fn new(
        disco: &Disco,
        router: Arc<Router>,
        storage: Arc<dyn Storage>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        disco.register_server_feature(NS_LAST_ACTIVITY);
        disco.register_account_feature(NS_LAST_ACTIVITY);

        let (tx, mut rx) = mpsc::channel::<Iq>(MAILBOX_SIZE);
        let inner = Inner {
            router,
            storage,
            start_time: Instant::now(),
        };
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    iq = rx.recv() => match iq {
                        Some(iq) => inner.process_iq(iq).await,
                        None => return,
                    },
                    _ = shutdown.cancelled() => return,
                }
            }
        });
        Arc::new(Self { tx })
    }
}

#[async_trait]
impl IqHandler for LastActivity {
    fn matches_iq(&self, iq: &Iq) -> bool {
        iq.is_get() && iq.payload("query", NS_LAST_ACTIVITY).is_some()
    }

    async fn process_iq(&self, iq: Iq) {
        if self.tx.send(iq).await.is_err() {
            warn!("last activity module mailbox closed");
        }
    }
}

struct Inner {
    router: Arc<Router>,
    storage: Arc<dyn Storage>,
    start_time: Instant,
}

impl Inner {
    async fn process_iq(&self, iq: Iq) {
        let to = iq.to_jid().clone();
        if to.is_server() {
            let uptime = self.start_time.elapsed().as_secs();
            self.send_reply(&iq, uptime, "").await;
        } else if to.is_bare() {
            if self.is_subscribed_to(&to, iq.from_jid()).await {
                self.send_user_last_activity(&iq, &to).await;
            } else {
                respond(&self.router, &iq, iq.error(StanzaErrorCondition::Forbidden)).await;
            }
        }
    }

    async fn send_user_last_activity(&self, iq: &Iq, to: &Jid) {
        let node = to.node_str().unwrap_or("");
        if !self.router.user_streams(node).is_empty() {
            // user online
            self.send_reply(iq, 0, "").await;
            return;
        }
        let user = match self.storage.fetch_user(node).await {
            Ok(user) => user,
            Err(e) => {
                warn!(error = %e, username = %node, "account lookup failed");
                respond(
                    &self.router,
                    iq,
                    iq.error(StanzaErrorCondition::InternalServerError),
                )
                .await;
                return;
            }
        };
        let user = match user {
            Some(user) => user,
            None => {
                respond(&self.router, iq, iq.error(StanzaErrorCondition::ItemNotFound)).await;
                return;
            }
        };
        let mut seconds = 0u64;
        let mut status = String::new();
        if let (Some(presence), Some(at)) = (&user.last_presence, user.last_presence_at) {
            seconds = (chrono::Utc::now() - at).num_seconds().max(0) as u64;
            if let Some(st) = presence.get_child("status", ns::CLIENT) {
                status = st.text();
            }
        }
        self.send_reply(iq, seconds, &status).await;
    }

    async fn send_reply(&self, iq: &Iq, seconds: u64, status: &str) {
        let mut query = Element::builder("query", NS_LAST_ACTIVITY)
            .attr("seconds", seconds.to_string())
            .build();
        if !status.is_empty() {
            query.append_text_node(status);
        }
        respond(&self.router, iq, iq.result_with(query)).await;
    }

    /// The requester may ask about a contact it shares a to/both
    /// subscription with, or about itself.
    async fn is_subscribed_to(&self, contact: &Jid, requester: &Jid) -> bool {
        if contact.matches_bare(requester) {
            return true;
        }
        let username = match requester.node_str() {
            Some(node) => node,
            None => return false,
        };
        match self
            .storage
            .fetch_roster_item(username, &contact.to_bare().to_string())
            .await
        {
            Ok(Some(item)) => {
                matches!(item.subscription, Subscription::To | Subscription::Both)
            }
            Ok(None) => false,
            Err(e) => {
                warn!(error = %e, username = %username, "roster lookup failed");
                false
            }
        }
    }
}
