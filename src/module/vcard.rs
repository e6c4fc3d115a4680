//! XEP-0054: vcard-temp.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{respond, disco::Disco, IqHandler, MAILBOX_SIZE};
use crate::error::StanzaErrorCondition;
use crate::router::Router;
use crate::stanza::{Iq, JidExt};
use crate::storage::Storage;

/// vCard namespace.
pub const NS_VCARD: &str = "vcard-temp";

/// vCard storage module.
pub struct VCard {
    tx: mpsc::Sender<Iq>,
}

impl VCard {
    pub fn new(
        disco: &Disco,
        router: Arc<Router>,
        storage: Arc<dyn Storage>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        disco.register_server_feature(NS_VCARD);
        disco.register_account_feature(NS_VCARD);

        let (tx, mut rx) = mpsc::channel::<Iq>(MAILBOX_SIZE);
        let inner = Inner { router, storage };
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
impl IqHandler for VCard {
    fn matches_iq(&self, iq: &Iq) -> bool {
        (iq.is_get() || iq.is_set()) && iq.payload("vCard", NS_VCARD).is_some()
    }

    async fn process_iq(&self, iq: Iq) {
        if self.tx.send(iq).await.is_err() {
            warn!("vcard module mailbox closed");
        }
    }
}

struct Inner {
    router: Arc<Router>,
    storage: Arc<dyn Storage>,
}

impl Inner {
    async fn process_iq(&self, iq: Iq) {
        if iq.is_get() {
            self.get_vcard(iq).await;
        } else {
            self.set_vcard(iq).await;
        }
    }

    async fn get_vcard(&self, iq: Iq) {
        let vcard = iq.payload("vCard", NS_VCARD).expect("matched payload");
        if vcard.children().next().is_some() {
            respond(&self.router, &iq, iq.error(StanzaErrorCondition::BadRequest)).await;
            return;
        }
        let target = self.target_node(&iq);
        debug!(username = %target, "retrieving vcard");

        match self.storage.fetch_vcard(&target).await {
            Ok(Some(stored)) => {
                respond(&self.router, &iq, iq.result_with(stored)).await;
            }
            Ok(None) => {
                // empty vCard
                let empty = minidom::Element::builder("vCard", NS_VCARD).build();
                respond(&self.router, &iq, iq.result_with(empty)).await;
            }
            Err(e) => {
                warn!(error = %e, username = %target, "vcard fetch failed");
                respond(
                    &self.router,
                    &iq,
                    iq.error(StanzaErrorCondition::InternalServerError),
                )
                .await;
            }
        }
    }

    async fn set_vcard(&self, iq: Iq) {
        let to = iq.to_jid();
        let from = iq.from_jid();
        let allowed = to.is_server() || to.node_str() == from.node_str();
        if !allowed {
            respond(&self.router, &iq, iq.error(StanzaErrorCondition::Forbidden)).await;
            return;
        }
        let vcard = iq.payload("vCard", NS_VCARD).expect("matched payload").clone();
        let target = self.target_node(&iq);
        debug!(username = %target, "saving vcard");

        match self.storage.insert_or_update_vcard(&vcard, &target).await {
            Ok(()) => respond(&self.router, &iq, iq.result()).await,
            Err(e) => {
                warn!(error = %e, username = %target, "vcard save failed");
                respond(
                    &self.router,
                    &iq,
                    iq.error(StanzaErrorCondition::InternalServerError),
                )
                .await;
            }
        }
    }

    /// Account node the vCard belongs to. A server-addressed IQ carries no
    /// node; own-card requests reach this module with `to` resolved to the
    /// sender's bare JID.
    fn target_node(&self, iq: &Iq) -> String {
        iq.to_jid().node_str().unwrap_or("").to_string()
    }
}
