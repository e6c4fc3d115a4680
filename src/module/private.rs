//! XEP-0049: Private XML Storage.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use minidom::Element;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{respond, IqHandler, MAILBOX_SIZE};
use crate::error::StanzaErrorCondition;
use crate::router::Router;
use crate::stanza::{Iq, JidExt};
use crate::storage::Storage;

/// Private XML storage namespace.
pub const NS_PRIVATE: &str = "jabber:iq:private";

/// Private XML storage module.
pub struct Private {
    tx: mpsc::Sender<Iq>,
}

impl Private {
    pub fn new(
        router: Arc<Router>,
        storage: Arc<dyn Storage>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
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
impl IqHandler for Private {
    fn matches_iq(&self, iq: &Iq) -> bool {
        iq.payload("query", NS_PRIVATE).is_some()
    }

    async fn process_iq(&self, iq: Iq) {
        if self.tx.send(iq).await.is_err() {
            warn!("private storage module mailbox closed");
        }
    }
}

struct Inner {
    router: Arc<Router>,
    storage: Arc<dyn Storage>,
}

impl Inner {
    async fn process_iq(&self, iq: Iq) {
        let to = iq.to_jid();
        let from = iq.from_jid();
        let valid_to = to.is_server() || to.node_str() == from.node_str();
        if !valid_to {
            respond(&self.router, &iq, iq.error(StanzaErrorCondition::Forbidden)).await;
            return;
        }
        if iq.is_get() {
            self.get_private(iq).await;
        } else if iq.is_set() {
            self.set_private(iq).await;
        } else {
            respond(&self.router, &iq, iq.error(StanzaErrorCondition::BadRequest)).await;
        }
    }

    async fn get_private(&self, iq: Iq) {
        let username = iq.from_jid().node_str().unwrap_or("").to_string();
        let query = iq.payload("query", NS_PRIVATE).expect("matched payload");
        let children: Vec<&Element> = query.children().collect();
        if children.len() != 1 {
            respond(&self.router, &iq, iq.error(StanzaErrorCondition::NotAcceptable)).await;
            return;
        }
        let requested = children[0];
        let namespace = requested.ns();
        if requested.children().next().is_some() || !is_valid_namespace(&namespace) {
            respond(&self.router, &iq, iq.error(StanzaErrorCondition::NotAcceptable)).await;
            return;
        }
        debug!(namespace = %namespace, username = %username, "retrieving private element");

        match self.storage.fetch_private_xml(&namespace, &username).await {
            Ok(stored) => {
                let mut result_query = Element::builder("query", NS_PRIVATE).build();
                match stored {
                    Some(elements) if !elements.is_empty() => {
                        for elem in elements {
                            result_query.append_child(elem);
                        }
                    }
                    _ => {
                        let empty =
                            Element::builder(requested.name(), namespace.as_str()).build();
                        result_query.append_child(empty);
                    }
                }
                respond(&self.router, &iq, iq.result_with(result_query)).await;
            }
            Err(e) => {
                warn!(error = %e, username = %username, "private storage fetch failed");
                respond(
                    &self.router,
                    &iq,
                    iq.error(StanzaErrorCondition::InternalServerError),
                )
                .await;
            }
        }
    }

    async fn set_private(&self, iq: Iq) {
        let username = iq.from_jid().node_str().unwrap_or("").to_string();
        let query = iq.payload("query", NS_PRIVATE).expect("matched payload");

        let mut by_namespace: HashMap<String, Vec<Element>> = HashMap::new();
        for child in query.children() {
            let namespace = child.ns();
            if namespace.is_empty() {
                respond(&self.router, &iq, iq.error(StanzaErrorCondition::BadRequest)).await;
                return;
            }
            if !is_valid_namespace(&namespace) {
                respond(&self.router, &iq, iq.error(StanzaErrorCondition::NotAcceptable)).await;
                return;
            }
            by_namespace.entry(namespace).or_default().push(child.clone());
        }
        for (namespace, elements) in &by_namespace {
            debug!(namespace = %namespace, username = %username, "saving private elements");
            if let Err(e) = self
                .storage
                .insert_or_update_private_xml(elements, namespace, &username)
                .await
            {
                warn!(error = %e, username = %username, "private storage save failed");
                respond(
                    &self.router,
                    &iq,
                    iq.error(StanzaErrorCondition::InternalServerError),
                )
                .await;
                return;
            }
        }
        respond(&self.router, &iq, iq.result()).await;
    }
}

/// Reserved namespaces cannot be used for private storage.
fn is_valid_namespace(namespace: &str) -> bool {
    !namespace.starts_with("jabber:")
        && !namespace.starts_with("http://jabber.org/")
        && namespace != "vcard-temp"
}
