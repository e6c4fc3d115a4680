//! XEP-0030: Service Discovery.
//!
//! Holds the feature/identity registries the other modules publish into and
//! answers `disco#info` / `disco#items` queries for the server and for
//! local accounts.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use minidom::Element;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{respond, IqHandler, MAILBOX_SIZE};
use crate::error::StanzaErrorCondition;
use crate::router::Router;
use crate::stanza::{Iq, JidExt};
use crate::storage::Storage;
use crate::xml::ns;

/// disco#info namespace.
pub const NS_DISCO_INFO: &str = "http://jabber.org/protocol/disco#info";
/// disco#items namespace.
pub const NS_DISCO_ITEMS: &str = "http://jabber.org/protocol/disco#items";

/// An item advertised under disco#items.
#[derive(Debug, Clone)]
pub struct Item {
    pub jid: String,
    pub name: Option<String>,
    pub node: Option<String>,
}

struct Registry {
    server_features: RwLock<Vec<String>>,
    account_features: RwLock<Vec<String>>,
    server_items: RwLock<Vec<Item>>,
}

/// Service discovery module.
pub struct Disco {
    tx: mpsc::Sender<Iq>,
    registry: Arc<Registry>,
}

impl Disco {
    pub fn new(
        domain: String,
        router: Arc<Router>,
        storage: Arc<dyn Storage>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let registry = Arc::new(Registry {
            server_features: RwLock::new(vec![
                NS_DISCO_INFO.to_string(),
                NS_DISCO_ITEMS.to_string(),
            ]),
            account_features: RwLock::new(vec![
                NS_DISCO_INFO.to_string(),
                NS_DISCO_ITEMS.to_string(),
            ]),
            server_items: RwLock::new(Vec::new()),
        });
        let (tx, mut rx) = mpsc::channel::<Iq>(MAILBOX_SIZE);

        let inner = Inner {
            domain,
            router,
            storage,
            registry: Arc::clone(&registry),
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

        Arc::new(Self { tx, registry })
    }

    /// Advertise a feature on the server entity.
    pub fn register_server_feature(&self, feature: &str) {
        let mut features = self.registry.server_features.write().expect("disco lock");
        if !features.iter().any(|f| f == feature) {
            features.push(feature.to_string());
        }
    }

    /// Advertise a feature on every local account entity.
    pub fn register_account_feature(&self, feature: &str) {
        let mut features = self.registry.account_features.write().expect("disco lock");
        if !features.iter().any(|f| f == feature) {
            features.push(feature.to_string());
        }
    }

    /// Advertise an item under the server's disco#items.
    pub fn register_server_item(&self, item: Item) {
        self.registry
            .server_items
            .write()
            .expect("disco lock")
            .push(item);
    }
}

#[async_trait]
impl IqHandler for Disco {
    fn matches_iq(&self, iq: &Iq) -> bool {
        iq.is_get()
            && (iq.payload("query", NS_DISCO_INFO).is_some()
                || iq.payload("query", NS_DISCO_ITEMS).is_some())
    }

    async fn process_iq(&self, iq: Iq) {
        if self.tx.send(iq).await.is_err() {
            warn!("disco module mailbox closed");
        }
    }
}

struct Inner {
    domain: String,
    router: Arc<Router>,
    storage: Arc<dyn Storage>,
    registry: Arc<Registry>,
}

impl Inner {
    async fn process_iq(&self, iq: Iq) {
        let to = iq.to_jid();
        if !self.router.is_local_domain(to.domain_str()) {
            respond(&self.router, &iq, iq.error(StanzaErrorCondition::ItemNotFound)).await;
            return;
        }
        match to.node_str() {
            None => self.answer_server(&iq).await,
            Some(node) => self.answer_account(&iq, node).await,
        }
    }

    async fn answer_server(&self, iq: &Iq) {
        if iq.payload("query", NS_DISCO_INFO).is_some() {
            let identity = ("server", "im", self.domain.clone());
            let features = self.registry.server_features.read().expect("disco lock").clone();
            let query = info_query(identity, &features);
            respond(&self.router, iq, iq.result_with(query)).await;
        } else {
            let items = self.registry.server_items.read().expect("disco lock").clone();
            let query = items_query(&items);
            respond(&self.router, iq, iq.result_with(query)).await;
        }
    }

    async fn answer_account(&self, iq: &Iq, node: &str) {
        let exists = match self.storage.fetch_user(node).await {
            Ok(user) => user.is_some(),
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
        if !exists {
            respond(&self.router, iq, iq.error(StanzaErrorCondition::ItemNotFound)).await;
            return;
        }
        if iq.payload("query", NS_DISCO_INFO).is_some() {
            let identity = ("account", "registered", node.to_string());
            let features = self
                .registry
                .account_features
                .read()
                .expect("disco lock")
                .clone();
            let query = info_query(identity, &features);
            respond(&self.router, iq, iq.result_with(query)).await;
        } else {
            let query = items_query(&[]);
            respond(&self.router, iq, iq.result_with(query)).await;
        }
    }
}

fn info_query(identity: (&str, &str, String), features: &[String]) -> Element {
    let mut query = Element::builder("query", NS_DISCO_INFO).build();
    let identity_el = Element::builder("identity", NS_DISCO_INFO)
        .attr("category", identity.0)
        .attr("type", identity.1)
        .attr("name", identity.2)
        .build();
    query.append_child(identity_el);
    for feature in features {
        let feature_el = Element::builder("feature", NS_DISCO_INFO)
            .attr("var", feature.as_str())
            .build();
        query.append_child(feature_el);
    }
    query
}

fn items_query(items: &[Item]) -> Element {
    let mut query = Element::builder("query", NS_DISCO_ITEMS).build();
    for item in items {
        let item_el = Element::builder("item", NS_DISCO_ITEMS)
            .attr("jid", item.jid.as_str())
            .attr("name", item.name.as_deref())
            .attr("node", item.node.as_deref())
            .build();
        query.append_child(item_el);
    }
    query
}
