//! XEP-0092: Software Version.

use std::sync::Arc;

use async_trait::async_trait;
use minidom::Element;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{respond, disco::Disco, IqHandler, MAILBOX_SIZE};
use crate::config::VersionConfig;
use crate::router::Router;
use crate::stanza::Iq;

/// Software version namespace.
pub const NS_VERSION: &str = "jabber:iq:version";

const SERVER_NAME: &str = "loon";

/// Software version module.
pub struct Version {
    tx: mpsc::Sender<Iq>,
}

impl Version {
    pub fn new(
        disco: &Disco,
        cfg: VersionConfig,
        router: Arc<Router>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        disco.register_server_feature(NS_VERSION);

        let (tx, mut rx) = mpsc::channel::<Iq>(MAILBOX_SIZE);
        let inner = Inner { cfg, router };
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
impl IqHandler for Version {
    fn matches_iq(&self, iq: &Iq) -> bool {
        iq.is_get() && iq.payload("query", NS_VERSION).is_some()
    }

    async fn process_iq(&self, iq: Iq) {
        if self.tx.send(iq).await.is_err() {
            warn!("version module mailbox closed");
        }
    }
}

struct Inner {
    cfg: VersionConfig,
    router: Arc<Router>,
}

impl Inner {
    async fn process_iq(&self, iq: Iq) {
        let mut query = Element::builder("query", NS_VERSION).build();

        let mut name = Element::builder("name", NS_VERSION).build();
        name.append_text_node(SERVER_NAME);
        query.append_child(name);

        let mut version = Element::builder("version", NS_VERSION).build();
        version.append_text_node(env!("CARGO_PKG_VERSION"));
        query.append_child(version);

        if self.cfg.show_os {
            let mut os = Element::builder("os", NS_VERSION).build();
            os.append_text_node(std::env::consts::OS);
            query.append_child(os);
        }
        respond(&self.router, &iq, iq.result_with(query)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStorage, Storage};

    #[tokio::test]
    async fn matches_version_get() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let router = Arc::new(Router::new("jackal.im", Arc::clone(&storage)));
        let disco = Disco::new(
            "jackal.im".to_string(),
            Arc::clone(&router),
            storage,
            CancellationToken::new(),
        );
        let version = Version::new(
            &disco,
            VersionConfig::default(),
            router,
            CancellationToken::new(),
        );

        let elem: Element =
            "<iq xmlns='jabber:client' id='ver1' type='get'><query xmlns='jabber:iq:version'/></iq>"
                .parse()
                .unwrap();
        let iq = Iq::from_element(
            elem,
            "ortuman@jackal.im/balcony".parse().unwrap(),
            "jackal.im".parse().unwrap(),
        )
        .unwrap();
        assert!(version.matches_iq(&iq));
    }
}
