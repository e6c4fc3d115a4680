//! XEP-0199: XMPP Ping.
//!
//! Answers `urn:xmpp:ping` get IQs addressed to the server. Active liveness
//! probing toward clients is an external concern.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{respond, disco::Disco, IqHandler, MAILBOX_SIZE};
use crate::router::Router;
use crate::stanza::Iq;

/// Ping namespace.
pub const NS_PING: &str = "urn:xmpp:ping";

/// Ping module.
pub struct Ping {
    tx: mpsc::Sender<Iq>,
}

impl Ping {
    pub fn new(disco: &Disco, router: Arc<Router>, shutdown: CancellationToken) -> Arc<Self> {
        disco.register_server_feature(NS_PING);

        let (tx, mut rx) = mpsc::channel::<Iq>(MAILBOX_SIZE);
        let inner = Inner { router };
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
impl IqHandler for Ping {
    fn matches_iq(&self, iq: &Iq) -> bool {
        iq.is_get() && iq.payload("ping", NS_PING).is_some()
    }

    async fn process_iq(&self, iq: Iq) {
        if self.tx.send(iq).await.is_err() {
            warn!("ping module mailbox closed");
        }
    }
}

struct Inner {
    router: Arc<Router>,
}

impl Inner {
    async fn process_iq(&self, iq: Iq) {
        respond(&self.router, &iq, iq.result()).await;
    }
}
