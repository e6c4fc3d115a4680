//! Offline message queue.
//!
//! One instance per stream. Archives messages for recipients with no
//! eligible bound stream and delivers the queue back on the stream's first
//! available presence.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::c2s::C2sStream;
use crate::config::OfflineConfig;
use crate::error::StanzaErrorCondition;
use crate::stanza::{JidExt, Message};
use crate::storage::Storage;
use crate::xml;

const OFFLINE_MAILBOX_SIZE: usize = 32;

enum Op {
    Archive(Message),
    Deliver,
}

/// Per-stream offline queue module.
pub struct Offline {
    tx: mpsc::Sender<Op>,
}

impl Offline {
    /// Spawn the module actor for `stream`; it exits when the stream's
    /// `done` token fires.
    pub fn new(
        cfg: OfflineConfig,
        stream: Arc<dyn C2sStream>,
        storage: Arc<dyn Storage>,
        done: CancellationToken,
    ) -> Arc<Self> {
        let (tx, mut rx) = mpsc::channel(OFFLINE_MAILBOX_SIZE);
        let inner = Inner {
            cfg,
            stream,
            storage,
        };
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    op = rx.recv() => match op {
                        Some(Op::Archive(message)) => inner.archive_message(message).await,
                        Some(Op::Deliver) => inner.deliver_offline_messages().await,
                        None => return,
                    },
                    _ = done.cancelled() => return,
                }
            }
        });
        Arc::new(Self { tx })
    }

    /// Queue a message for archival.
    pub async fn archive_message(&self, message: Message) {
        let _ = self.tx.send(Op::Archive(message)).await;
    }

    /// Deliver every archived message to the stream, then delete them.
    pub async fn deliver_offline_messages(&self) {
        let _ = self.tx.send(Op::Deliver).await;
    }
}

struct Inner {
    cfg: OfflineConfig,
    stream: Arc<dyn C2sStream>,
    storage: Arc<dyn Storage>,
}

impl Inner {
    async fn archive_message(&self, message: Message) {
        let to = message.to_jid().clone();
        let node = to.node_str().unwrap_or("").to_string();
        let queued = match self.storage.count_offline_messages(&node).await {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, username = %node, "offline queue count failed");
                return;
            }
        };
        if queued >= self.cfg.queue_size {
            // bounce back to the sender
            let error = xml::error_response(
                message.element(),
                StanzaErrorCondition::ServiceUnavailable,
                vec![],
            );
            self.stream.send_element(error).await;
            return;
        }
        let mut delayed = message.element().clone();
        xml::stamp_delay(&mut delayed, &self.stream.domain(), "Offline Storage");
        if let Err(e) = self.storage.insert_offline_message(&delayed, &node).await {
            warn!(error = %e, username = %node, "offline archive failed");
            return;
        }
        debug!(id = ?message.id(), username = %node, "archived offline message");
    }

    async fn deliver_offline_messages(&self) {
        let username = self.stream.username();
        let messages = match self.storage.fetch_offline_messages(&username).await {
            Ok(messages) => messages,
            Err(e) => {
                warn!(error = %e, username = %username, "offline fetch failed");
                return;
            }
        };
        if messages.is_empty() {
            return;
        }
        debug!(count = messages.len(), username = %username, "delivering offline messages");
        for message in messages {
            self.stream.send_element(message).await;
        }
        if let Err(e) = self.storage.delete_offline_messages(&username).await {
            warn!(error = %e, username = %username, "offline delete failed");
        }
    }
}
