//! Stanza routing between bound streams, components and remote domains.
//!
//! The router owns the process-wide registries: bound streams keyed by bare
//! JID, the component domain table, and the per-user blocklist view.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use dashmap::DashMap;
use jid::Jid;
use tracing::{debug, warn};

use crate::c2s::C2sStream;
use crate::stanza::{JidExt, Stanza};
use crate::storage::Storage;

/// Routing outcomes beyond plain delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteError {
    /// Account exists but no eligible stream is bound.
    NotAuthenticated,
    /// Streams are bound for the account, but none owns that resource.
    ResourceNotFound,
    /// No such account.
    NotExistingAccount,
    /// Recipient domain is remote and no bridge is registered (or it failed).
    FailedRemoteConnect,
    /// The recipient blocks the sender.
    BlockedJid,
}

/// A domain served by an in-process module rather than client streams.
#[async_trait]
pub trait Component: Send + Sync {
    /// Domain the component answers for.
    fn host(&self) -> &str;

    /// Take ownership of a stanza addressed to the component's domain.
    async fn process_stanza(&self, stanza: Stanza);
}

/// Outbound hook toward remote domains. Server-to-server wiring itself is
/// outside this crate.
#[async_trait]
pub trait OutBridge: Send + Sync {
    /// Forward a stanza toward its remote domain.
    async fn route_stanza(&self, stanza: &Stanza) -> Result<(), RouteError>;
}

struct BoundResource {
    resource: String,
    stream_id: String,
    seq: u64,
    stream: Arc<dyn C2sStream>,
}

/// Process-wide stanza router.
pub struct Router {
    domain: String,
    storage: Arc<dyn Storage>,
    bound: DashMap<String, Vec<BoundResource>>,
    bind_seq: AtomicU64,
    components: DashMap<String, Arc<dyn Component>>,
    blocklists: DashMap<String, Vec<Jid>>,
    bridge: RwLock<Option<Arc<dyn OutBridge>>>,
}

impl Router {
    /// Create a router serving `domain`, resolving accounts via `storage`.
    pub fn new(domain: impl Into<String>, storage: Arc<dyn Storage>) -> Self {
        Self {
            domain: domain.into(),
            storage,
            bound: DashMap::new(),
            bind_seq: AtomicU64::new(0),
            components: DashMap::new(),
            blocklists: DashMap::new(),
            bridge: RwLock::new(None),
        }
    }

    /// The locally served domain.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Whether `domain` is served locally.
    pub fn is_local_domain(&self, domain: &str) -> bool {
        domain == self.domain
    }

    /// Register the outbound bridge toward remote domains.
    pub fn set_out_bridge(&self, bridge: Arc<dyn OutBridge>) {
        *self.bridge.write().expect("bridge lock") = Some(bridge);
    }

    /// Register a component under its domain.
    pub fn register_component(&self, component: Arc<dyn Component>) {
        self.components
            .insert(component.host().to_string(), component);
    }

    /// Look up the component serving `domain`, if any.
    pub fn component(&self, domain: &str) -> Option<Arc<dyn Component>> {
        self.components.get(domain).map(|c| Arc::clone(&c))
    }

    /// Replace the blocklist view of `username`.
    pub fn set_blocklist(&self, username: &str, items: Vec<Jid>) {
        if items.is_empty() {
            self.blocklists.remove(username);
        } else {
            self.blocklists.insert(username.to_string(), items);
        }
    }

    /// Whether `jid` is blocked for `username` (XEP-0191 match semantics).
    pub fn is_blocked_jid(&self, jid: &Jid, username: &str) -> bool {
        match self.blocklists.get(username) {
            Some(items) => items.iter().any(|item| blocklist_item_matches(item, jid)),
            None => false,
        }
    }

    /// Insert a stream under its (bare JID, resource) key.
    ///
    /// Fails when the key is already taken; the stream state machine applies
    /// the conflict policy before calling in.
    pub fn bind(&self, stream: Arc<dyn C2sStream>) -> Result<(), crate::error::XmppError> {
        let jid = stream.jid();
        let key = jid.to_bare().to_string();
        let resource = stream.resource();

        let mut entry = self.bound.entry(key.clone()).or_default();
        if entry.iter().any(|b| b.resource == resource) {
            return Err(crate::error::XmppError::internal(format!(
                "resource already bound: {}",
                jid
            )));
        }
        let seq = self.bind_seq.fetch_add(1, Ordering::Relaxed);
        entry.push(BoundResource {
            resource,
            stream_id: stream.id().to_string(),
            seq,
            stream,
        });
        debug!(jid = %jid, "bound stream");
        Ok(())
    }

    /// Remove a stream from the registry. Idempotent.
    pub fn unbind(&self, stream: &dyn C2sStream) {
        let key = stream.jid().to_bare().to_string();
        let id = stream.id().to_string();
        if let Some(mut entry) = self.bound.get_mut(&key) {
            entry.retain(|b| b.stream_id != id);
        }
        self.bound.remove_if(&key, |_, entries| entries.is_empty());
    }

    /// Snapshot of every stream bound for `username`, in bind order.
    pub fn user_streams(&self, username: &str) -> Vec<Arc<dyn C2sStream>> {
        let key = format!("{}@{}", username, self.domain);
        match self.bound.get(&key) {
            Some(entry) => entry.iter().map(|b| Arc::clone(&b.stream)).collect(),
            None => Vec::new(),
        }
    }

    /// Route a stanza toward its recipient.
    pub async fn route(&self, stanza: &Stanza) -> Result<(), RouteError> {
        let to = stanza.to_jid().clone();
        let domain = to.domain_str().to_string();

        if let Some(component) = self.component(&domain) {
            component.process_stanza(stanza.clone()).await;
            return Ok(());
        }
        if !self.is_local_domain(&domain) {
            let bridge = self.bridge.read().expect("bridge lock").clone();
            return match bridge {
                Some(bridge) => bridge.route_stanza(stanza).await,
                None => Err(RouteError::FailedRemoteConnect),
            };
        }

        let node = match to.node_str() {
            Some(node) => node.to_string(),
            None => return Err(RouteError::NotExistingAccount),
        };
        if self.is_blocked_jid(stanza.from_jid(), &node) {
            return Err(RouteError::BlockedJid);
        }

        let key = format!("{}@{}", node, domain);
        let targets: Vec<(String, u64, Arc<dyn C2sStream>)> = match self.bound.get(&key) {
            Some(entry) => entry
                .iter()
                .map(|b| (b.resource.clone(), b.seq, Arc::clone(&b.stream)))
                .collect(),
            None => Vec::new(),
        };

        if targets.is_empty() {
            return match self.storage.fetch_user(&node).await {
                Ok(Some(_)) => Err(RouteError::NotAuthenticated),
                Ok(None) => Err(RouteError::NotExistingAccount),
                Err(e) => {
                    warn!(error = %e, username = %node, "account lookup failed during routing");
                    Err(RouteError::NotAuthenticated)
                }
            };
        }

        match to.resource_str() {
            Some(resource) => {
                let target = targets.iter().find(|(r, _, _)| r == resource);
                match target {
                    Some((_, _, stream)) => {
                        stream.send_element(stanza.element().clone()).await;
                        Ok(())
                    }
                    None => Err(RouteError::ResourceNotFound),
                }
            }
            None => self.route_to_bare(stanza, targets).await,
        }
    }

    /// Bare-JID delivery: only messages with a body are delivered, to the
    /// available resource with the greatest non-negative priority; ties go
    /// to the most recent bind. Everything else reports the account as
    /// having no eligible stream.
    async fn route_to_bare(
        &self,
        stanza: &Stanza,
        targets: Vec<(String, u64, Arc<dyn C2sStream>)>,
    ) -> Result<(), RouteError> {
        let message = match stanza {
            Stanza::Message(message) if message.has_body() => message,
            _ => return Err(RouteError::NotAuthenticated),
        };

        let mut best: Option<(i8, u64, &Arc<dyn C2sStream>)> = None;
        for (_, seq, stream) in &targets {
            let presence = match stream.presence() {
                Some(presence) if presence.is_available() => presence,
                _ => continue,
            };
            let priority = presence.priority();
            if priority < 0 {
                continue;
            }
            let better = match best {
                None => true,
                Some((best_priority, best_seq, _)) => {
                    priority > best_priority || (priority == best_priority && *seq > best_seq)
                }
            };
            if better {
                best = Some((priority, *seq, stream));
            }
        }
        match best {
            Some((_, _, stream)) => {
                stream.send_element(message.element().clone()).await;
                Ok(())
            }
            None => Err(RouteError::NotAuthenticated),
        }
    }
}

/// XEP-0191 blocklist item matching: full JID, bare JID, domain/resource,
/// or whole domain, depending on which parts the item carries.
fn blocklist_item_matches(item: &Jid, jid: &Jid) -> bool {
    if item.is_full_with_user() {
        item == jid
    } else if item.node().is_some() {
        item.matches_bare(jid)
    } else if let Some(resource) = item.resource_str() {
        item.domain() == jid.domain() && Some(resource) == jid.resource_str()
    } else {
        item.domain() == jid.domain()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StreamErrorCondition;
    use crate::stanza::{Message, Presence, PresenceType};
    use crate::storage::{MemoryStorage, User};
    use minidom::Element;
    use std::sync::Mutex;

    /// Stand-in stream recording what was delivered to it.
    struct StubStream {
        id: String,
        jid: Jid,
        presence: Mutex<Option<Presence>>,
        sent: Mutex<Vec<Element>>,
    }

    impl StubStream {
        fn new(id: &str, jid: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                jid: jid.parse().unwrap(),
                presence: Mutex::new(None),
                sent: Mutex::new(Vec::new()),
            })
        }

        fn set_presence(&self, priority: i8) {
            let mut elem = Element::builder("presence", crate::xml::ns::CLIENT).build();
            let mut prio = Element::builder("priority", crate::xml::ns::CLIENT).build();
            prio.append_text_node(priority.to_string());
            elem.append_child(prio);
            let presence = Presence::from_element(elem, self.jid.clone(), self.jid.bare()).unwrap();
            *self.presence.lock().unwrap() = Some(presence);
        }

        fn sent_count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl C2sStream for StubStream {
        fn id(&self) -> &str {
            &self.id
        }

        fn username(&self) -> String {
            self.jid.node_str().unwrap_or("").to_string()
        }

        fn domain(&self) -> String {
            self.jid.domain_str().to_string()
        }

        fn resource(&self) -> String {
            self.jid.resource_str().unwrap_or("").to_string()
        }

        fn jid(&self) -> Jid {
            self.jid.clone()
        }

        fn is_secured(&self) -> bool {
            true
        }

        fn is_authenticated(&self) -> bool {
            true
        }

        fn is_compressed(&self) -> bool {
            false
        }

        fn presence(&self) -> Option<Presence> {
            self.presence.lock().unwrap().clone()
        }

        async fn send_element(&self, elem: Element) {
            self.sent.lock().unwrap().push(elem);
        }

        async fn disconnect(&self, _error: Option<StreamErrorCondition>) {}
    }

    fn router_with_user() -> Router {
        let storage = MemoryStorage::new();
        storage.insert_user(User::new("ortuman", "pwd"));
        storage.insert_user(User::new("noelia", "pwd"));
        Router::new("jackal.im", Arc::new(storage))
    }

    fn chat_message(from: &str, to: &str) -> Stanza {
        let elem: Element = format!(
            "<message xmlns='jabber:client' type='chat' from='{}' to='{}'><body>hi</body></message>",
            from, to
        )
        .parse()
        .unwrap();
        Stanza::Message(
            Message::from_element(elem, from.parse().unwrap(), to.parse().unwrap()).unwrap(),
        )
    }

    #[tokio::test]
    async fn bind_rejects_duplicate_resource() {
        let router = router_with_user();
        let s1 = StubStream::new("s1", "ortuman@jackal.im/home");
        let s2 = StubStream::new("s2", "ortuman@jackal.im/home");

        router.bind(s1).unwrap();
        assert!(router.bind(s2).is_err());
    }

    #[tokio::test]
    async fn unbind_is_idempotent() {
        let router = router_with_user();
        let s1 = StubStream::new("s1", "ortuman@jackal.im/home");
        router.bind(Arc::clone(&s1) as Arc<dyn C2sStream>).unwrap();

        router.unbind(s1.as_ref());
        router.unbind(s1.as_ref());
        assert!(router.user_streams("ortuman").is_empty());
    }

    #[tokio::test]
    async fn routes_to_full_jid() {
        let router = router_with_user();
        let s1 = StubStream::new("s1", "ortuman@jackal.im/balcony");
        router.bind(Arc::clone(&s1) as Arc<dyn C2sStream>).unwrap();

        router
            .route(&chat_message(
                "noelia@jackal.im/chamber",
                "ortuman@jackal.im/balcony",
            ))
            .await
            .unwrap();
        assert_eq!(s1.sent_count(), 1);
    }

    #[tokio::test]
    async fn unknown_resource_reports_resource_not_found() {
        let router = router_with_user();
        let s1 = StubStream::new("s1", "ortuman@jackal.im/balcony");
        router.bind(s1).unwrap();

        let err = router
            .route(&chat_message(
                "noelia@jackal.im/chamber",
                "ortuman@jackal.im/yard",
            ))
            .await
            .unwrap_err();
        assert_eq!(err, RouteError::ResourceNotFound);
    }

    #[tokio::test]
    async fn offline_user_reports_not_authenticated() {
        let router = router_with_user();
        let err = router
            .route(&chat_message(
                "noelia@jackal.im/chamber",
                "ortuman@jackal.im",
            ))
            .await
            .unwrap_err();
        assert_eq!(err, RouteError::NotAuthenticated);
    }

    #[tokio::test]
    async fn unknown_account_reports_not_existing() {
        let router = router_with_user();
        let err = router
            .route(&chat_message("noelia@jackal.im/chamber", "ghost@jackal.im"))
            .await
            .unwrap_err();
        assert_eq!(err, RouteError::NotExistingAccount);
    }

    #[tokio::test]
    async fn remote_domain_without_bridge_fails() {
        let router = router_with_user();
        let err = router
            .route(&chat_message("ortuman@jackal.im/balcony", "user@remote.im"))
            .await
            .unwrap_err();
        assert_eq!(err, RouteError::FailedRemoteConnect);
    }

    #[tokio::test]
    async fn bare_jid_message_prefers_highest_priority() {
        let router = router_with_user();
        let low = StubStream::new("s1", "ortuman@jackal.im/low");
        let high = StubStream::new("s2", "ortuman@jackal.im/high");
        low.set_presence(1);
        high.set_presence(10);
        router.bind(Arc::clone(&low) as Arc<dyn C2sStream>).unwrap();
        router.bind(Arc::clone(&high) as Arc<dyn C2sStream>).unwrap();

        router
            .route(&chat_message(
                "noelia@jackal.im/chamber",
                "ortuman@jackal.im",
            ))
            .await
            .unwrap();
        assert_eq!(high.sent_count(), 1);
        assert_eq!(low.sent_count(), 0);
    }

    #[tokio::test]
    async fn bare_jid_priority_tie_goes_to_most_recent_bind() {
        let router = router_with_user();
        let first = StubStream::new("s1", "ortuman@jackal.im/first");
        let second = StubStream::new("s2", "ortuman@jackal.im/second");
        first.set_presence(5);
        second.set_presence(5);
        router.bind(Arc::clone(&first) as Arc<dyn C2sStream>).unwrap();
        router.bind(Arc::clone(&second) as Arc<dyn C2sStream>).unwrap();

        router
            .route(&chat_message(
                "noelia@jackal.im/chamber",
                "ortuman@jackal.im",
            ))
            .await
            .unwrap();
        assert_eq!(second.sent_count(), 1);
        assert_eq!(first.sent_count(), 0);
    }

    #[tokio::test]
    async fn negative_priority_never_receives_bare_messages() {
        let router = router_with_user();
        let s1 = StubStream::new("s1", "ortuman@jackal.im/hidden");
        s1.set_presence(-1);
        router.bind(Arc::clone(&s1) as Arc<dyn C2sStream>).unwrap();

        let err = router
            .route(&chat_message(
                "noelia@jackal.im/chamber",
                "ortuman@jackal.im",
            ))
            .await
            .unwrap_err();
        assert_eq!(err, RouteError::NotAuthenticated);
        assert_eq!(s1.sent_count(), 0);
    }

    #[tokio::test]
    async fn blocked_sender_reports_blocked_jid() {
        let router = router_with_user();
        let s1 = StubStream::new("s1", "ortuman@jackal.im/balcony");
        router.bind(s1).unwrap();
        router.set_blocklist("ortuman", vec!["noelia@jackal.im".parse().unwrap()]);

        let err = router
            .route(&chat_message(
                "noelia@jackal.im/chamber",
                "ortuman@jackal.im/balcony",
            ))
            .await
            .unwrap_err();
        assert_eq!(err, RouteError::BlockedJid);
    }

    #[tokio::test]
    async fn component_takes_matching_domain() {
        struct EchoComponent {
            received: Mutex<usize>,
        }

        #[async_trait]
        impl Component for EchoComponent {
            fn host(&self) -> &str {
                "upload.jackal.im"
            }

            async fn process_stanza(&self, _stanza: Stanza) {
                *self.received.lock().unwrap() += 1;
            }
        }

        let router = router_with_user();
        let component = Arc::new(EchoComponent {
            received: Mutex::new(0),
        });
        router.register_component(Arc::clone(&component) as Arc<dyn Component>);

        router
            .route(&chat_message(
                "ortuman@jackal.im/balcony",
                "upload.jackal.im",
            ))
            .await
            .unwrap();
        assert_eq!(*component.received.lock().unwrap(), 1);
    }

    #[test]
    fn blocklist_match_semantics() {
        let full: Jid = "ortuman@jackal.im/balcony".parse().unwrap();
        assert!(blocklist_item_matches(
            &"ortuman@jackal.im/balcony".parse().unwrap(),
            &full
        ));
        assert!(!blocklist_item_matches(
            &"ortuman@jackal.im/yard".parse().unwrap(),
            &full
        ));
        assert!(blocklist_item_matches(
            &"ortuman@jackal.im".parse().unwrap(),
            &full
        ));
        assert!(blocklist_item_matches(&"jackal.im".parse().unwrap(), &full));
        assert!(blocklist_item_matches(
            &"jackal.im/balcony".parse().unwrap(),
            &full
        ));
        assert!(!blocklist_item_matches(
            &"jackal.im/yard".parse().unwrap(),
            &full
        ));
        assert!(!blocklist_item_matches(&"other.im".parse().unwrap(), &full));
    }
}
