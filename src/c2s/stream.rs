//! The per-connection XMPP stream state machine.
//!
//! Each stream is one actor task `select!`ing over the session's inbound
//! frames and an op mailbox. Every piece of stream state is mutated on that
//! task alone; the state word and the context record are readable from
//! outside through atomics and locks.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use jid::Jid;
use minidom::Element;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::C2sStream;
use crate::auth::{authenticators_from_config, failure_element, Authenticator};
use crate::config::{C2sConfig, ResourceConflict};
use crate::context::{StateCell, StreamContext, StreamState};
use crate::error::{SaslErrorCondition, StanzaErrorCondition, StreamErrorCondition};
use crate::module::{offline::Offline, roster::Roster, Modules};
use crate::router::{RouteError, Router};
use crate::session::{Frame, Session, SessionError};
use crate::stanza::{Iq, JidExt, Message, Presence, PresenceType, Stanza};
use crate::storage::Storage;
use crate::transport::{Transport, TransportKind};
use crate::xml::{self, ns};

const STREAM_MAILBOX_SIZE: usize = 256;

enum StreamOp {
    SendElement(Element),
    Disconnect {
        error: Option<StreamErrorCondition>,
        ack: oneshot::Sender<()>,
    },
    ConnectTimeout,
}

/// Handle to a live client stream.
///
/// This is what the router, modules and the supervisor hold; the actor task
/// owns everything else.
pub struct LocalStream {
    id: String,
    ctx: Arc<StreamContext>,
    state: Arc<StateCell>,
    tx: mpsc::Sender<StreamOp>,
}

impl LocalStream {
    pub(crate) fn spawn(
        transport: Box<dyn Transport>,
        cfg: Arc<C2sConfig>,
        router: Arc<Router>,
        storage: Arc<dyn Storage>,
        modules: Arc<Modules>,
        container: Arc<DashMap<String, Arc<LocalStream>>>,
    ) -> Arc<Self> {
        let id = format!("c2s:{}", uuid::Uuid::new_v4());
        let secured = transport.kind() != TransportKind::Socket;
        let server_jid: Jid = cfg
            .domain
            .parse()
            .unwrap_or_else(|_| Jid::new("invalid.invalid").expect("static JID"));
        let ctx = Arc::new(StreamContext::new(server_jid, secured));
        let state = Arc::new(StateCell::new(StreamState::Connecting));
        let (tx, rx) = mpsc::channel(STREAM_MAILBOX_SIZE);

        let handle = Arc::new(Self {
            id: id.clone(),
            ctx: Arc::clone(&ctx),
            state: Arc::clone(&state),
            tx: tx.clone(),
        });
        container.insert(id.clone(), Arc::clone(&handle));

        let session = Session::new(transport, cfg.domain.clone(), cfg.max_stanza_size);
        let authenticators = authenticators_from_config(&cfg.sasl, &storage);

        let connect_timer = if cfg.connect_timeout_secs > 0 {
            let timeout = Duration::from_secs(cfg.connect_timeout_secs);
            let timer_tx = tx;
            Some(tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let _ = timer_tx.send(StreamOp::ConnectTimeout).await;
            }))
        } else {
            None
        };

        let driver = StreamDriver {
            handle: Arc::clone(&handle),
            cfg,
            sess: session,
            router,
            storage,
            modules,
            container,
            ctx,
            state,
            authenticators,
            active_auth: None,
            offline: None,
            roster: None,
            connect_timer,
        };
        tokio::spawn(driver.run(rx));

        handle
    }

    /// Current state word.
    pub fn state(&self) -> StreamState {
        self.state.get()
    }

    /// Token cancelled when the stream reaches `Disconnected`.
    pub fn done(&self) -> CancellationToken {
        self.ctx.done()
    }
}

#[async_trait]
impl C2sStream for LocalStream {
    fn id(&self) -> &str {
        &self.id
    }

    fn username(&self) -> String {
        self.ctx.username()
    }

    fn domain(&self) -> String {
        self.ctx.domain()
    }

    fn resource(&self) -> String {
        self.ctx.resource()
    }

    fn jid(&self) -> Jid {
        self.ctx.jid()
    }

    fn is_secured(&self) -> bool {
        self.ctx.is_secured()
    }

    fn is_authenticated(&self) -> bool {
        self.ctx.is_authenticated()
    }

    fn is_compressed(&self) -> bool {
        self.ctx.is_compressed()
    }

    fn presence(&self) -> Option<Presence> {
        self.ctx.presence()
    }

    async fn send_element(&self, elem: Element) {
        if self.state.get() == StreamState::Disconnected {
            return;
        }
        let _ = self.tx.send(StreamOp::SendElement(elem)).await;
    }

    async fn disconnect(&self, error: Option<StreamErrorCondition>) {
        if self.state.get() == StreamState::Disconnected {
            return;
        }
        let (ack, done) = oneshot::channel();
        if self
            .tx
            .send(StreamOp::Disconnect { error, ack })
            .await
            .is_ok()
        {
            let _ = done.await;
        }
    }
}

/// Owner of all mutable stream state; runs as the stream's actor.
struct StreamDriver {
    handle: Arc<LocalStream>,
    cfg: Arc<C2sConfig>,
    sess: Session,
    router: Arc<Router>,
    storage: Arc<dyn Storage>,
    modules: Arc<Modules>,
    container: Arc<DashMap<String, Arc<LocalStream>>>,
    ctx: Arc<StreamContext>,
    state: Arc<StateCell>,
    authenticators: Vec<Box<dyn Authenticator>>,
    active_auth: Option<usize>,
    offline: Option<Arc<Offline>>,
    roster: Option<Arc<Roster>>,
    connect_timer: Option<JoinHandle<()>>,
}

impl StreamDriver {
    async fn run(mut self, mut rx: mpsc::Receiver<StreamOp>) {
        enum Event {
            Op(Option<StreamOp>),
            Inbound(Result<Frame, SessionError>),
        }
        loop {
            let event = tokio::select! {
                op = rx.recv() => Event::Op(op),
                received = self.sess.receive() => Event::Inbound(received),
            };
            match event {
                Event::Op(Some(StreamOp::SendElement(elem))) => self.write_element(&elem).await,
                Event::Op(Some(StreamOp::Disconnect { error, ack })) => {
                    self.disconnect(error).await;
                    let _ = ack.send(());
                }
                Event::Op(Some(StreamOp::ConnectTimeout)) => {
                    self.disconnect(Some(StreamErrorCondition::ConnectionTimeout))
                        .await;
                }
                Event::Op(None) => return,
                Event::Inbound(Ok(frame)) => self.handle_frame(frame).await,
                Event::Inbound(Err(err)) => self.handle_session_error(err).await,
            }
            if self.state.get() == StreamState::Disconnected {
                return;
            }
        }
    }

    async fn handle_frame(&mut self, frame: Frame) {
        match self.state.get() {
            StreamState::Connecting => self.handle_connecting(frame).await,
            StreamState::Connected => self.handle_connected(frame).await,
            StreamState::Authenticating => self.handle_authenticating(frame).await,
            StreamState::Authenticated => self.handle_authenticated(frame).await,
            StreamState::SessionStarted => self.handle_session_started(frame).await,
            StreamState::Disconnected => {}
        }
    }

    // connecting: only a stream open envelope is acceptable.
    async fn handle_connecting(&mut self, frame: Frame) {
        if let Some(timer) = self.connect_timer.take() {
            timer.abort();
        }
        let header = match frame {
            Frame::Open(header) => header,
            _ => {
                self.disconnect_with_stream_error(StreamErrorCondition::BadFormat)
                    .await;
                return;
            }
        };
        let domain = header.to.unwrap_or_default();
        if domain != self.cfg.domain {
            self.disconnect_with_stream_error(StreamErrorCondition::HostUnknown)
                .await;
            return;
        }
        self.ctx.set_domain(&domain);

        let jid: Jid = domain.parse().expect("validated domain");
        self.ctx.set_jid(jid.clone());
        self.sess.set_jid(jid);

        if let Err(e) = self.sess.open().await {
            debug!(stream_id = %self.handle.id, error = %e, "failed to open stream envelope");
        }

        let mut features = format!("<stream:features xmlns:stream='{}' version='1.0'>", ns::STREAM);
        if !self.ctx.is_authenticated() {
            features.push_str(&self.unauthenticated_features());
            self.state.set(StreamState::Connected);
        } else {
            features.push_str(&self.authenticated_features());
            self.state.set(StreamState::Authenticated);
        }
        features.push_str("</stream:features>");
        if let Err(e) = self.sess.send_raw(&features).await {
            debug!(stream_id = %self.handle.id, error = %e, "failed to send stream features");
        }
    }

    fn unauthenticated_features(&self) -> String {
        let mut features = String::new();
        let is_socket = self.sess.transport_kind() == TransportKind::Socket;

        if is_socket && !self.ctx.is_secured() {
            features.push_str(&format!(
                "<starttls xmlns='{}'><required/></starttls>",
                ns::TLS
            ));
        }

        // never offer SASL over an insecure socket
        let offer_sasl = !is_socket || self.ctx.is_secured();
        if offer_sasl && !self.authenticators.is_empty() {
            features.push_str(&format!("<mechanisms xmlns='{}'>", ns::SASL));
            for authenticator in &self.authenticators {
                features.push_str(&format!(
                    "<mechanism>{}</mechanism>",
                    authenticator.mechanism()
                ));
            }
            features.push_str("</mechanisms>");
        }
        features
    }

    fn authenticated_features(&self) -> String {
        let mut features = String::new();
        let is_socket = self.sess.transport_kind() == TransportKind::Socket;

        let compression_available =
            is_socket && self.cfg.compression.level != crate::transport::CompressionLevel::None;
        if !self.ctx.is_compressed() && compression_available {
            features.push_str(&format!(
                "<compression xmlns='{}'><method>zlib</method></compression>",
                ns::COMPRESS
            ));
        }
        features.push_str(&format!("<bind xmlns='{}'><required/></bind>", ns::BIND));
        features.push_str(&format!("<session xmlns='{}'/>", ns::SESSION));
        features
    }

    async fn handle_connected(&mut self, frame: Frame) {
        match frame {
            Frame::Element(elem) => match elem.name() {
                "starttls" => self.proceed_start_tls(&elem).await,
                "auth" => self.start_authentication(&elem).await,
                _ => {
                    self.disconnect_with_stream_error(StreamErrorCondition::UnsupportedStanzaType)
                        .await;
                }
            },
            Frame::Stanza(Stanza::Iq(iq)) => {
                // non-SASL authentication is not allowed
                self.write_element(&iq.error(StanzaErrorCondition::ServiceUnavailable))
                    .await;
            }
            Frame::Stanza(_) => {
                self.disconnect_with_stream_error(StreamErrorCondition::NotAuthorized)
                    .await;
            }
            Frame::Open(_) => {
                self.disconnect_with_stream_error(StreamErrorCondition::BadFormat)
                    .await;
            }
        }
    }

    async fn handle_authenticating(&mut self, frame: Frame) {
        let elem = match frame {
            Frame::Element(elem) if elem.ns() == ns::SASL => elem,
            _ => {
                self.disconnect_with_stream_error(StreamErrorCondition::InvalidNamespace)
                    .await;
                return;
            }
        };
        let idx = match self.active_auth {
            Some(idx) => idx,
            None => {
                self.disconnect_with_stream_error(StreamErrorCondition::UndefinedCondition)
                    .await;
                return;
            }
        };
        if self.continue_authentication(&elem, idx).await.is_err() {
            return;
        }
        if self.authenticators[idx].authenticated() {
            let username = self.authenticators[idx].username();
            self.finish_authentication(&username);
        }
    }

    async fn handle_authenticated(&mut self, frame: Frame) {
        match frame {
            Frame::Element(elem) if elem.name() == "compress" => {
                if elem.ns() != ns::COMPRESS {
                    self.disconnect_with_stream_error(StreamErrorCondition::UnsupportedStanzaType)
                        .await;
                    return;
                }
                self.compress(&elem).await;
            }
            Frame::Stanza(Stanza::Iq(iq)) => {
                if self.ctx.resource().is_empty() {
                    self.bind_resource(&iq).await;
                } else {
                    self.start_session(&iq).await;
                }
            }
            _ => {
                self.disconnect_with_stream_error(StreamErrorCondition::UnsupportedStanzaType)
                    .await;
            }
        }
    }

    async fn handle_session_started(&mut self, frame: Frame) {
        let stanza = match frame {
            Frame::Stanza(stanza) => stanza,
            _ => {
                self.disconnect_with_stream_error(StreamErrorCondition::UnsupportedStanzaType)
                    .await;
                return;
            }
        };
        if let Some(component) = self.router.component(stanza.to_jid().domain_str()) {
            component.process_stanza(stanza).await;
        } else {
            self.process_stanza(stanza).await;
        }
    }

    async fn proceed_start_tls(&mut self, elem: &Element) {
        if self.ctx.is_secured() {
            self.disconnect_with_stream_error(StreamErrorCondition::NotAuthorized)
                .await;
            return;
        }
        if elem.ns() != ns::TLS {
            self.disconnect_with_stream_error(StreamErrorCondition::InvalidNamespace)
                .await;
            return;
        }
        let tls_config = match &self.cfg.tls {
            Some(tls_config) => Arc::clone(tls_config),
            None => {
                let _ = self
                    .sess
                    .send_raw(&format!("<failure xmlns='{}'/>", ns::TLS))
                    .await;
                self.disconnect(None).await;
                return;
            }
        };
        self.ctx.set_secured(true);

        let proceed = Element::builder("proceed", ns::TLS).build();
        self.write_element(&proceed).await;

        if let Err(e) = self.sess.start_tls(tls_config).await {
            error!(stream_id = %self.handle.id, error = %e, "TLS upgrade failed");
            self.disconnect_with_stream_error(StreamErrorCondition::UndefinedCondition)
                .await;
            return;
        }
        info!(stream_id = %self.handle.id, "secured stream");
        self.restart_session();
    }

    async fn compress(&mut self, elem: &Element) {
        if self.ctx.is_compressed() {
            self.disconnect_with_stream_error(StreamErrorCondition::UnsupportedStanzaType)
                .await;
            return;
        }
        let method = elem
            .get_child("method", ns::COMPRESS)
            .map(|m| m.text())
            .unwrap_or_default();
        if method.is_empty() {
            let failure = compression_failure("setup-failed");
            self.write_element(&failure).await;
            return;
        }
        if method != "zlib" {
            let failure = compression_failure("unsupported-method");
            self.write_element(&failure).await;
            return;
        }
        self.ctx.set_compressed(true);

        let compressed = Element::builder("compressed", ns::COMPRESS).build();
        self.write_element(&compressed).await;

        if let Err(e) = self.sess.enable_compression(self.cfg.compression.level).await {
            error!(stream_id = %self.handle.id, error = %e, "compression upgrade failed");
            self.disconnect_with_stream_error(StreamErrorCondition::UndefinedCondition)
                .await;
            return;
        }
        info!(stream_id = %self.handle.id, "compressed stream");
        self.restart_session();
    }

    async fn start_authentication(&mut self, elem: &Element) {
        if elem.ns() != ns::SASL {
            self.disconnect_with_stream_error(StreamErrorCondition::InvalidNamespace)
                .await;
            return;
        }
        let mechanism = elem.attr("mechanism").unwrap_or_default().to_string();
        let idx = self
            .authenticators
            .iter()
            .position(|a| a.mechanism() == mechanism);
        let idx = match idx {
            Some(idx) => idx,
            None => {
                // mechanism not found
                let failure = failure_element(SaslErrorCondition::InvalidMechanism);
                self.write_element(&failure).await;
                return;
            }
        };
        let binding = self.sess.channel_binding();
        self.authenticators[idx].set_channel_binding(binding);

        if self.continue_authentication(elem, idx).await.is_err() {
            return;
        }
        if self.authenticators[idx].authenticated() {
            let username = self.authenticators[idx].username();
            self.finish_authentication(&username);
        } else {
            self.active_auth = Some(idx);
            self.state.set(StreamState::Authenticating);
        }
    }

    async fn continue_authentication(&mut self, elem: &Element, idx: usize) -> Result<(), ()> {
        match self.authenticators[idx].process_element(elem).await {
            Ok(Some(reply)) => {
                self.write_element(&reply).await;
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(err) => {
                if let crate::auth::AuthError::Other(e) = &err {
                    error!(stream_id = %self.handle.id, error = %e, "authentication failed unexpectedly");
                }
                self.fail_authentication(idx, err.condition()).await;
                Err(())
            }
        }
    }

    fn finish_authentication(&mut self, username: &str) {
        if let Some(idx) = self.active_auth.take() {
            self.authenticators[idx].reset();
        }
        let jid: Jid = format!("{}@{}", username, self.ctx.domain())
            .parse()
            .unwrap_or_else(|_| self.ctx.jid());

        self.ctx.set_username(username);
        self.ctx.set_authenticated(true);
        self.ctx.set_jid(jid);

        info!(stream_id = %self.handle.id, username = %username, "authenticated stream");
        self.restart_session();
    }

    async fn fail_authentication(&mut self, idx: usize, condition: SaslErrorCondition) {
        let failure = failure_element(condition);
        self.write_element(&failure).await;

        self.authenticators[idx].reset();
        self.active_auth = None;
        self.state.set(StreamState::Connected);
    }

    async fn bind_resource(&mut self, iq: &Iq) {
        let bind = match iq.payload("bind", ns::BIND) {
            Some(bind) => bind,
            None => {
                self.write_element(&iq.error(StanzaErrorCondition::NotAllowed))
                    .await;
                return;
            }
        };
        let mut resource = bind
            .get_child("resource", ns::BIND)
            .map(|r| r.text())
            .unwrap_or_default();
        if resource.is_empty() {
            resource = uuid::Uuid::new_v4().to_string();
        }

        // conflict detection against the user's bound streams
        let held = self
            .router
            .user_streams(&self.ctx.username())
            .into_iter()
            .find(|s| s.resource() == resource);
        if let Some(held) = held {
            match self.cfg.resource_conflict {
                ResourceConflict::Override => {
                    resource = uuid::Uuid::new_v4().to_string();
                }
                ResourceConflict::Replace => {
                    held.disconnect(Some(StreamErrorCondition::ResourceConstraint))
                        .await;
                }
                ResourceConflict::Reject => {
                    self.write_element(&iq.error(StanzaErrorCondition::Conflict))
                        .await;
                    return;
                }
            }
        }

        let user_jid: Jid = match format!(
            "{}@{}/{}",
            self.ctx.username(),
            self.ctx.domain(),
            resource
        )
        .parse()
        {
            Ok(jid) => jid,
            Err(_) => {
                self.write_element(&iq.error(StanzaErrorCondition::BadRequest))
                    .await;
                return;
            }
        };
        self.ctx.set_resource(&resource);
        self.ctx.set_jid(user_jid.clone());
        self.sess.set_jid(user_jid.clone());

        if let Err(e) = self.router.bind(Arc::clone(&self.handle) as Arc<dyn C2sStream>) {
            warn!(stream_id = %self.handle.id, error = %e, "bind race lost");
            self.write_element(&iq.error(StanzaErrorCondition::Conflict))
                .await;
            return;
        }

        let mut bound = Element::builder("bind", ns::BIND).build();
        let mut jid_el = Element::builder("jid", ns::BIND).build();
        jid_el.append_text_node(user_jid.to_string());
        bound.append_child(jid_el);
        self.write_element(&iq.result_with(bound)).await;

        info!(stream_id = %self.handle.id, jid = %user_jid, "bound stream resource");
    }

    async fn start_session(&mut self, iq: &Iq) {
        if self.ctx.resource().is_empty() {
            self.disconnect_with_stream_error(StreamErrorCondition::NotAuthorized)
                .await;
            return;
        }
        if iq.payload("session", ns::SESSION).is_none() {
            self.write_element(&iq.error(StanzaErrorCondition::NotAllowed))
                .await;
            return;
        }
        self.write_element(&iq.result()).await;

        // per-stream modules become live now
        if self.cfg.modules.is_enabled("offline") {
            self.offline = Some(Offline::new(
                self.cfg.offline.clone(),
                Arc::clone(&self.handle) as Arc<dyn C2sStream>,
                Arc::clone(&self.storage),
                self.ctx.done(),
            ));
        }
        if self.cfg.modules.is_enabled("roster") {
            self.roster = Some(Roster::new(
                Arc::clone(&self.handle) as Arc<dyn C2sStream>,
                Arc::clone(&self.router),
                self.ctx.done(),
            ));
        }
        self.state.set(StreamState::SessionStarted);
        info!(stream_id = %self.handle.id, jid = %self.ctx.jid(), "session started");
    }

    async fn process_stanza(&mut self, stanza: Stanza) {
        let to = stanza.to_jid().clone();
        if self.is_blocked_jid(&to) {
            let blocked = Element::builder("blocked", ns::BLOCKING_ERRORS).build();
            let response = xml::error_response(
                stanza.element(),
                StanzaErrorCondition::NotAcceptable,
                vec![blocked],
            );
            self.write_element(&response).await;
            return;
        }
        match stanza {
            Stanza::Presence(presence) => self.process_presence(presence).await,
            Stanza::Iq(iq) => self.process_iq(iq).await,
            Stanza::Message(message) => self.process_message(message).await,
        }
    }

    async fn process_iq(&mut self, iq: Iq) {
        let to = iq.to_jid().clone();

        let reply_on_behalf =
            !to.is_full_with_user() && self.router.is_local_domain(to.domain_str());
        if !reply_on_behalf {
            match self.router.route(&Stanza::Iq(iq.clone())).await {
                Ok(()) => {}
                Err(RouteError::ResourceNotFound) => {
                    self.write_element(&iq.error(StanzaErrorCondition::ServiceUnavailable))
                        .await;
                }
                Err(RouteError::FailedRemoteConnect) => {
                    self.write_element(&iq.error(StanzaErrorCondition::RemoteServerNotFound))
                        .await;
                }
                Err(RouteError::BlockedJid) => {
                    // destination user blocks the sender
                    if iq.is_get() || iq.is_set() {
                        self.write_element(&iq.error(StanzaErrorCondition::ServiceUnavailable))
                            .await;
                    }
                }
                Err(_) => {}
            }
            return;
        }
        for handler in self.modules.iq_handlers() {
            if !handler.matches_iq(&iq) {
                continue;
            }
            handler.process_iq(iq).await;
            return;
        }

        // IQ not handled
        if iq.is_get() || iq.is_set() {
            self.write_element(&iq.error(StanzaErrorCondition::ServiceUnavailable))
                .await;
        }
    }

    async fn process_presence(&mut self, presence: Presence) {
        let to = presence.to_jid().clone();
        if to.is_full_with_user() {
            let _ = self.router.route(&Stanza::Presence(presence)).await;
            return;
        }
        let reply_on_behalf = self.ctx.jid().matches_bare(&to);

        // cache last self-addressed availability
        if reply_on_behalf && (presence.is_available() || presence.is_unavailable()) {
            self.ctx.set_presence(presence.clone());
        }
        if let Some(roster) = &self.roster {
            roster.process_presence(presence.clone()).await;
        }
        // first available presence with non-negative priority delivers the
        // offline queue, once per stream
        if reply_on_behalf && presence.is_available() && presence.priority() >= 0 {
            if let Some(offline) = &self.offline {
                if !self.ctx.mark_offline_delivered() {
                    offline.deliver_offline_messages().await;
                }
            }
        }
    }

    async fn process_message(&mut self, message: Message) {
        let mut message = message;
        let mut readdressed = false;
        loop {
            match self.router.route(&Stanza::Message(message.clone())).await {
                Ok(()) => return,
                Err(RouteError::NotAuthenticated) => {
                    if let Some(offline) = &self.offline {
                        let skip = !self.cfg.offline.store_chat_with_body
                            && (message.is_chat() || message.is_groupchat())
                            && message.has_body();
                        if !skip {
                            offline.archive_message(message).await;
                        }
                    }
                    return;
                }
                Err(RouteError::ResourceNotFound) if !readdressed => {
                    // retry once as if addressed to <node@domain>
                    readdressed = true;
                    message = message.readdressed_to_bare();
                }
                Err(RouteError::ResourceNotFound) => return,
                Err(RouteError::NotExistingAccount) | Err(RouteError::BlockedJid) => {
                    self.write_element(&xml::error_response(
                        message.element(),
                        StanzaErrorCondition::ServiceUnavailable,
                        vec![],
                    ))
                    .await;
                    return;
                }
                Err(RouteError::FailedRemoteConnect) => {
                    self.write_element(&xml::error_response(
                        message.element(),
                        StanzaErrorCondition::RemoteServerNotFound,
                        vec![],
                    ))
                    .await;
                    return;
                }
            }
        }
    }

    fn is_blocked_jid(&self, jid: &Jid) -> bool {
        if jid.is_server() && self.router.is_local_domain(jid.domain_str()) {
            return false;
        }
        self.router.is_blocked_jid(jid, &self.ctx.username())
    }

    async fn handle_session_error(&mut self, err: SessionError) {
        if self.state.get() == StreamState::Disconnected {
            return;
        }
        match err {
            SessionError::Closed => self.disconnect(None).await,
            SessionError::Stream(condition) => {
                self.disconnect_with_stream_error(condition).await;
            }
            SessionError::Stanza { element, condition } => {
                self.write_element(&xml::error_response(&element, condition, vec![]))
                    .await;
            }
            SessionError::Other(e) => {
                error!(stream_id = %self.handle.id, error = %e, "session failure");
                self.disconnect_with_stream_error(StreamErrorCondition::UndefinedCondition)
                    .await;
            }
        }
    }

    async fn write_element(&mut self, elem: &Element) {
        if let Err(e) = self.sess.send(elem).await {
            debug!(stream_id = %self.handle.id, error = %e, "element write failed");
        }
    }

    async fn disconnect(&mut self, error: Option<StreamErrorCondition>) {
        if self.state.get() == StreamState::Disconnected {
            return;
        }
        match error {
            None => self.close_stream(true, true).await,
            Some(condition) => self.disconnect_with_stream_error(condition).await,
        }
    }

    async fn disconnect_with_stream_error(&mut self, condition: StreamErrorCondition) {
        // a well-formed error frame needs an open envelope
        if self.state.get() == StreamState::Connecting {
            let _ = self.sess.open().await;
        }
        let _ = self.sess.send_raw(&condition.to_frame()).await;

        let unbind = condition != StreamErrorCondition::SystemShutdown;
        self.close_stream(true, unbind).await;
    }

    async fn close_stream(&mut self, close_session: bool, unbind: bool) {
        if let Some(timer) = self.connect_timer.take() {
            timer.abort();
        }
        // departed available streams broadcast unavailable
        if let (Some(presence), Some(roster)) = (self.ctx.presence(), &self.roster) {
            if presence.is_available() {
                let jid = self.ctx.jid();
                let unavailable = Presence::new(jid.clone(), jid.bare(), PresenceType::Unavailable);
                roster.process_presence(unavailable).await;
            }
        }
        if close_session {
            let _ = self.sess.close().await;
        }
        // signal termination to observers
        self.ctx.signal_done();

        if unbind {
            self.router.unbind(self.handle.as_ref());
        }
        self.container.remove(&self.handle.id);

        self.state.set(StreamState::Disconnected);
        self.sess.close_transport().await;

        info!(stream_id = %self.handle.id, "stream disconnected");
    }

    fn restart_session(&mut self) {
        self.sess.set_jid(self.ctx.jid());
        self.sess.restart();
        self.state.set(StreamState::Connecting);
    }
}

fn compression_failure(condition: &str) -> Element {
    Element::builder("failure", ns::COMPRESS)
        .append(Element::builder(condition, ns::COMPRESS).build())
        .build()
}
