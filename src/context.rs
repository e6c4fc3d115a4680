//! Per-stream shared state: the typed context record and the state word.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::RwLock;

use jid::Jid;
use tokio_util::sync::CancellationToken;

use crate::stanza::Presence;

/// Lifecycle states of a C2S stream.
///
/// Monotone except that a session restart (after TLS, compression or
/// authentication) returns to `Connecting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamState {
    Connecting = 0,
    Connected = 1,
    Authenticating = 2,
    Authenticated = 3,
    SessionStarted = 4,
    Disconnected = 5,
}

impl StreamState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Connected,
            2 => Self::Authenticating,
            3 => Self::Authenticated,
            4 => Self::SessionStarted,
            _ => Self::Disconnected,
        }
    }
}

/// Atomic cell holding the stream state.
///
/// Written only by the stream's actor; read by any task that needs to know
/// whether the stream is still alive.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(state: StreamState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn get(&self) -> StreamState {
        StreamState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: StreamState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// The per-connection context record.
///
/// Owned by the stream; the accessors exist so collaborators (router,
/// modules) stay decoupled from its storage. All mutation happens on the
/// stream's actor.
pub struct StreamContext {
    username: RwLock<String>,
    domain: RwLock<String>,
    resource: RwLock<String>,
    jid: RwLock<Jid>,
    secured: AtomicBool,
    authenticated: AtomicBool,
    compressed: AtomicBool,
    presence: RwLock<Option<Presence>>,
    offline_delivered: AtomicBool,
    done: CancellationToken,
}

impl StreamContext {
    /// Create a context for a stream serving `server_jid`'s domain.
    ///
    /// `secured` starts true for transports that are secured out-of-band
    /// (anything that is not a long-lived socket).
    pub fn new(server_jid: Jid, secured: bool) -> Self {
        Self {
            username: RwLock::new(String::new()),
            domain: RwLock::new(String::new()),
            resource: RwLock::new(String::new()),
            jid: RwLock::new(server_jid),
            secured: AtomicBool::new(secured),
            authenticated: AtomicBool::new(false),
            compressed: AtomicBool::new(false),
            presence: RwLock::new(None),
            offline_delivered: AtomicBool::new(false),
            done: CancellationToken::new(),
        }
    }

    pub fn username(&self) -> String {
        self.username.read().expect("context lock").clone()
    }

    pub fn set_username(&self, username: &str) {
        *self.username.write().expect("context lock") = username.to_string();
    }

    pub fn domain(&self) -> String {
        self.domain.read().expect("context lock").clone()
    }

    pub fn set_domain(&self, domain: &str) {
        *self.domain.write().expect("context lock") = domain.to_string();
    }

    pub fn resource(&self) -> String {
        self.resource.read().expect("context lock").clone()
    }

    pub fn set_resource(&self, resource: &str) {
        *self.resource.write().expect("context lock") = resource.to_string();
    }

    pub fn jid(&self) -> Jid {
        self.jid.read().expect("context lock").clone()
    }

    pub fn set_jid(&self, jid: Jid) {
        *self.jid.write().expect("context lock") = jid;
    }

    pub fn is_secured(&self) -> bool {
        self.secured.load(Ordering::Acquire)
    }

    pub fn set_secured(&self, secured: bool) {
        self.secured.store(secured, Ordering::Release);
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    pub fn set_authenticated(&self, authenticated: bool) {
        self.authenticated.store(authenticated, Ordering::Release);
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed.load(Ordering::Acquire)
    }

    pub fn set_compressed(&self, compressed: bool) {
        self.compressed.store(compressed, Ordering::Release);
    }

    /// Last observed self-addressed available/unavailable presence.
    pub fn presence(&self) -> Option<Presence> {
        self.presence.read().expect("context lock").clone()
    }

    pub fn set_presence(&self, presence: Presence) {
        *self.presence.write().expect("context lock") = Some(presence);
    }

    /// Latch guarding one-shot offline delivery; returns the previous value.
    pub fn mark_offline_delivered(&self) -> bool {
        self.offline_delivered.swap(true, Ordering::AcqRel)
    }

    /// Token cancelled when the stream reaches `Disconnected`.
    ///
    /// Module actors observing the stream select on this to exit.
    pub fn done(&self) -> CancellationToken {
        self.done.clone()
    }

    /// Fire the termination signal. Idempotent.
    pub fn signal_done(&self) {
        self.done.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_cell_round_trips() {
        let cell = StateCell::new(StreamState::Connecting);
        assert_eq!(cell.get(), StreamState::Connecting);
        cell.set(StreamState::SessionStarted);
        assert_eq!(cell.get(), StreamState::SessionStarted);
    }

    #[test]
    fn context_accessors() {
        let ctx = StreamContext::new("jackal.im".parse().unwrap(), false);
        assert!(!ctx.is_secured());
        assert!(!ctx.is_authenticated());
        assert_eq!(ctx.username(), "");

        ctx.set_username("ortuman");
        ctx.set_domain("jackal.im");
        ctx.set_resource("balcony");
        ctx.set_secured(true);
        ctx.set_authenticated(true);
        ctx.set_jid("ortuman@jackal.im/balcony".parse().unwrap());

        assert_eq!(ctx.username(), "ortuman");
        assert_eq!(ctx.domain(), "jackal.im");
        assert_eq!(ctx.resource(), "balcony");
        assert!(ctx.is_secured());
        assert!(ctx.is_authenticated());
        assert_eq!(ctx.jid().to_string(), "ortuman@jackal.im/balcony");
    }

    #[test]
    fn offline_delivery_latch_fires_once() {
        let ctx = StreamContext::new("jackal.im".parse().unwrap(), false);
        assert!(!ctx.mark_offline_delivered());
        assert!(ctx.mark_offline_delivered());
    }

    #[tokio::test]
    async fn done_token_observes_termination() {
        let ctx = StreamContext::new("jackal.im".parse().unwrap(), false);
        let done = ctx.done();
        assert!(!done.is_cancelled());
        ctx.signal_done();
        done.cancelled().await;
    }
}
