//! # loon-xmpp
//!
//! Embeddable client-to-server (C2S) core of an XMPP server, following
//! RFC 6120/6121 plus a small set of XEPs.
//!
//! The crate terminates XMPP client streams over a pluggable [`Transport`],
//! drives the stream through negotiation (STARTTLS, SASL, compression,
//! resource binding, session establishment) and then routes stanzas between
//! locally bound streams and server-hosted modules.
//!
//! ## Architecture
//!
//! - **Session**: stream envelope + incremental XML codec over a transport
//! - **Stream actors**: each connection is one actor task draining a
//!   bounded mailbox; all stream state is mutated there
//! - **Router**: process-wide registry of bound streams, components and
//!   blocklists
//! - **Modules**: IQ handlers (disco, vCard, private XML, last activity,
//!   version, ping) plus per-stream offline and roster hand-off actors
//!
//! ## Supported XEPs
//!
//! - XEP-0012 (Last Activity)
//! - XEP-0030 (Service Discovery)
//! - XEP-0049 (Private XML Storage)
//! - XEP-0054 (vcard-temp)
//! - XEP-0092 (Software Version)
//! - XEP-0199 (XMPP Ping)
//! - XEP-0203 (Delayed Delivery, on offline queue entries)

pub mod auth;
pub mod c2s;
pub mod config;
pub mod context;
pub mod module;
pub mod router;
pub mod session;
pub mod stanza;
pub mod storage;
pub mod transport;
pub mod xml;

mod error;

pub use c2s::{C2sServer, C2sStream, LocalStream};
pub use config::{C2sConfig, ResourceConflict, SaslMechanism};
pub use context::{StreamContext, StreamState};
pub use error::{
    SaslErrorCondition, StanzaErrorCondition, StanzaErrorType, StreamErrorCondition, XmppError,
};
pub use module::{IqHandler, Modules};
pub use router::{Component, OutBridge, RouteError, Router};
pub use stanza::{Iq, JidExt, Message, Presence, Stanza};
pub use storage::{MemoryStorage, Storage};
pub use transport::{CompressionLevel, MemoryTransport, Transport, TransportKind};
pub use xml::ns;

// the element and address types are part of this crate's API surface
pub use jid;
pub use minidom;

use std::sync::Arc;

/// Wire a complete C2S service: router, module set and supervisor.
///
/// Convenience entry point for embedders; the pieces can also be assembled
/// by hand when a custom router or module list is needed.
pub fn serve(cfg: C2sConfig, storage: Arc<dyn Storage>) -> C2sServer {
    let router = Arc::new(Router::new(cfg.domain.clone(), Arc::clone(&storage)));
    let modules = Arc::new(module::Modules::new(
        &cfg,
        Arc::clone(&router),
        Arc::clone(&storage),
    ));
    C2sServer::new(cfg, router, storage, modules)
}
