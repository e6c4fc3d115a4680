//! SASL authentication: the authenticator contract and shipped mechanisms.
//!
//! One authenticator instance exists per offered mechanism; the stream
//! selects by exact mechanism name and feeds it the client's SASL elements.
//! Replies (challenge, success) are returned to the stream, which writes
//! them; failures carry a typed RFC 6120 §6.5 condition.

mod plain;
mod scram;

pub use plain::Plain;
pub use scram::{Scram, ScramKind};

use std::sync::Arc;

use async_trait::async_trait;
use minidom::Element;

use crate::config::SaslMechanism;
use crate::error::{SaslErrorCondition, XmppError};
use crate::storage::Storage;
use crate::xml::ns;

/// Failure of an authentication step.
#[derive(Debug)]
pub enum AuthError {
    /// Typed SASL failure to report to the client.
    Sasl(SaslErrorCondition),
    /// Anything else; reported as `temporary-auth-failure`.
    Other(XmppError),
}

impl AuthError {
    /// The condition to place inside the `<failure/>` element.
    pub fn condition(&self) -> SaslErrorCondition {
        match self {
            AuthError::Sasl(condition) => *condition,
            AuthError::Other(_) => SaslErrorCondition::TemporaryAuthFailure,
        }
    }
}

impl From<XmppError> for AuthError {
    fn from(err: XmppError) -> Self {
        AuthError::Other(err)
    }
}

/// One SASL mechanism endpoint.
#[async_trait]
pub trait Authenticator: Send {
    /// Mechanism name as advertised in `<mechanisms/>`.
    fn mechanism(&self) -> &'static str;

    /// Authenticated username; empty until authentication completes.
    fn username(&self) -> String;

    /// Whether the exchange has completed successfully.
    fn authenticated(&self) -> bool;

    /// Inject TLS channel-binding data before processing, when available.
    fn set_channel_binding(&mut self, _data: Option<Vec<u8>>) {}

    /// Consume one client element; the returned element (challenge or
    /// success) is written back by the stream.
    async fn process_element(&mut self, elem: &Element) -> Result<Option<Element>, AuthError>;

    /// Drop all exchange state so the mechanism can be retried.
    fn reset(&mut self);
}

/// Build `<failure xmlns='...sasl'><condition/></failure>`.
pub fn failure_element(condition: SaslErrorCondition) -> Element {
    Element::builder("failure", ns::SASL)
        .append(Element::builder(condition.as_str(), ns::SASL).build())
        .build()
}

/// Build `<success xmlns='...sasl'/>`, optionally carrying additional data.
pub fn success_element(payload: Option<String>) -> Element {
    let mut success = Element::builder("success", ns::SASL).build();
    if let Some(payload) = payload {
        success.append_text_node(payload);
    }
    success
}

/// Instantiate the authenticators for the configured mechanism list, in
/// order. SCRAM entries produce two instances: channel binding off and on.
pub fn authenticators_from_config(
    mechanisms: &[SaslMechanism],
    storage: &Arc<dyn Storage>,
) -> Vec<Box<dyn Authenticator>> {
    let mut authenticators: Vec<Box<dyn Authenticator>> = Vec::new();
    for mechanism in mechanisms {
        match mechanism {
            SaslMechanism::Plain => {
                authenticators.push(Box::new(Plain::new(Arc::clone(storage))));
            }
            SaslMechanism::ScramSha1 => {
                authenticators.push(Box::new(Scram::new(
                    ScramKind::Sha1,
                    false,
                    Arc::clone(storage),
                )));
                authenticators.push(Box::new(Scram::new(
                    ScramKind::Sha1,
                    true,
                    Arc::clone(storage),
                )));
            }
            SaslMechanism::ScramSha256 => {
                authenticators.push(Box::new(Scram::new(
                    ScramKind::Sha256,
                    false,
                    Arc::clone(storage),
                )));
                authenticators.push(Box::new(Scram::new(
                    ScramKind::Sha256,
                    true,
                    Arc::clone(storage),
                )));
            }
        }
    }
    authenticators
}
