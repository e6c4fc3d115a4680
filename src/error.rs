//! Error types for the C2S core.

use thiserror::Error;

/// Top-level crate error.
#[derive(Debug, Error)]
pub enum XmppError {
    /// IO error (transport read/write)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// XML parsing or serialization error
    #[error("XML error: {0}")]
    Xml(String),

    /// Malformed or unexpected JID
    #[error("invalid JID: {0}")]
    Jid(String),

    /// Storage backend failure
    #[error("storage error: {0}")]
    Storage(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport does not support the requested operation
    #[error("transport error: {0}")]
    Transport(String),

    /// Internal invariant violation
    #[error("internal error: {0}")]
    Internal(String),
}

impl XmppError {
    /// Create a new XML error.
    pub fn xml(msg: impl Into<String>) -> Self {
        Self::Xml(msg.into())
    }

    /// Create a new JID error.
    pub fn jid(msg: impl Into<String>) -> Self {
        Self::Jid(msg.into())
    }

    /// Create a new storage error.
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a new configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new transport error.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a new internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// XMPP stream error conditions (RFC 6120 §4.9.3).
///
/// Stream errors are fatal: the stream emits a `<stream:error>` frame and
/// closes the underlying transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamErrorCondition {
    /// Malformed or out-of-place XML
    BadFormat,
    /// Connect timeout expired before the stream was opened
    ConnectionTimeout,
    /// The stream 'to' does not name a served domain
    HostUnknown,
    /// Element namespace not acceptable in the current state
    InvalidNamespace,
    /// Operation requires prior negotiation (TLS, auth)
    NotAuthorized,
    /// A policy limit was exceeded (e.g. stanza size)
    PolicyViolation,
    /// Resource limit reached; used to evict a replaced binding
    ResourceConstraint,
    /// Server is shutting down
    SystemShutdown,
    /// Top-level element is not acceptable in the current state
    UnsupportedStanzaType,
    /// Catch-all for unexpected internal failures
    UndefinedCondition,
}

impl StreamErrorCondition {
    /// Element name of this condition.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadFormat => "bad-format",
            Self::ConnectionTimeout => "connection-timeout",
            Self::HostUnknown => "host-unknown",
            Self::InvalidNamespace => "invalid-namespace",
            Self::NotAuthorized => "not-authorized",
            Self::PolicyViolation => "policy-violation",
            Self::ResourceConstraint => "resource-constraint",
            Self::SystemShutdown => "system-shutdown",
            Self::UnsupportedStanzaType => "unsupported-stanza-type",
            Self::UndefinedCondition => "undefined-condition",
        }
    }

    /// Serialize the `<stream:error>` frame for this condition.
    ///
    /// The frame is written raw because the `stream:` prefix belongs to the
    /// envelope, not to a namespaced child element.
    pub fn to_frame(&self) -> String {
        format!(
            "<stream:error><{} xmlns='{}'/></stream:error>",
            self.as_str(),
            crate::xml::ns::STREAMS,
        )
    }
}

impl std::fmt::Display for StreamErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// XMPP stanza error conditions (RFC 6120 §8.3.3).
///
/// Stanza errors are recoverable: the stream answers with an error stanza
/// and keeps going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorCondition {
    /// Malformed request
    BadRequest,
    /// Resource binding conflict
    Conflict,
    /// Sender lacks permission
    Forbidden,
    /// Unexpected internal failure while answering
    InternalServerError,
    /// Addressed entity does not exist
    ItemNotFound,
    /// Request does not meet server criteria (e.g. blocked recipient)
    NotAcceptable,
    /// Recipient does not allow the operation
    NotAllowed,
    /// Remote domain could not be reached
    RemoteServerNotFound,
    /// No handler answered the request
    ServiceUnavailable,
}

impl StanzaErrorCondition {
    /// Element name of this condition.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "bad-request",
            Self::Conflict => "conflict",
            Self::Forbidden => "forbidden",
            Self::InternalServerError => "internal-server-error",
            Self::ItemNotFound => "item-not-found",
            Self::NotAcceptable => "not-acceptable",
            Self::NotAllowed => "not-allowed",
            Self::RemoteServerNotFound => "remote-server-not-found",
            Self::ServiceUnavailable => "service-unavailable",
        }
    }

    /// Default error type attribute for this condition (RFC 6120 §8.3.2).
    pub fn error_type(&self) -> StanzaErrorType {
        match self {
            Self::BadRequest => StanzaErrorType::Modify,
            Self::Conflict => StanzaErrorType::Cancel,
            Self::Forbidden => StanzaErrorType::Auth,
            Self::InternalServerError => StanzaErrorType::Wait,
            Self::ItemNotFound => StanzaErrorType::Cancel,
            Self::NotAcceptable => StanzaErrorType::Modify,
            Self::NotAllowed => StanzaErrorType::Cancel,
            Self::RemoteServerNotFound => StanzaErrorType::Cancel,
            Self::ServiceUnavailable => StanzaErrorType::Cancel,
        }
    }
}

impl std::fmt::Display for StanzaErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// XMPP stanza error types (RFC 6120 §8.3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorType {
    /// Retry after providing credentials
    Auth,
    /// Do not retry
    Cancel,
    /// Retry after changing the data sent
    Modify,
    /// Retry after waiting
    Wait,
}

impl StanzaErrorType {
    /// Attribute value of this type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Cancel => "cancel",
            Self::Modify => "modify",
            Self::Wait => "wait",
        }
    }
}

impl std::fmt::Display for StanzaErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// SASL failure conditions (RFC 6120 §6.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslErrorCondition {
    /// Base64 or encoding problem in the client payload
    IncorrectEncoding,
    /// Requested mechanism is not offered
    InvalidMechanism,
    /// Syntactically invalid SASL payload
    MalformedRequest,
    /// Credentials rejected
    NotAuthorized,
    /// Transient server-side failure; client may retry
    TemporaryAuthFailure,
}

impl SaslErrorCondition {
    /// Element name of this condition.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IncorrectEncoding => "incorrect-encoding",
            Self::InvalidMechanism => "invalid-mechanism",
            Self::MalformedRequest => "malformed-request",
            Self::NotAuthorized => "not-authorized",
            Self::TemporaryAuthFailure => "temporary-auth-failure",
        }
    }
}

impl std::fmt::Display for SaslErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
