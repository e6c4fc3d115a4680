//! Stanza wrappers: validated envelopes over generic XML elements.
//!
//! Inbound top-level children named `message`, `presence` or `iq` are
//! promoted to typed wrappers carrying resolved `from`/`to` JIDs. The
//! wrapped element stays the unit of routing and delivery.

use jid::Jid;
use minidom::Element;

use crate::error::{StanzaErrorCondition, XmppError};
use crate::xml::{self, ns};

/// JID predicates and accessors the core needs beyond the `jid` crate API.
pub trait JidExt {
    /// No node and no resource: addresses the server itself.
    fn is_server(&self) -> bool;
    /// No resource.
    fn is_bare(&self) -> bool;
    /// Carries a resource.
    fn is_full(&self) -> bool;
    /// Carries both a node and a resource.
    fn is_full_with_user(&self) -> bool;
    /// Same node and domain, resources ignored.
    fn matches_bare(&self, other: &Jid) -> bool;
    /// Node part as a plain string.
    fn node_str(&self) -> Option<&str>;
    /// Domain part as a plain string.
    fn domain_str(&self) -> &str;
    /// Resource part as a plain string.
    fn resource_str(&self) -> Option<&str>;
    /// The bare form, widened back to `Jid`.
    fn bare(&self) -> Jid;
}

impl JidExt for Jid {
    fn is_server(&self) -> bool {
        self.node().is_none() && self.resource().is_none()
    }

    fn is_bare(&self) -> bool {
        self.resource().is_none()
    }

    fn is_full(&self) -> bool {
        self.resource().is_some()
    }

    fn is_full_with_user(&self) -> bool {
        self.node().is_some() && self.resource().is_some()
    }

    fn matches_bare(&self, other: &Jid) -> bool {
        self.node() == other.node() && self.domain() == other.domain()
    }

    fn node_str(&self) -> Option<&str> {
        self.node().map(|n| n.as_str())
    }

    fn domain_str(&self) -> &str {
        self.domain().as_str()
    }

    fn resource_str(&self) -> Option<&str> {
        self.resource().map(|r| r.as_str())
    }

    fn bare(&self) -> Jid {
        Jid::from(self.to_bare())
    }
}

/// Message `type` attribute values (RFC 6121 §5.2.2); absent ≡ normal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Normal,
    Chat,
    Groupchat,
    Headline,
    Error,
}

impl MessageType {
    fn parse(value: Option<&str>) -> Result<Self, XmppError> {
        match value.unwrap_or("") {
            "" | "normal" => Ok(Self::Normal),
            "chat" => Ok(Self::Chat),
            "groupchat" => Ok(Self::Groupchat),
            "headline" => Ok(Self::Headline),
            "error" => Ok(Self::Error),
            other => Err(XmppError::xml(format!("invalid message type: {}", other))),
        }
    }
}

/// A validated `<message/>` stanza.
#[derive(Debug, Clone)]
pub struct Message {
    element: Element,
    from: Jid,
    to: Jid,
    type_: MessageType,
}

impl Message {
    /// Validate an element as a message, stamping the resolved addresses.
    pub fn from_element(mut element: Element, from: Jid, to: Jid) -> Result<Self, XmppError> {
        if element.name() != "message" {
            return Err(XmppError::xml(format!(
                "wrong message element name: {}",
                element.name()
            )));
        }
        let type_ = MessageType::parse(element.attr("type"))?;
        element.set_attr("from", from.to_string());
        element.set_attr("to", to.to_string());
        Ok(Self {
            element,
            from,
            to,
            type_,
        })
    }

    pub fn element(&self) -> &Element {
        &self.element
    }

    pub fn from_jid(&self) -> &Jid {
        &self.from
    }

    pub fn to_jid(&self) -> &Jid {
        &self.to
    }

    pub fn message_type(&self) -> MessageType {
        self.type_
    }

    pub fn id(&self) -> Option<&str> {
        self.element.attr("id")
    }

    pub fn is_chat(&self) -> bool {
        self.type_ == MessageType::Chat
    }

    pub fn is_groupchat(&self) -> bool {
        self.type_ == MessageType::Groupchat
    }

    /// Whether the message carries a `<body/>` child.
    pub fn has_body(&self) -> bool {
        self.element.get_child("body", ns::CLIENT).is_some()
    }

    /// The same message readdressed to the recipient's bare JID.
    pub fn readdressed_to_bare(&self) -> Message {
        let to = self.to.bare();
        let mut element = self.element.clone();
        element.set_attr("to", to.to_string());
        Message {
            element,
            from: self.from.clone(),
            to,
            type_: self.type_,
        }
    }
}

/// Presence `type` attribute values (RFC 6121 §4.7.1); absent ≡ available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceType {
    Available,
    Unavailable,
    Subscribe,
    Subscribed,
    Unsubscribe,
    Unsubscribed,
    Probe,
    Error,
}

impl PresenceType {
    fn parse(value: Option<&str>) -> Result<Self, XmppError> {
        match value.unwrap_or("") {
            "" => Ok(Self::Available),
            "unavailable" => Ok(Self::Unavailable),
            "subscribe" => Ok(Self::Subscribe),
            "subscribed" => Ok(Self::Subscribed),
            "unsubscribe" => Ok(Self::Unsubscribe),
            "unsubscribed" => Ok(Self::Unsubscribed),
            "probe" => Ok(Self::Probe),
            "error" => Ok(Self::Error),
            other => Err(XmppError::xml(format!("invalid presence type: {}", other))),
        }
    }
}

/// A validated `<presence/>` stanza.
#[derive(Debug, Clone)]
pub struct Presence {
    element: Element,
    from: Jid,
    to: Jid,
    type_: PresenceType,
}

impl Presence {
    /// Validate an element as a presence, stamping the resolved addresses.
    pub fn from_element(mut element: Element, from: Jid, to: Jid) -> Result<Self, XmppError> {
        if element.name() != "presence" {
            return Err(XmppError::xml(format!(
                "wrong presence element name: {}",
                element.name()
            )));
        }
        let type_ = PresenceType::parse(element.attr("type"))?;
        element.set_attr("from", from.to_string());
        element.set_attr("to", to.to_string());
        Ok(Self {
            element,
            from,
            to,
            type_,
        })
    }

    /// Build a bare presence of the given type between two JIDs.
    pub fn new(from: Jid, to: Jid, type_: PresenceType) -> Presence {
        let type_attr = match type_ {
            PresenceType::Available => None,
            PresenceType::Unavailable => Some("unavailable"),
            PresenceType::Subscribe => Some("subscribe"),
            PresenceType::Subscribed => Some("subscribed"),
            PresenceType::Unsubscribe => Some("unsubscribe"),
            PresenceType::Unsubscribed => Some("unsubscribed"),
            PresenceType::Probe => Some("probe"),
            PresenceType::Error => Some("error"),
        };
        let element = Element::builder("presence", ns::CLIENT)
            .attr("from", from.to_string())
            .attr("to", to.to_string())
            .attr("type", type_attr)
            .build();
        Presence {
            element,
            from,
            to,
            type_,
        }
    }

    pub fn element(&self) -> &Element {
        &self.element
    }

    pub fn from_jid(&self) -> &Jid {
        &self.from
    }

    pub fn to_jid(&self) -> &Jid {
        &self.to
    }

    pub fn presence_type(&self) -> PresenceType {
        self.type_
    }

    pub fn is_available(&self) -> bool {
        self.type_ == PresenceType::Available
    }

    pub fn is_unavailable(&self) -> bool {
        self.type_ == PresenceType::Unavailable
    }

    /// Whether this presence manages a subscription state.
    pub fn is_subscription(&self) -> bool {
        matches!(
            self.type_,
            PresenceType::Subscribe
                | PresenceType::Subscribed
                | PresenceType::Unsubscribe
                | PresenceType::Unsubscribed
        )
    }

    /// The advertised priority; 0 when absent or unparsable (RFC 6121 §4.7.5).
    pub fn priority(&self) -> i8 {
        self.element
            .get_child("priority", ns::CLIENT)
            .and_then(|p| p.text().trim().parse().ok())
            .unwrap_or(0)
    }
}

/// IQ `type` attribute values (RFC 6120 §8.2.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IqType {
    Get,
    Set,
    Result,
    Error,
}

impl IqType {
    fn parse(value: Option<&str>) -> Result<Self, XmppError> {
        match value {
            Some("get") => Ok(Self::Get),
            Some("set") => Ok(Self::Set),
            Some("result") => Ok(Self::Result),
            Some("error") => Ok(Self::Error),
            other => Err(XmppError::xml(format!(
                "invalid iq type: {}",
                other.unwrap_or("<missing>")
            ))),
        }
    }
}

/// A validated `<iq/>` stanza. Every IQ carries a non-empty `id`.
#[derive(Debug, Clone)]
pub struct Iq {
    element: Element,
    from: Jid,
    to: Jid,
    type_: IqType,
    id: String,
}

impl Iq {
    /// Validate an element as an IQ, stamping the resolved addresses.
    pub fn from_element(mut element: Element, from: Jid, to: Jid) -> Result<Self, XmppError> {
        if element.name() != "iq" {
            return Err(XmppError::xml(format!(
                "wrong iq element name: {}",
                element.name()
            )));
        }
        let type_ = IqType::parse(element.attr("type"))?;
        let id = element.attr("id").unwrap_or("").to_string();
        if id.is_empty() {
            return Err(XmppError::xml("iq stanza requires a non-empty id"));
        }
        element.set_attr("from", from.to_string());
        element.set_attr("to", to.to_string());
        Ok(Self {
            element,
            from,
            to,
            type_,
            id,
        })
    }

    pub fn element(&self) -> &Element {
        &self.element
    }

    pub fn from_jid(&self) -> &Jid {
        &self.from
    }

    pub fn to_jid(&self) -> &Jid {
        &self.to
    }

    pub fn iq_type(&self) -> IqType {
        self.type_
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_get(&self) -> bool {
        self.type_ == IqType::Get
    }

    pub fn is_set(&self) -> bool {
        self.type_ == IqType::Set
    }

    /// First child in the given namespace named `name`, if any.
    pub fn payload(&self, name: &str, namespace: &str) -> Option<&Element> {
        self.element.get_child(name, namespace)
    }

    /// Build the empty result answering this IQ.
    pub fn result(&self) -> Element {
        Element::builder("iq", ns::CLIENT)
            .attr("id", self.id.as_str())
            .attr("type", "result")
            .attr("from", self.to.to_string())
            .attr("to", self.from.to_string())
            .build()
    }

    /// Build a result answering this IQ carrying `payload`.
    pub fn result_with(&self, payload: Element) -> Element {
        let mut result = self.result();
        result.append_child(payload);
        result
    }

    /// Build an error stanza answering this IQ.
    pub fn error(&self, condition: StanzaErrorCondition) -> Element {
        xml::error_response(&self.element, condition, vec![])
    }
}

/// Union of the three stanza kinds, the router's unit of work.
#[derive(Debug, Clone)]
pub enum Stanza {
    Message(Message),
    Presence(Presence),
    Iq(Iq),
}

impl Stanza {
    /// Element name of the stanza kind.
    pub fn name(&self) -> &'static str {
        match self {
            Stanza::Message(_) => "message",
            Stanza::Presence(_) => "presence",
            Stanza::Iq(_) => "iq",
        }
    }

    pub fn element(&self) -> &Element {
        match self {
            Stanza::Message(m) => m.element(),
            Stanza::Presence(p) => p.element(),
            Stanza::Iq(iq) => iq.element(),
        }
    }

    pub fn from_jid(&self) -> &Jid {
        match self {
            Stanza::Message(m) => m.from_jid(),
            Stanza::Presence(p) => p.from_jid(),
            Stanza::Iq(iq) => iq.from_jid(),
        }
    }

    pub fn to_jid(&self) -> &Jid {
        match self {
            Stanza::Message(m) => m.to_jid(),
            Stanza::Presence(p) => p.to_jid(),
            Stanza::Iq(iq) => iq.to_jid(),
        }
    }

    /// Build an error stanza answering this stanza.
    pub fn error(&self, condition: StanzaErrorCondition) -> Element {
        xml::error_response(self.element(), condition, vec![])
    }
}
