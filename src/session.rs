//! XMPP session: stream envelope protocol over a transport.
//!
//! A session owns the transport and the incremental codec, turning raw bytes
//! into typed frames and outbound elements into bytes. It is restarted in
//! place after TLS, compression or authentication upgrades.

use jid::Jid;
use minidom::Element;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::error::{StanzaErrorCondition, StreamErrorCondition, XmppError};
use crate::stanza::{Iq, JidExt, Message, Presence, Stanza};
use crate::transport::{CompressionLevel, Transport, TransportKind};
use crate::xml::{self, ns, RawFrame, StreamHeader, XmlStreamParser};

const READ_BUF_SIZE: usize = 4096;

/// A complete inbound unit delivered by [`Session::receive`].
#[derive(Debug)]
pub enum Frame {
    /// Stream open envelope
    Open(StreamHeader),
    /// A validated stanza
    Stanza(Stanza),
    /// Any other top-level element (starttls, auth, compress, ...)
    Element(Element),
}

/// Failure modes of [`Session::receive`].
#[derive(Debug)]
pub enum SessionError {
    /// Peer closed the stream or the transport reached EOF.
    Closed,
    /// Fatal framing or policy failure; emit the condition and close.
    Stream(StreamErrorCondition),
    /// Recoverable stanza-level failure; echo an error stanza and continue.
    Stanza {
        /// The offending element, for the echo
        element: Element,
        /// The condition to answer with
        condition: StanzaErrorCondition,
    },
    /// Anything else; mapped to `undefined-condition` by the stream.
    Other(XmppError),
}

/// One direction-agnostic XMPP session over a transport.
pub struct Session {
    transport: Box<dyn Transport>,
    parser: XmlStreamParser,
    domain: String,
    jid: Jid,
    stream_id: String,
    max_stanza_size: usize,
}

impl Session {
    /// Create a session serving `domain` over the given transport.
    pub fn new(transport: Box<dyn Transport>, domain: String, max_stanza_size: usize) -> Self {
        let jid = domain
            .parse()
            .unwrap_or_else(|_| Jid::new("invalid.invalid").expect("static JID"));
        Self {
            transport,
            parser: XmlStreamParser::new(),
            domain,
            jid,
            stream_id: uuid::Uuid::new_v4().to_string(),
            max_stanza_size,
        }
    }

    /// The id advertised in the last open envelope.
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Associate the stream JID used for address resolution and envelopes.
    pub fn set_jid(&mut self, jid: Jid) {
        self.jid = jid;
    }

    /// The transport kind, which drives feature advertising.
    pub fn transport_kind(&self) -> TransportKind {
        self.transport.kind()
    }

    /// Instruct the transport to secure the channel.
    pub async fn start_tls(&mut self, config: std::sync::Arc<rustls::ServerConfig>) -> Result<(), XmppError> {
        self.transport.start_tls(config).await
    }

    /// Instruct the transport to compress the channel.
    pub async fn enable_compression(&mut self, level: CompressionLevel) -> Result<(), XmppError> {
        self.transport.enable_compression(level).await
    }

    /// Channel-binding data exposed by the transport, if any.
    pub fn channel_binding(&self) -> Option<Vec<u8>> {
        self.transport.channel_binding()
    }

    /// Reset the codec and expect a fresh open envelope from the peer.
    pub fn restart(&mut self) {
        self.parser.reset();
        self.stream_id = uuid::Uuid::new_v4().to_string();
    }

    /// Emit the opening envelope for the current stream.
    pub async fn open(&mut self) -> Result<(), XmppError> {
        let to_attr = if self.jid.node().is_some() {
            format!(" to='{}'", self.jid)
        } else {
            String::new()
        };
        let envelope = format!(
            "<?xml version='1.0'?>\
             <stream:stream xmlns='{}' xmlns:stream='{}' id='{}' from='{}'{} version='1.0'>",
            ns::CLIENT,
            ns::STREAM,
            self.stream_id,
            self.domain,
            to_attr,
        );
        self.send_raw(&envelope).await?;
        debug!(stream_id = %self.stream_id, "opened stream envelope");
        Ok(())
    }

    /// Emit the closing tag and flush.
    pub async fn close(&mut self) -> Result<(), XmppError> {
        self.send_raw("</stream:stream>").await
    }

    /// Shut the transport down.
    pub async fn close_transport(&mut self) {
        let _ = self.transport.shutdown().await;
    }

    /// Serialize and write an element.
    pub async fn send(&mut self, elem: &Element) -> Result<(), XmppError> {
        let xml = xml::element_to_string(elem);
        self.send_raw(&xml).await
    }

    /// Write a pre-serialized fragment (envelopes, features, stream errors).
    pub async fn send_raw(&mut self, fragment: &str) -> Result<(), XmppError> {
        self.transport.write_all(fragment.as_bytes()).await?;
        self.transport.flush().await?;
        Ok(())
    }

    /// Produce the next inbound frame, reading from the transport as needed.
    pub async fn receive(&mut self) -> Result<Frame, SessionError> {
        let mut buf = [0u8; READ_BUF_SIZE];
        loop {
            match self.parser.next_frame() {
                Ok(Some(RawFrame::Close)) => return Err(SessionError::Closed),
                Ok(Some(RawFrame::Open(header))) => return self.accept_open(header),
                Ok(Some(RawFrame::Element(elem))) => return self.accept_element(elem),
                Ok(None) => {}
                Err(_) => return Err(SessionError::Stream(StreamErrorCondition::BadFormat)),
            }
            let n = match self.transport.read(&mut buf).await {
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Err(SessionError::Closed)
                }
                Err(e) => return Err(SessionError::Other(e.into())),
            };
            if n == 0 {
                return Err(SessionError::Closed);
            }
            self.parser.feed(&buf[..n]);
            if self.parser.buffered_len() > self.max_stanza_size {
                return Err(SessionError::Stream(StreamErrorCondition::PolicyViolation));
            }
        }
    }

    fn accept_open(&self, header: StreamHeader) -> Result<Frame, SessionError> {
        if let Some(stream_ns) = &header.stream_ns {
            if stream_ns != ns::STREAM {
                return Err(SessionError::Stream(StreamErrorCondition::InvalidNamespace));
            }
        }
        Ok(Frame::Open(header))
    }

    /// Promote stanza elements to validated wrappers, resolving addresses.
    ///
    /// The sender address is always the stream's own JID; a missing `to`
    /// defaults to the sender's bare JID (RFC 6120 §10.3).
    fn accept_element(&self, element: Element) -> Result<Frame, SessionError> {
        if !matches!(element.name(), "message" | "presence" | "iq") {
            return Ok(Frame::Element(element));
        }
        let from = self.jid.clone();
        let to = match element.attr("to") {
            Some(to) => match to.parse::<Jid>() {
                Ok(jid) => jid,
                Err(_) => {
                    return Err(SessionError::Stanza {
                        element,
                        condition: StanzaErrorCondition::BadRequest,
                    })
                }
            },
            None => {
                if self.jid.node().is_some() {
                    self.jid.bare()
                } else {
                    self.jid.clone()
                }
            }
        };
        let stanza = match element.name() {
            "message" => Message::from_element(element.clone(), from, to).map(Stanza::Message),
            "presence" => Presence::from_element(element.clone(), from, to).map(Stanza::Presence),
            _ => Iq::from_element(element.clone(), from, to).map(Stanza::Iq),
        };
        match stanza {
            Ok(stanza) => Ok(Frame::Stanza(stanza)),
            Err(_) => Err(SessionError::Stanza {
                element,
                condition: StanzaErrorCondition::BadRequest,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use tokio::io::AsyncWriteExt;

    fn session_pair() -> (Session, tokio::io::DuplexStream) {
        let (transport, client) = MemoryTransport::pair(TransportKind::Socket, 8192);
        let session = Session::new(Box::new(transport), "jackal.im".to_string(), 32768);
        (session, client)
    }

    #[tokio::test]
    async fn receives_open_then_stanza() {
        let (mut session, mut client) = session_pair();
        client
            .write_all(b"<stream:stream xmlns='jabber:client' to='jackal.im' version='1.0'>")
            .await
            .unwrap();
        assert!(matches!(session.receive().await.unwrap(), Frame::Open(_)));

        client
            .write_all(b"<iq id='b1' type='set'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/></iq>")
            .await
            .unwrap();
        match session.receive().await.unwrap() {
            Frame::Stanza(Stanza::Iq(iq)) => {
                assert!(iq.is_set());
                assert_eq!(iq.id(), "b1");
            }
            other => panic!("expected iq stanza, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn stamps_sender_address_after_bind() {
        let (mut session, mut client) = session_pair();
        session.set_jid("ortuman@jackal.im/balcony".parse().unwrap());
        client
            .write_all(b"<stream:stream xmlns='jabber:client' to='jackal.im' version='1.0'>")
            .await
            .unwrap();
        session.receive().await.unwrap();

        client
            .write_all(b"<message from='spoof@evil.im/x' to='noelia@jackal.im' type='chat'/>")
            .await
            .unwrap();
        match session.receive().await.unwrap() {
            Frame::Stanza(Stanza::Message(m)) => {
                assert_eq!(m.from_jid().to_string(), "ortuman@jackal.im/balcony");
                assert_eq!(m.element().attr("from"), Some("ortuman@jackal.im/balcony"));
            }
            other => panic!("expected message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn missing_to_defaults_to_own_bare_jid() {
        let (mut session, mut client) = session_pair();
        session.set_jid("ortuman@jackal.im/balcony".parse().unwrap());
        client
            .write_all(b"<stream:stream xmlns='jabber:client' to='jackal.im' version='1.0'>")
            .await
            .unwrap();
        session.receive().await.unwrap();

        client.write_all(b"<presence/>").await.unwrap();
        match session.receive().await.unwrap() {
            Frame::Stanza(Stanza::Presence(p)) => {
                assert_eq!(p.to_jid().to_string(), "ortuman@jackal.im");
            }
            other => panic!("expected presence, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn invalid_iq_yields_stanza_error() {
        let (mut session, mut client) = session_pair();
        client
            .write_all(b"<stream:stream xmlns='jabber:client' to='jackal.im' version='1.0'>")
            .await
            .unwrap();
        session.receive().await.unwrap();

        // missing id
        client.write_all(b"<iq type='get'/>").await.unwrap();
        match session.receive().await {
            Err(SessionError::Stanza { condition, .. }) => {
                assert_eq!(condition, StanzaErrorCondition::BadRequest);
            }
            other => panic!("expected stanza error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn oversized_stanza_is_a_policy_violation() {
        let (transport, mut client) = MemoryTransport::pair(TransportKind::Socket, 8192);
        let mut session = Session::new(Box::new(transport), "jackal.im".to_string(), 128);
        client
            .write_all(b"<stream:stream xmlns='jabber:client' to='jackal.im' version='1.0'>")
            .await
            .unwrap();
        session.receive().await.unwrap();

        let big = format!("<message><body>{}</body>", "x".repeat(256));
        client.write_all(big.as_bytes()).await.unwrap();
        match session.receive().await {
            Err(SessionError::Stream(cond)) => {
                assert_eq!(cond, StreamErrorCondition::PolicyViolation);
            }
            other => panic!("expected stream error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn peer_close_ends_session() {
        let (mut session, mut client) = session_pair();
        client
            .write_all(b"<stream:stream xmlns='jabber:client' to='jackal.im' version='1.0'>")
            .await
            .unwrap();
        session.receive().await.unwrap();

        client.write_all(b"</stream:stream>").await.unwrap();
        assert!(matches!(session.receive().await, Err(SessionError::Closed)));
    }

    #[tokio::test]
    async fn open_envelope_carries_domain_and_id() {
        let (mut session, mut client) = session_pair();
        session.open().await.unwrap();

        let mut buf = vec![0u8; 1024];
        let n = tokio::io::AsyncReadExt::read(&mut client, &mut buf).await.unwrap();
        let written = String::from_utf8_lossy(&buf[..n]).into_owned();
        assert!(written.contains("<stream:stream"));
        assert!(written.contains("from='jackal.im'"));
        assert!(written.contains("version='1.0'"));
        assert!(written.contains(&format!("id='{}'", session.stream_id())));
    }
}
