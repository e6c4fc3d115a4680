//! Incremental XML stream parsing and element helpers.
//!
//! XMPP uses a single long-lived XML document per session, so inbound bytes
//! are accumulated and complete top-level children are emitted one at a time.
//! The stream envelope (`<stream:stream>`) is handled as a frame of its own
//! since its closing tag only arrives at session end.

use minidom::Element;

use crate::error::{StanzaErrorCondition, XmppError};

/// Namespace URIs used by the C2S core.
pub mod ns {
    /// Default C2S stanza namespace
    pub const CLIENT: &str = "jabber:client";
    /// Stream envelope namespace
    pub const STREAM: &str = "http://etherx.jabber.org/streams";
    /// Stream error condition namespace
    pub const STREAMS: &str = "urn:ietf:params:xml:ns:xmpp-streams";
    /// STARTTLS namespace
    pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
    /// SASL namespace
    pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
    /// Resource binding namespace
    pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
    /// Session establishment namespace
    pub const SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";
    /// Stanza error condition namespace
    pub const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
    /// Stream compression namespace
    pub const COMPRESS: &str = "http://jabber.org/features/compress";
    /// Blocking command error namespace (XEP-0191)
    pub const BLOCKING_ERRORS: &str = "urn:xmpp:blocking:errors";
    /// Delayed delivery namespace (XEP-0203)
    pub const DELAY: &str = "urn:xmpp:delay";
    /// Legacy non-SASL authentication namespace (XEP-0078)
    pub const AUTH_LEGACY: &str = "jabber:iq:auth";
}

/// Attributes of a received stream open envelope.
#[derive(Debug, Clone, Default)]
pub struct StreamHeader {
    /// The 'to' attribute (target domain)
    pub to: Option<String>,
    /// The 'from' attribute
    pub from: Option<String>,
    /// The 'version' attribute
    pub version: Option<String>,
    /// The declared stream namespace prefix binding (`xmlns:stream`)
    pub stream_ns: Option<String>,
}

impl StreamHeader {
    fn parse(tag: &str) -> Self {
        Self {
            to: extract_attribute(tag, "to"),
            from: extract_attribute(tag, "from"),
            version: extract_attribute(tag, "version"),
            stream_ns: extract_attribute(tag, "xmlns:stream"),
        }
    }
}

/// Extract an attribute value from a raw XML tag.
///
/// Walks the tag bytes the same way [`find_tag_end`] does: past the tag
/// name, then name/`=`/quoted-value triples until the requested attribute
/// or the end of the tag.
fn extract_attribute(tag: &str, name: &str) -> Option<String> {
    let bytes = tag.as_bytes();
    let mut i = 0;
    while i < bytes.len() && !bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    while i < bytes.len() {
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        let name_start = i;
        while i < bytes.len() && bytes[i] != b'=' && bytes[i] != b'>' {
            i += 1;
        }
        if i >= bytes.len() || bytes[i] == b'>' {
            return None;
        }
        let attr_name = tag[name_start..i].trim_end();
        i += 1;
        let quote = match bytes.get(i) {
            Some(q @ (b'\'' | b'"')) => *q,
            _ => return None,
        };
        i += 1;
        let value_start = i;
        while i < bytes.len() && bytes[i] != quote {
            i += 1;
        }
        if i >= bytes.len() {
            return None;
        }
        if attr_name == name {
            return Some(tag[value_start..i].to_string());
        }
        i += 1;
    }
    None
}

/// A complete top-level frame of the XML stream.
#[derive(Debug, Clone)]
pub enum RawFrame {
    /// Opening `<stream:stream>` envelope
    Open(StreamHeader),
    /// A top-level child element
    Element(Element),
    /// Closing `</stream:stream>` tag
    Close,
}

/// Incremental parser for one direction of an XMPP stream.
pub struct XmlStreamParser {
    buf: Vec<u8>,
    awaiting_open: bool,
}

impl XmlStreamParser {
    /// Create a parser expecting a stream open envelope first.
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(4096),
            awaiting_open: true,
        }
    }

    /// Feed raw bytes into the parser buffer.
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of bytes currently buffered and not yet consumed.
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Drop all buffered data and expect a fresh stream open envelope.
    ///
    /// Called on stream restart after TLS, compression or authentication.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.awaiting_open = true;
    }

    /// Parse and consume the next complete frame, if any.
    pub fn next_frame(&mut self) -> Result<Option<RawFrame>, XmppError> {
        self.skip_prolog()?;
        if self.buf.is_empty() || self.buf.starts_with(b"<?") {
            return Ok(None);
        }

        let text = String::from_utf8_lossy(&self.buf).into_owned();

        if self.awaiting_open {
            return self.take_open_envelope(&text);
        }

        if text.starts_with("</") {
            if text.starts_with("</stream:stream>") {
                self.buf.drain(.."</stream:stream>".len());
                return Ok(Some(RawFrame::Close));
            }
            if "</stream:stream>".starts_with(&text) {
                return Ok(None); // partial close tag
            }
            return Err(XmppError::xml("unbalanced closing tag"));
        }

        let end = match scan_element_end(self.buf.as_slice())? {
            Some(end) => end,
            None => return Ok(None),
        };
        let slice = text[..end].to_string();
        self.buf.drain(..end);

        let elem = parse_element(&slice)?;
        Ok(Some(RawFrame::Element(elem)))
    }

    fn take_open_envelope(&mut self, text: &str) -> Result<Option<RawFrame>, XmppError> {
        if !(text.starts_with("<stream:stream") || text.starts_with("<stream ")) {
            // a short buffer may still grow into the envelope prefix
            if "<stream:stream".starts_with(text) || "<stream ".starts_with(text) {
                return Ok(None);
            }
            return Err(XmppError::xml("expected stream open envelope"));
        }
        let end = match find_tag_end(self.buf.as_slice(), 0) {
            Some(end) => end,
            None => return Ok(None),
        };
        let header = StreamHeader::parse(&text[..end]);
        self.buf.drain(..end);
        self.awaiting_open = false;
        Ok(Some(RawFrame::Open(header)))
    }

    /// Skip the XML declaration and inter-stanza whitespace (keepalives).
    fn skip_prolog(&mut self) -> Result<(), XmppError> {
        loop {
            let ws = self
                .buf
                .iter()
                .take_while(|b| b.is_ascii_whitespace())
                .count();
            self.buf.drain(..ws);
            if self.buf.starts_with(b"<?") {
                match self.buf.windows(2).position(|w| w == b"?>") {
                    Some(pos) => {
                        self.buf.drain(..pos + 2);
                        continue;
                    }
                    None => return Ok(()), // incomplete declaration
                }
            }
            if !self.buf.is_empty() && self.buf[0] != b'<' {
                return Err(XmppError::xml("unexpected character data at stream level"));
            }
            return Ok(());
        }
    }
}

impl Default for XmlStreamParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Find the byte offset just past the `>` terminating the tag starting at
/// `start`, honoring quoted attribute values. Returns `None` when the tag is
/// still incomplete.
fn find_tag_end(buf: &[u8], start: usize) -> Option<usize> {
    let mut quote: Option<u8> = None;
    let mut i = start;
    while i < buf.len() {
        match buf[i] {
            q @ (b'\'' | b'"') => match quote {
                Some(open) if open == q => quote = None,
                Some(_) => {}
                None => quote = Some(q),
            },
            b'>' if quote.is_none() => return Some(i + 1),
            _ => {}
        }
        i += 1;
    }
    None
}

/// Find the end offset of the complete top-level element starting at the
/// front of `buf`, tracking nesting depth. Returns `None` when more data is
/// needed.
fn scan_element_end(buf: &[u8]) -> Result<Option<usize>, XmppError> {
    let mut depth = 0usize;
    let mut i = 0;
    loop {
        let lt = match buf[i..].iter().position(|&b| b == b'<') {
            Some(off) => i + off,
            None => return Ok(None),
        };
        if lt + 1 >= buf.len() {
            return Ok(None);
        }
        if buf[lt + 1] == b'!' || buf[lt + 1] == b'?' {
            // comments, CDATA and processing instructions are restricted XML
            return Err(XmppError::xml("restricted XML construct in stream"));
        }
        let end = match find_tag_end(buf, lt) {
            Some(end) => end,
            None => return Ok(None),
        };
        let closing = buf[lt + 1] == b'/';
        let self_closing = buf[end - 2] == b'/';
        if closing {
            if depth == 0 {
                return Err(XmppError::xml("unbalanced closing tag"));
            }
            depth -= 1;
            if depth == 0 {
                return Ok(Some(end));
            }
        } else if self_closing {
            if depth == 0 {
                return Ok(Some(end));
            }
        } else {
            depth += 1;
        }
        i = end;
    }
}

/// Parse a complete element, injecting the default C2S namespace when the
/// client relied on inheriting it from the stream envelope.
fn parse_element(slice: &str) -> Result<Element, XmppError> {
    let tag_end = slice.find('>').unwrap_or(slice.len());
    let prepared = if slice[..tag_end].contains("xmlns=") {
        slice.to_string()
    } else {
        let name_end = slice[1..tag_end]
            .find(|c: char| c.is_ascii_whitespace() || c == '/' || c == '>')
            .map(|off| 1 + off)
            .unwrap_or(tag_end);
        format!(
            "<{} xmlns='{}'{}",
            &slice[1..name_end],
            ns::CLIENT,
            &slice[name_end..]
        )
    };
    prepared
        .parse::<Element>()
        .map_err(|e| XmppError::xml(format!("failed to parse element: {}", e)))
}

/// Serialize an element to its XML string form.
pub fn element_to_string(elem: &Element) -> String {
    String::from(elem)
}

/// Build an error stanza answering `elem` (RFC 6120 §8.3).
///
/// The original element is echoed with `to`/`from` swapped, `type='error'`
/// and an `<error>` child carrying the condition plus any extra application
/// elements.
pub fn error_response(
    elem: &Element,
    condition: StanzaErrorCondition,
    extra: Vec<Element>,
) -> Element {
    let mut response = elem.clone();
    response.set_attr("to", elem.attr("from").map(str::to_string));
    response.set_attr("from", elem.attr("to").map(str::to_string));
    response.set_attr("type", "error");

    let mut error = Element::builder("error", ns::CLIENT)
        .attr("type", condition.error_type().as_str())
        .append(Element::builder(condition.as_str(), ns::STANZAS).build())
        .build();
    for child in extra {
        error.append_child(child);
    }
    response.append_child(error);
    response
}

/// Append a `<delay/>` child recording when and by whom the element was held
/// back (XEP-0203).
pub fn stamp_delay(elem: &mut Element, from: &str, text: &str) {
    let stamp = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
    let mut delay = Element::builder("delay", ns::DELAY)
        .attr("from", from)
        .attr("stamp", stamp)
        .build();
    delay.append_text_node(text);
    elem.append_child(delay);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_stream_open_envelope() {
        let mut parser = XmlStreamParser::new();
        parser.feed(
            b"<?xml version='1.0'?><stream:stream xmlns='jabber:client' \
              xmlns:stream='http://etherx.jabber.org/streams' to='jackal.im' version='1.0'>",
        );
        let frame = parser.next_frame().unwrap();
        match frame {
            Some(RawFrame::Open(header)) => {
                assert_eq!(header.to.as_deref(), Some("jackal.im"));
                assert_eq!(header.version.as_deref(), Some("1.0"));
                assert_eq!(header.stream_ns.as_deref(), Some(ns::STREAM));
            }
            other => panic!("expected stream open, got {:?}", other),
        }
    }

    #[test]
    fn attribute_extraction_walks_mixed_quoting() {
        let tag = "<stream:stream to='jackal.im' from=\"noelia@jackal.im\" version='1.0'>";
        assert_eq!(extract_attribute(tag, "to").as_deref(), Some("jackal.im"));
        assert_eq!(
            extract_attribute(tag, "from").as_deref(),
            Some("noelia@jackal.im")
        );
        assert_eq!(extract_attribute(tag, "version").as_deref(), Some("1.0"));
        assert!(extract_attribute(tag, "id").is_none());

        // a value may carry the other quote character
        let tag = "<message label='a\"b'>";
        assert_eq!(extract_attribute(tag, "label").as_deref(), Some("a\"b"));
    }

    #[test]
    fn open_envelope_waits_for_complete_tag() {
        let mut parser = XmlStreamParser::new();
        parser.feed(b"<stream:stream xmlns='jabber:client' to='jackal.im'");
        assert!(parser.next_frame().unwrap().is_none());
        parser.feed(b" version='1.0'>");
        assert!(matches!(
            parser.next_frame().unwrap(),
            Some(RawFrame::Open(_))
        ));
    }

    #[test]
    fn parses_elements_after_open() {
        let mut parser = XmlStreamParser::new();
        parser.feed(b"<stream:stream xmlns='jabber:client' to='x' version='1.0'>");
        parser.next_frame().unwrap();

        parser.feed(b"<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>AGo=</auth>");
        match parser.next_frame().unwrap() {
            Some(RawFrame::Element(elem)) => {
                assert_eq!(elem.name(), "auth");
                assert_eq!(elem.attr("mechanism"), Some("PLAIN"));
                assert_eq!(elem.text(), "AGo=");
            }
            other => panic!("expected element, got {:?}", other),
        }
    }

    #[test]
    fn injects_default_namespace_when_inherited() {
        let mut parser = XmlStreamParser::new();
        parser.feed(b"<stream:stream xmlns='jabber:client' to='x' version='1.0'>");
        parser.next_frame().unwrap();

        parser.feed(b"<message to='bob@jackal.im' type='chat'><body>hi</body></message>");
        match parser.next_frame().unwrap() {
            Some(RawFrame::Element(elem)) => {
                assert_eq!(elem.name(), "message");
                assert!(elem.is("message", ns::CLIENT));
                assert!(elem.get_child("body", ns::CLIENT).is_some());
            }
            other => panic!("expected element, got {:?}", other),
        }
    }

    #[test]
    fn partial_element_returns_none_until_complete() {
        let mut parser = XmlStreamParser::new();
        parser.feed(b"<stream:stream xmlns='jabber:client' to='x' version='1.0'>");
        parser.next_frame().unwrap();

        parser.feed(b"<message><body>partial");
        assert!(parser.next_frame().unwrap().is_none());
        parser.feed(b"</body></message>");
        assert!(matches!(
            parser.next_frame().unwrap(),
            Some(RawFrame::Element(_))
        ));
    }

    #[test]
    fn stream_close_yields_close_frame() {
        let mut parser = XmlStreamParser::new();
        parser.feed(b"<stream:stream xmlns='jabber:client' to='x' version='1.0'>");
        parser.next_frame().unwrap();

        parser.feed(b"</stream:stream>");
        assert!(matches!(parser.next_frame().unwrap(), Some(RawFrame::Close)));
    }

    #[test]
    fn whitespace_keepalive_is_skipped() {
        let mut parser = XmlStreamParser::new();
        parser.feed(b"<stream:stream xmlns='jabber:client' to='x' version='1.0'>");
        parser.next_frame().unwrap();

        parser.feed(b"\n  \t<presence/>");
        match parser.next_frame().unwrap() {
            Some(RawFrame::Element(elem)) => assert_eq!(elem.name(), "presence"),
            other => panic!("expected element, got {:?}", other),
        }
    }

    #[test]
    fn rejects_restricted_xml() {
        let mut parser = XmlStreamParser::new();
        parser.feed(b"<stream:stream xmlns='jabber:client' to='x' version='1.0'>");
        parser.next_frame().unwrap();

        parser.feed(b"<!-- hello -->");
        assert!(parser.next_frame().is_err());
    }

    #[test]
    fn quoted_angle_bracket_does_not_break_scanning() {
        let mut parser = XmlStreamParser::new();
        parser.feed(b"<stream:stream xmlns='jabber:client' to='x' version='1.0'>");
        parser.next_frame().unwrap();

        parser.feed(b"<message label='a>b'><body>x</body></message>");
        match parser.next_frame().unwrap() {
            Some(RawFrame::Element(elem)) => assert_eq!(elem.attr("label"), Some("a>b")),
            other => panic!("expected element, got {:?}", other),
        }
    }

    #[test]
    fn error_response_swaps_addresses_and_carries_condition() {
        let elem: Element =
            "<iq xmlns='jabber:client' id='x' type='get' from='a@h/r' to='h'/>"
                .parse()
                .unwrap();
        let response = error_response(&elem, StanzaErrorCondition::ServiceUnavailable, vec![]);
        assert_eq!(response.attr("type"), Some("error"));
        assert_eq!(response.attr("id"), Some("x"));
        assert_eq!(response.attr("to"), Some("a@h/r"));
        assert_eq!(response.attr("from"), Some("h"));
        let error = response.get_child("error", ns::CLIENT).unwrap();
        assert_eq!(error.attr("type"), Some("cancel"));
        assert!(error
            .get_child("service-unavailable", ns::STANZAS)
            .is_some());
    }

    #[test]
    fn stamp_delay_appends_child() {
        let mut elem: Element = "<message xmlns='jabber:client'><body>hi</body></message>"
            .parse()
            .unwrap();
        stamp_delay(&mut elem, "jackal.im", "Offline Storage");
        let delay = elem.get_child("delay", ns::DELAY).unwrap();
        assert_eq!(delay.attr("from"), Some("jackal.im"));
        assert!(delay.attr("stamp").is_some());
    }
}
