//! Shared helpers for the C2S integration suites.

use std::sync::Arc;
use std::time::Duration;

use base64::prelude::*;
use loon_xmpp::storage::User;
use loon_xmpp::{
    C2sConfig, C2sServer, LocalStream, MemoryStorage, MemoryTransport, Storage, TransportKind,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::time::{timeout, Instant};

pub const DOMAIN: &str = "jackal.im";

const WAIT: Duration = Duration::from_secs(3);

/// A server wired over in-memory transports.
pub struct TestEnv {
    pub server: C2sServer,
    pub storage: Arc<MemoryStorage>,
}

/// Build a test environment with `ortuman` and `bob` registered.
pub fn test_env(tweak: impl FnOnce(&mut C2sConfig)) -> TestEnv {
    let storage = Arc::new(MemoryStorage::new());
    storage.insert_user(User::new("ortuman", "pwd"));
    storage.insert_user(User::new("bob", "pwd"));

    let mut cfg = C2sConfig::new(DOMAIN);
    cfg.connect_timeout_secs = 0;
    cfg.tls = Some(loon_xmpp::transport::passthrough_tls_config());
    tweak(&mut cfg);

    let server = loon_xmpp::serve(cfg, Arc::clone(&storage) as Arc<dyn Storage>);
    TestEnv { server, storage }
}

/// Client end of an in-memory connection.
pub struct TestClient {
    stream: DuplexStream,
    buf: String,
}

impl TestClient {
    /// Wrap the client half of a transport pair created by hand.
    pub fn from_duplex(stream: DuplexStream) -> Self {
        Self {
            stream,
            buf: String::new(),
        }
    }

    pub async fn send(&mut self, xml: &str) {
        self.stream
            .write_all(xml.as_bytes())
            .await
            .expect("client write");
    }

    pub async fn open_stream(&mut self) {
        self.send(&format!(
            "<?xml version='1.0'?><stream:stream xmlns='jabber:client' \
             xmlns:stream='http://etherx.jabber.org/streams' to='{}' version='1.0'>",
            DOMAIN
        ))
        .await;
    }

    /// Read until `needle` appears, then return and consume everything read.
    ///
    /// Double quotes are normalized to single quotes so assertions are
    /// serializer-agnostic.
    pub async fn expect(&mut self, needle: &str) -> String {
        let deadline = Instant::now() + WAIT;
        let mut chunk = [0u8; 4096];
        loop {
            let normalized = self.buf.replace('"', "'");
            if normalized.contains(needle) {
                self.buf.clear();
                return normalized;
            }
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .unwrap_or_else(|| panic!("timed out waiting for {:?}; got {:?}", needle, self.buf));
            let read = timeout(remaining, self.stream.read(&mut chunk))
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {:?}; got {:?}", needle, self.buf))
                .expect("client read");
            if read == 0 {
                panic!("peer closed while waiting for {:?}; got {:?}", needle, self.buf);
            }
            self.buf.push_str(&String::from_utf8_lossy(&chunk[..read]));
        }
    }

    /// Read to EOF and return everything, quote-normalized.
    pub async fn read_to_eof(&mut self) -> String {
        let mut all = std::mem::take(&mut self.buf);
        let mut chunk = [0u8; 4096];
        loop {
            match timeout(WAIT, self.stream.read(&mut chunk)).await {
                Ok(Ok(0)) | Err(_) => return all.replace('"', "'"),
                Ok(Ok(read)) => all.push_str(&String::from_utf8_lossy(&chunk[..read])),
                Ok(Err(_)) => return all.replace('"', "'"),
            }
        }
    }
}

/// Attach a fresh connection of the given transport kind.
pub fn connect(env: &TestEnv, kind: TransportKind) -> (Arc<LocalStream>, TestClient) {
    let (transport, client) = MemoryTransport::pair(kind, 65536);
    let stream = env.server.register(Box::new(transport));
    (stream, TestClient::from_duplex(client))
}

pub fn plain_credentials(username: &str, password: &str) -> String {
    BASE64_STANDARD.encode(format!("\0{}\0{}", username, password))
}

/// Drive a websocket-kind connection through PLAIN auth, bind and session.
pub async fn establish_session(
    env: &TestEnv,
    username: &str,
    password: &str,
    resource: &str,
) -> (Arc<LocalStream>, TestClient) {
    let (stream, mut client) = connect(env, TransportKind::WebSocket);

    client.open_stream().await;
    let features = client.expect("</stream:features>").await;
    assert!(features.contains("<mechanism>PLAIN</mechanism>"));

    client
        .send(&format!(
            "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>{}</auth>",
            plain_credentials(username, password)
        ))
        .await;
    client.expect("<success").await;

    client.open_stream().await;
    let features = client.expect("</stream:features>").await;
    assert!(features.contains("bind"));

    client
        .send(&format!(
            "<iq id='bind-1' type='set'>\
             <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'>\
             <resource>{}</resource></bind></iq>",
            resource
        ))
        .await;
    client
        .expect(&format!("{}@{}/{}", username, DOMAIN, resource))
        .await;

    client
        .send("<iq id='sess-1' type='set'><session xmlns='urn:ietf:params:xml:ns:xmpp-session'/></iq>")
        .await;
    client.expect("id='sess-1'").await;

    (stream, client)
}

/// Poll until `probe` holds or panic after the shared timeout.
pub async fn wait_for(what: &str, mut probe: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !probe() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
