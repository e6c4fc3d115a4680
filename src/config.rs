//! C2S configuration.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Deserialize;

use crate::transport::CompressionLevel;

fn default_connect_timeout() -> u64 {
    5
}

fn default_max_stanza_size() -> usize {
    32768
}

fn default_sasl() -> Vec<SaslMechanism> {
    vec![
        SaslMechanism::Plain,
        SaslMechanism::ScramSha1,
        SaslMechanism::ScramSha256,
    ]
}

fn default_queue_size() -> usize {
    2500
}

fn default_true() -> bool {
    true
}

/// SASL mechanisms that can be offered.
///
/// `digest_md5` is deliberately not part of this set: RFC 6331 obsoleted
/// the mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaslMechanism {
    Plain,
    ScramSha1,
    ScramSha256,
}

/// What to do when a bind requests a resource that is already taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceConflict {
    /// Answer the bind with a `conflict` error (default).
    #[default]
    Reject,
    /// Bind under a fresh server-generated resource instead.
    Override,
    /// Evict the current holder with `resource-constraint`, then bind.
    Replace,
}

/// Stream compression options.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CompressionConfig {
    /// zlib level; `none` disables the feature entirely.
    #[serde(default)]
    pub level: CompressionLevel,
}

/// Offline message queue options.
#[derive(Debug, Clone, Deserialize)]
pub struct OfflineConfig {
    /// Maximum queued messages per account before bouncing.
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    /// Whether chat/groupchat messages carrying a body are archived.
    #[serde(default = "default_true")]
    pub store_chat_with_body: bool,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            queue_size: default_queue_size(),
            store_chat_with_body: true,
        }
    }
}

/// Module activation set.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModulesConfig {
    /// Feature names to instantiate. Recognized: `roster`, `offline`,
    /// `last_activity`, `private`, `vcard`, `version`, `ping`.
    /// Service discovery is always active.
    #[serde(default)]
    pub enabled: HashSet<String>,
}

impl ModulesConfig {
    pub fn is_enabled(&self, name: &str) -> bool {
        self.enabled.contains(name)
    }
}

/// Software version module options (XEP-0092).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VersionConfig {
    /// Whether the reply discloses the operating system.
    #[serde(default)]
    pub show_os: bool,
}

/// Configuration of the C2S service.
#[derive(Debug, Clone, Deserialize)]
pub struct C2sConfig {
    /// Served domain; stream opens addressed elsewhere are rejected with
    /// `host-unknown`.
    pub domain: String,
    /// Seconds granted to open the stream before `connection-timeout`;
    /// 0 disables the timer.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Byte cap on any single inbound stanza; beyond it the stream fails
    /// with `policy-violation`.
    #[serde(default = "default_max_stanza_size")]
    pub max_stanza_size: usize,
    /// Resource conflict policy applied at bind time.
    #[serde(default)]
    pub resource_conflict: ResourceConflict,
    /// Mechanisms offered, in order.
    #[serde(default = "default_sasl")]
    pub sasl: Vec<SaslMechanism>,
    #[serde(default)]
    pub compression: CompressionConfig,
    #[serde(default)]
    pub modules: ModulesConfig,
    #[serde(default)]
    pub offline: OfflineConfig,
    #[serde(default)]
    pub version: VersionConfig,
    /// TLS configuration handed to the transport on STARTTLS. When absent,
    /// STARTTLS requests are answered with a failure.
    #[serde(skip)]
    pub tls: Option<Arc<rustls::ServerConfig>>,
}

impl C2sConfig {
    /// Configuration with defaults for the given served domain.
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            connect_timeout_secs: default_connect_timeout(),
            max_stanza_size: default_max_stanza_size(),
            resource_conflict: ResourceConflict::default(),
            sasl: default_sasl(),
            compression: CompressionConfig::default(),
            modules: ModulesConfig::default(),
            offline: OfflineConfig::default(),
            version: VersionConfig::default(),
            tls: None,
        }
    }
}
