//! Storage contract consumed by the core and its modules.
//!
//! Backends are external; `Ok(None)` means "not found" while `Err` is fatal
//! for the request in flight (the caller answers `internal-server-error`).
//! Implementations must be safe for concurrent callers.

mod memory;

pub use memory::MemoryStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use minidom::Element;

use crate::error::XmppError;

/// A registered account.
#[derive(Debug, Clone)]
pub struct User {
    /// Account node (localpart)
    pub username: String,
    /// Authentication secret; SCRAM keys are derived from it at auth time
    pub password: String,
    /// Last self-addressed presence, for last-activity queries
    pub last_presence: Option<Element>,
    /// When the last presence was observed
    pub last_presence_at: Option<DateTime<Utc>>,
}

impl User {
    /// Create an account with no presence history.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            last_presence: None,
            last_presence_at: None,
        }
    }
}

/// Roster subscription states relevant to the core (RFC 6121 §2.1.2.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subscription {
    None,
    To,
    From,
    Both,
}

/// One roster entry of `username` for `contact_jid`.
#[derive(Debug, Clone)]
pub struct RosterItem {
    /// Owning account node
    pub username: String,
    /// Contact bare JID
    pub contact_jid: String,
    /// Subscription state between the two
    pub subscription: Subscription,
}

/// Persistent state consumed by the C2S core and its modules.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Fetch an account by node.
    async fn fetch_user(&self, username: &str) -> Result<Option<User>, XmppError>;

    /// Fetch a stored vCard.
    async fn fetch_vcard(&self, username: &str) -> Result<Option<Element>, XmppError>;

    /// Store or replace a vCard.
    async fn insert_or_update_vcard(&self, vcard: &Element, username: &str)
        -> Result<(), XmppError>;

    /// Fetch the private XML elements stored under a namespace.
    async fn fetch_private_xml(
        &self,
        namespace: &str,
        username: &str,
    ) -> Result<Option<Vec<Element>>, XmppError>;

    /// Store or replace the private XML elements under a namespace.
    async fn insert_or_update_private_xml(
        &self,
        elements: &[Element],
        namespace: &str,
        username: &str,
    ) -> Result<(), XmppError>;

    /// Number of queued offline messages for an account.
    async fn count_offline_messages(&self, username: &str) -> Result<usize, XmppError>;

    /// Append a message to an account's offline queue.
    async fn insert_offline_message(
        &self,
        message: &Element,
        username: &str,
    ) -> Result<(), XmppError>;

    /// Fetch the whole offline queue in insertion order.
    async fn fetch_offline_messages(&self, username: &str) -> Result<Vec<Element>, XmppError>;

    /// Drop the whole offline queue.
    async fn delete_offline_messages(&self, username: &str) -> Result<(), XmppError>;

    /// Fetch one roster item of `username` for `contact_jid`.
    async fn fetch_roster_item(
        &self,
        username: &str,
        contact_jid: &str,
    ) -> Result<Option<RosterItem>, XmppError>;
}
