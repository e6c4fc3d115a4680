//! In-memory storage backend.
//!
//! Backs the test suites and small embedded deployments. Every map is a
//! `DashMap`, so concurrent module actors can call in without coordination.

use async_trait::async_trait;
use dashmap::DashMap;
use minidom::Element;

use super::{RosterItem, Storage, User};
use crate::error::XmppError;

/// Concurrent in-memory implementation of [`Storage`].
#[derive(Default)]
pub struct MemoryStorage {
    users: DashMap<String, User>,
    vcards: DashMap<String, Element>,
    private: DashMap<(String, String), Vec<Element>>,
    offline: DashMap<String, Vec<Element>>,
    roster: DashMap<(String, String), RosterItem>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an account.
    pub fn insert_user(&self, user: User) {
        self.users.insert(user.username.clone(), user);
    }

    /// Insert a roster item for lookups via `fetch_roster_item`.
    pub fn insert_roster_item(&self, item: RosterItem) {
        self.roster
            .insert((item.username.clone(), item.contact_jid.clone()), item);
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn fetch_user(&self, username: &str) -> Result<Option<User>, XmppError> {
        Ok(self.users.get(username).map(|u| u.clone()))
    }

    async fn fetch_vcard(&self, username: &str) -> Result<Option<Element>, XmppError> {
        Ok(self.vcards.get(username).map(|v| v.clone()))
    }

    async fn insert_or_update_vcard(
        &self,
        vcard: &Element,
        username: &str,
    ) -> Result<(), XmppError> {
        self.vcards.insert(username.to_string(), vcard.clone());
        Ok(())
    }

    async fn fetch_private_xml(
        &self,
        namespace: &str,
        username: &str,
    ) -> Result<Option<Vec<Element>>, XmppError> {
        Ok(self
            .private
            .get(&(username.to_string(), namespace.to_string()))
            .map(|v| v.clone()))
    }

    async fn insert_or_update_private_xml(
        &self,
        elements: &[Element],
        namespace: &str,
        username: &str,
    ) -> Result<(), XmppError> {
        self.private.insert(
            (username.to_string(), namespace.to_string()),
            elements.to_vec(),
        );
        Ok(())
    }

    async fn count_offline_messages(&self, username: &str) -> Result<usize, XmppError> {
        Ok(self.offline.get(username).map(|q| q.len()).unwrap_or(0))
    }

    async fn insert_offline_message(
        &self,
        message: &Element,
        username: &str,
    ) -> Result<(), XmppError> {
        self.offline
            .entry(username.to_string())
            .or_default()
            .push(message.clone());
        Ok(())
    }

    async fn fetch_offline_messages(&self, username: &str) -> Result<Vec<Element>, XmppError> {
        Ok(self.offline.get(username).map(|q| q.clone()).unwrap_or_default())
    }

    async fn delete_offline_messages(&self, username: &str) -> Result<(), XmppError> {
        self.offline.remove(username);
        Ok(())
    }

    async fn fetch_roster_item(
        &self,
        username: &str,
        contact_jid: &str,
    ) -> Result<Option<RosterItem>, XmppError> {
        Ok(self
            .roster
            .get(&(username.to_string(), contact_jid.to_string()))
            .map(|i| i.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Subscription;

    fn elem(s: &str) -> Element {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn user_lookup() {
        let storage = MemoryStorage::new();
        storage.insert_user(User::new("ortuman", "pwd"));

        let user = storage.fetch_user("ortuman").await.unwrap().unwrap();
        assert_eq!(user.password, "pwd");
        assert!(storage.fetch_user("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn vcard_round_trip() {
        let storage = MemoryStorage::new();
        assert!(storage.fetch_vcard("ortuman").await.unwrap().is_none());

        let vcard = elem("<vCard xmlns='vcard-temp'><FN>Miguel</FN></vCard>");
        storage.insert_or_update_vcard(&vcard, "ortuman").await.unwrap();

        let fetched = storage.fetch_vcard("ortuman").await.unwrap().unwrap();
        assert!(fetched.get_child("FN", "vcard-temp").is_some());
    }

    #[tokio::test]
    async fn private_xml_is_keyed_by_namespace() {
        let storage = MemoryStorage::new();
        let exodus = elem("<exodus xmlns='exodus:ns'><stuff/></exodus>");
        storage
            .insert_or_update_private_xml(std::slice::from_ref(&exodus), "exodus:ns", "ortuman")
            .await
            .unwrap();

        let stored = storage
            .fetch_private_xml("exodus:ns", "ortuman")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert!(storage
            .fetch_private_xml("other:ns", "ortuman")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn offline_queue_lifecycle() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.count_offline_messages("bob").await.unwrap(), 0);

        let msg = elem("<message xmlns='jabber:client'><body>hi</body></message>");
        storage.insert_offline_message(&msg, "bob").await.unwrap();
        storage.insert_offline_message(&msg, "bob").await.unwrap();
        assert_eq!(storage.count_offline_messages("bob").await.unwrap(), 2);

        let queued = storage.fetch_offline_messages("bob").await.unwrap();
        assert_eq!(queued.len(), 2);

        storage.delete_offline_messages("bob").await.unwrap();
        assert_eq!(storage.count_offline_messages("bob").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn roster_item_lookup() {
        let storage = MemoryStorage::new();
        storage.insert_roster_item(RosterItem {
            username: "ortuman".to_string(),
            contact_jid: "noelia@jackal.im".to_string(),
            subscription: Subscription::Both,
        });

        let item = storage
            .fetch_roster_item("ortuman", "noelia@jackal.im")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.subscription, Subscription::Both);
        assert!(storage
            .fetch_roster_item("ortuman", "stranger@jackal.im")
            .await
            .unwrap()
            .is_none());
    }
}
