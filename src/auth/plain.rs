//! SASL PLAIN mechanism (RFC 4616).

use std::sync::Arc;

use async_trait::async_trait;
use base64::prelude::*;
use minidom::Element;
use tracing::debug;

use super::{success_element, AuthError, Authenticator};
use crate::error::SaslErrorCondition;
use crate::storage::Storage;

/// Server side of SASL PLAIN: one-shot `authzid \0 authcid \0 password`.
pub struct Plain {
    storage: Arc<dyn Storage>,
    username: String,
    authenticated: bool,
}

impl Plain {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            username: String::new(),
            authenticated: false,
        }
    }
}

#[async_trait]
impl Authenticator for Plain {
    fn mechanism(&self) -> &'static str {
        "PLAIN"
    }

    fn username(&self) -> String {
        self.username.clone()
    }

    fn authenticated(&self) -> bool {
        self.authenticated
    }

    async fn process_element(&mut self, elem: &Element) -> Result<Option<Element>, AuthError> {
        if self.authenticated {
            return Err(AuthError::Sasl(SaslErrorCondition::MalformedRequest));
        }
        let payload = elem.text();
        if payload.trim().is_empty() {
            return Err(AuthError::Sasl(SaslErrorCondition::MalformedRequest));
        }
        let decoded = BASE64_STANDARD
            .decode(payload.trim())
            .map_err(|_| AuthError::Sasl(SaslErrorCondition::IncorrectEncoding))?;

        let parts: Vec<&[u8]> = decoded.split(|&b| b == 0).collect();
        let (authcid, password) = match parts.as_slice() {
            [_authzid, authcid, password] => (authcid, password),
            [authcid, password] => (authcid, password),
            _ => return Err(AuthError::Sasl(SaslErrorCondition::MalformedRequest)),
        };
        if authcid.is_empty() || password.is_empty() {
            return Err(AuthError::Sasl(SaslErrorCondition::MalformedRequest));
        }
        let username = String::from_utf8_lossy(authcid).into_owned();
        let password = String::from_utf8_lossy(password).into_owned();

        let user = self
            .storage
            .fetch_user(&username)
            .await?
            .ok_or(AuthError::Sasl(SaslErrorCondition::NotAuthorized))?;
        if user.password != password {
            return Err(AuthError::Sasl(SaslErrorCondition::NotAuthorized));
        }

        debug!(username = %username, "PLAIN authentication succeeded");
        self.username = username;
        self.authenticated = true;
        Ok(Some(success_element(None)))
    }

    fn reset(&mut self) {
        self.username.clear();
        self.authenticated = false;
    }
}
