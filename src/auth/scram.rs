//! SCRAM SASL mechanisms, server side (RFC 5802, RFC 7677).
//!
//! Both SHA-1 and SHA-256 families are supported, each with a `-PLUS`
//! variant validating TLS channel binding. Salted keys are derived from the
//! stored password at authentication time with a per-exchange salt.

use std::sync::Arc;

use async_trait::async_trait;
use base64::prelude::*;
use hmac::{Hmac, Mac};
use minidom::Element;
use pbkdf2::pbkdf2_hmac;
use rand::Rng;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::{success_element, AuthError, Authenticator};
use crate::error::SaslErrorCondition;
use crate::storage::Storage;

/// PBKDF2 iteration count advertised in server-first-message.
const ITERATIONS: u32 = 4096;
/// Raw salt length in bytes.
const SALT_LENGTH: usize = 16;
/// Raw server nonce length in bytes, base64-encoded on the wire.
const NONCE_LENGTH: usize = 24;

/// Hash family of a SCRAM exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScramKind {
    Sha1,
    Sha256,
}

impl ScramKind {
    fn mechanism(&self, channel_binding: bool) -> &'static str {
        match (self, channel_binding) {
            (ScramKind::Sha1, false) => "SCRAM-SHA-1",
            (ScramKind::Sha1, true) => "SCRAM-SHA-1-PLUS",
            (ScramKind::Sha256, false) => "SCRAM-SHA-256",
            (ScramKind::Sha256, true) => "SCRAM-SHA-256-PLUS",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ScramState {
    Initial,
    WaitingForClientFinal,
}

/// Server side of one SCRAM exchange.
pub struct Scram {
    kind: ScramKind,
    uses_channel_binding: bool,
    storage: Arc<dyn Storage>,
    state: ScramState,
    channel_binding: Option<Vec<u8>>,
    username: String,
    authenticated: bool,
    gs2_header: String,
    client_first_bare: String,
    server_first: String,
    combined_nonce: String,
    stored_key: Vec<u8>,
    server_key: Vec<u8>,
}

impl Scram {
    pub fn new(kind: ScramKind, uses_channel_binding: bool, storage: Arc<dyn Storage>) -> Self {
        Self {
            kind,
            uses_channel_binding,
            storage,
            state: ScramState::Initial,
            channel_binding: None,
            username: String::new(),
            authenticated: false,
            gs2_header: String::new(),
            client_first_bare: String::new(),
            server_first: String::new(),
            combined_nonce: String::new(),
            stored_key: Vec::new(),
            server_key: Vec::new(),
        }
    }

    async fn process_client_first(&mut self, payload: &str) -> Result<Element, AuthError> {
        let parts: Vec<&str> = payload.splitn(3, ',').collect();
        if parts.len() < 3 {
            return Err(AuthError::Sasl(SaslErrorCondition::MalformedRequest));
        }

        let gs2_flag = parts[0];
        match (self.uses_channel_binding, gs2_flag.chars().next()) {
            (true, Some('p')) => {}
            (false, Some('n') | Some('y')) => {}
            _ => return Err(AuthError::Sasl(SaslErrorCondition::NotAuthorized)),
        }
        self.gs2_header = format!("{},{},", parts[0], parts[1]);
        self.client_first_bare = parts[2].to_string();

        let mut username = None;
        let mut client_nonce = None;
        for attr in self.client_first_bare.split(',') {
            if let Some(val) = attr.strip_prefix("n=") {
                username = Some(decode_sasl_name(val)?);
            } else if let Some(val) = attr.strip_prefix("r=") {
                client_nonce = Some(val.to_string());
            }
        }
        let username =
            username.ok_or(AuthError::Sasl(SaslErrorCondition::MalformedRequest))?;
        let client_nonce =
            client_nonce.ok_or(AuthError::Sasl(SaslErrorCondition::MalformedRequest))?;

        let user = self
            .storage
            .fetch_user(&username)
            .await?
            .ok_or(AuthError::Sasl(SaslErrorCondition::NotAuthorized))?;
        self.username = username;

        let salt = generate_salt();
        let salted_password = hi(self.kind, user.password.as_bytes(), &salt, ITERATIONS);
        let client_key = hmac(self.kind, &salted_password, b"Client Key");
        self.stored_key = hash(self.kind, &client_key);
        self.server_key = hmac(self.kind, &salted_password, b"Server Key");

        self.combined_nonce = format!("{}{}", client_nonce, generate_nonce());
        self.server_first = format!(
            "r={},s={},i={}",
            self.combined_nonce,
            BASE64_STANDARD.encode(&salt),
            ITERATIONS,
        );
        self.state = ScramState::WaitingForClientFinal;

        Ok(challenge_element(&self.server_first))
    }

    fn process_client_final(&mut self, payload: &str) -> Result<Element, AuthError> {
        let proof_idx = payload
            .rfind(",p=")
            .ok_or(AuthError::Sasl(SaslErrorCondition::MalformedRequest))?;
        let without_proof = &payload[..proof_idx];

        let mut channel_binding = None;
        let mut nonce = None;
        let mut proof = None;
        for attr in payload.split(',') {
            if let Some(val) = attr.strip_prefix("c=") {
                channel_binding = Some(val.to_string());
            } else if let Some(val) = attr.strip_prefix("r=") {
                nonce = Some(val.to_string());
            } else if let Some(val) = attr.strip_prefix("p=") {
                proof = Some(val.to_string());
            }
        }
        let channel_binding =
            channel_binding.ok_or(AuthError::Sasl(SaslErrorCondition::MalformedRequest))?;
        let nonce = nonce.ok_or(AuthError::Sasl(SaslErrorCondition::MalformedRequest))?;
        let proof = proof.ok_or(AuthError::Sasl(SaslErrorCondition::MalformedRequest))?;

        if nonce != self.combined_nonce {
            return Err(AuthError::Sasl(SaslErrorCondition::NotAuthorized));
        }
        self.verify_channel_binding(&channel_binding)?;

        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare, self.server_first, without_proof
        );
        let client_signature = hmac(self.kind, &self.stored_key, auth_message.as_bytes());
        let client_proof = BASE64_STANDARD
            .decode(&proof)
            .map_err(|_| AuthError::Sasl(SaslErrorCondition::IncorrectEncoding))?;
        if client_proof.len() != client_signature.len() {
            return Err(AuthError::Sasl(SaslErrorCondition::NotAuthorized));
        }
        let client_key: Vec<u8> = client_proof
            .iter()
            .zip(client_signature.iter())
            .map(|(a, b)| a ^ b)
            .collect();
        if hash(self.kind, &client_key) != self.stored_key {
            return Err(AuthError::Sasl(SaslErrorCondition::NotAuthorized));
        }

        let server_signature = hmac(self.kind, &self.server_key, auth_message.as_bytes());
        let server_final = format!("v={}", BASE64_STANDARD.encode(&server_signature));

        debug!(username = %self.username, mechanism = self.mechanism(), "SCRAM authentication succeeded");
        self.authenticated = true;
        Ok(success_element(Some(
            BASE64_STANDARD.encode(server_final.as_bytes()),
        )))
    }

    /// The `c=` attribute must echo the GS2 header, plus the TLS binding
    /// data for `-PLUS` mechanisms.
    fn verify_channel_binding(&self, encoded: &str) -> Result<(), AuthError> {
        let decoded = BASE64_STANDARD
            .decode(encoded)
            .map_err(|_| AuthError::Sasl(SaslErrorCondition::IncorrectEncoding))?;
        let mut expected = self.gs2_header.as_bytes().to_vec();
        if self.uses_channel_binding {
            let binding = self
                .channel_binding
                .as_ref()
                .ok_or(AuthError::Sasl(SaslErrorCondition::NotAuthorized))?;
            expected.extend_from_slice(binding);
        }
        if decoded != expected {
            return Err(AuthError::Sasl(SaslErrorCondition::NotAuthorized));
        }
        Ok(())
    }
}

#[async_trait]
impl Authenticator for Scram {
    fn mechanism(&self) -> &'static str {
        self.kind.mechanism(self.uses_channel_binding)
    }

    fn username(&self) -> String {
        self.username.clone()
    }

    fn authenticated(&self) -> bool {
        self.authenticated
    }

    fn set_channel_binding(&mut self, data: Option<Vec<u8>>) {
        self.channel_binding = data;
    }

    async fn process_element(&mut self, elem: &Element) -> Result<Option<Element>, AuthError> {
        let payload = decode_payload(&elem.text())?;
        match (self.state.clone(), elem.name()) {
            (ScramState::Initial, "auth") => {
                self.process_client_first(&payload).await.map(Some)
            }
            (ScramState::WaitingForClientFinal, "response") => {
                self.process_client_final(&payload).map(Some)
            }
            _ => Err(AuthError::Sasl(SaslErrorCondition::MalformedRequest)),
        }
    }

    fn reset(&mut self) {
        self.state = ScramState::Initial;
        self.username.clear();
        self.authenticated = false;
        self.gs2_header.clear();
        self.client_first_bare.clear();
        self.server_first.clear();
        self.combined_nonce.clear();
        self.stored_key.clear();
        self.server_key.clear();
    }
}

fn challenge_element(message: &str) -> Element {
    let mut challenge = Element::builder("challenge", crate::xml::ns::SASL).build();
    challenge.append_text_node(BASE64_STANDARD.encode(message.as_bytes()));
    challenge
}

fn decode_payload(text: &str) -> Result<String, AuthError> {
    let decoded = BASE64_STANDARD
        .decode(text.trim())
        .map_err(|_| AuthError::Sasl(SaslErrorCondition::IncorrectEncoding))?;
    String::from_utf8(decoded)
        .map_err(|_| AuthError::Sasl(SaslErrorCondition::IncorrectEncoding))
}

/// Decode RFC 5802 username escaping (`=2C` → `,`, `=3D` → `=`).
fn decode_sasl_name(name: &str) -> Result<String, AuthError> {
    let mut result = String::with_capacity(name.len());
    let mut chars = name.chars();
    while let Some(c) = chars.next() {
        if c == '=' {
            let escape: String = chars.by_ref().take(2).collect();
            match escape.as_str() {
                "2C" => result.push(','),
                "3D" => result.push('='),
                _ => return Err(AuthError::Sasl(SaslErrorCondition::MalformedRequest)),
            }
        } else {
            result.push(c);
        }
    }
    Ok(result)
}

fn generate_salt() -> Vec<u8> {
    let mut salt = vec![0u8; SALT_LENGTH];
    rand::rng().fill(&mut salt[..]);
    salt
}

fn generate_nonce() -> String {
    let mut nonce = vec![0u8; NONCE_LENGTH];
    rand::rng().fill(&mut nonce[..]);
    BASE64_STANDARD.encode(&nonce)
}

/// Hi() from RFC 5802: PBKDF2 over the family's HMAC.
fn hi(kind: ScramKind, password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8> {
    match kind {
        ScramKind::Sha1 => {
            let mut output = vec![0u8; 20];
            pbkdf2_hmac::<Sha1>(password, salt, iterations, &mut output);
            output
        }
        ScramKind::Sha256 => {
            let mut output = vec![0u8; 32];
            pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut output);
            output
        }
    }
}

fn hmac(kind: ScramKind, key: &[u8], data: &[u8]) -> Vec<u8> {
    match kind {
        ScramKind::Sha1 => {
            let mut mac =
                Hmac::<Sha1>::new_from_slice(key).expect("HMAC accepts any key length");
            mac.update(data);
            mac.finalize().into_bytes().to_vec()
        }
        ScramKind::Sha256 => {
            let mut mac =
                Hmac::<Sha256>::new_from_slice(key).expect("HMAC accepts any key length");
            mac.update(data);
            mac.finalize().into_bytes().to_vec()
        }
    }
}

fn hash(kind: ScramKind, data: &[u8]) -> Vec<u8> {
    match kind {
        ScramKind::Sha1 => {
            let mut hasher = Sha1::new();
            hasher.update(data);
            hasher.finalize().to_vec()
        }
        ScramKind::Sha256 => {
            let mut hasher = Sha256::new();
            hasher.update(data);
            hasher.finalize().to_vec()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStorage, User};
    use crate::xml::ns;

    fn storage_with_user() -> Arc<dyn Storage> {
        let storage = MemoryStorage::new();
        storage.insert_user(User::new("ortuman", "pencil"));
        Arc::new(storage)
    }

    fn sasl_element(name: &str, payload: &str) -> Element {
        let mut elem = Element::builder(name, ns::SASL).build();
        elem.append_text_node(BASE64_STANDARD.encode(payload.as_bytes()));
        elem
    }

    /// Client-side computation of the proof for a given server-first.
    fn client_final(
        kind: ScramKind,
        password: &str,
        gs2_header: &str,
        client_first_bare: &str,
        server_first: &str,
    ) -> String {
        let mut salt = None;
        let mut nonce = None;
        let mut iterations = None;
        for attr in server_first.split(',') {
            if let Some(val) = attr.strip_prefix("s=") {
                salt = Some(BASE64_STANDARD.decode(val).unwrap());
            } else if let Some(val) = attr.strip_prefix("r=") {
                nonce = Some(val.to_string());
            } else if let Some(val) = attr.strip_prefix("i=") {
                iterations = Some(val.parse::<u32>().unwrap());
            }
        }
        let (salt, nonce, iterations) = (salt.unwrap(), nonce.unwrap(), iterations.unwrap());

        let salted = hi(kind, password.as_bytes(), &salt, iterations);
        let client_key = hmac(kind, &salted, b"Client Key");
        let stored_key = hash(kind, &client_key);

        let channel = BASE64_STANDARD.encode(gs2_header.as_bytes());
        let without_proof = format!("c={},r={}", channel, nonce);
        let auth_message = format!("{},{},{}", client_first_bare, server_first, without_proof);
        let signature = hmac(kind, &stored_key, auth_message.as_bytes());
        let proof: Vec<u8> = client_key
            .iter()
            .zip(signature.iter())
            .map(|(a, b)| a ^ b)
            .collect();
        format!("{},p={}", without_proof, BASE64_STANDARD.encode(&proof))
    }

    async fn run_exchange(kind: ScramKind, password: &str) -> Result<(), AuthError> {
        let mut scram = Scram::new(kind, false, storage_with_user());
        let client_first_bare = "n=ortuman,r=clientnonce";
        let client_first = format!("n,,{}", client_first_bare);

        let challenge = scram
            .process_element(&sasl_element("auth", &client_first))
            .await?
            .unwrap();
        assert!(challenge.is("challenge", ns::SASL));
        let server_first =
            String::from_utf8(BASE64_STANDARD.decode(challenge.text().trim()).unwrap()).unwrap();

        let final_message = client_final(kind, password, "n,,", client_first_bare, &server_first);
        let success = scram
            .process_element(&sasl_element("response", &final_message))
            .await?
            .unwrap();
        assert!(success.is("success", ns::SASL));
        assert!(scram.authenticated());
        assert_eq!(scram.username(), "ortuman");
        Ok(())
    }

    #[tokio::test]
    async fn full_exchange_sha256() {
        run_exchange(ScramKind::Sha256, "pencil").await.unwrap();
    }

    #[tokio::test]
    async fn full_exchange_sha1() {
        run_exchange(ScramKind::Sha1, "pencil").await.unwrap();
    }

    #[tokio::test]
    async fn wrong_password_is_rejected() {
        let err = run_exchange(ScramKind::Sha256, "wrong").await.unwrap_err();
        assert_eq!(err.condition(), SaslErrorCondition::NotAuthorized);
    }

    #[tokio::test]
    async fn unknown_user_is_rejected() {
        let mut scram = Scram::new(ScramKind::Sha256, false, storage_with_user());
        let err = scram
            .process_element(&sasl_element("auth", "n,,n=nobody,r=nonce"))
            .await
            .unwrap_err();
        assert_eq!(err.condition(), SaslErrorCondition::NotAuthorized);
    }

    #[tokio::test]
    async fn plus_variant_requires_binding_data() {
        let mut scram = Scram::new(ScramKind::Sha256, true, storage_with_user());
        // gs2 flag 'n' is not acceptable for a -PLUS mechanism
        let err = scram
            .process_element(&sasl_element("auth", "n,,n=ortuman,r=nonce"))
            .await
            .unwrap_err();
        assert_eq!(err.condition(), SaslErrorCondition::NotAuthorized);
    }

    #[tokio::test]
    async fn plus_variant_validates_binding_bytes() {
        let mut scram = Scram::new(ScramKind::Sha256, true, storage_with_user());
        scram.set_channel_binding(Some(b"unique-binding".to_vec()));

        let client_first_bare = "n=ortuman,r=clientnonce";
        let gs2_header = "p=tls-unique,,";
        let challenge = scram
            .process_element(&sasl_element(
                "auth",
                &format!("{}{}", gs2_header, client_first_bare),
            ))
            .await
            .unwrap()
            .unwrap();
        let server_first =
            String::from_utf8(BASE64_STANDARD.decode(challenge.text().trim()).unwrap()).unwrap();

        // channel-binding attribute must carry gs2 header + binding bytes
        let mut nonce = String::new();
        for attr in server_first.split(',') {
            if let Some(val) = attr.strip_prefix("r=") {
                nonce = val.to_string();
            }
        }
        let mut cb = gs2_header.as_bytes().to_vec();
        cb.extend_from_slice(b"unique-binding");

        let salted = {
            let mut salt = Vec::new();
            let mut iterations = 0;
            for attr in server_first.split(',') {
                if let Some(val) = attr.strip_prefix("s=") {
                    salt = BASE64_STANDARD.decode(val).unwrap();
                } else if let Some(val) = attr.strip_prefix("i=") {
                    iterations = val.parse().unwrap();
                }
            }
            hi(ScramKind::Sha256, b"pencil", &salt, iterations)
        };
        let client_key = hmac(ScramKind::Sha256, &salted, b"Client Key");
        let stored_key = hash(ScramKind::Sha256, &client_key);
        let without_proof = format!("c={},r={}", BASE64_STANDARD.encode(&cb), nonce);
        let auth_message = format!("{},{},{}", client_first_bare, server_first, without_proof);
        let signature = hmac(ScramKind::Sha256, &stored_key, auth_message.as_bytes());
        let proof: Vec<u8> = client_key
            .iter()
            .zip(signature.iter())
            .map(|(a, b)| a ^ b)
            .collect();
        let final_message = format!("{},p={}", without_proof, BASE64_STANDARD.encode(&proof));

        let success = scram
            .process_element(&sasl_element("response", &final_message))
            .await
            .unwrap()
            .unwrap();
        assert!(success.is("success", ns::SASL));
        assert!(scram.authenticated());
    }

    #[tokio::test]
    async fn out_of_order_response_is_malformed() {
        let mut scram = Scram::new(ScramKind::Sha256, false, storage_with_user());
        let err = scram
            .process_element(&sasl_element("response", "c=biws,r=x,p=eA=="))
            .await
            .unwrap_err();
        assert_eq!(err.condition(), SaslErrorCondition::MalformedRequest);
    }

    #[tokio::test]
    async fn reset_returns_to_initial() {
        let mut scram = Scram::new(ScramKind::Sha256, false, storage_with_user());
        scram
            .process_element(&sasl_element("auth", "n,,n=ortuman,r=nonce"))
            .await
            .unwrap();
        scram.reset();
        // a fresh client-first is accepted again
        scram
            .process_element(&sasl_element("auth", "n,,n=ortuman,r=nonce2"))
            .await
            .unwrap();
    }
}
