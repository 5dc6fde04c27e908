// Copyright 2024 - developers of the `matrigram` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Encrypted push notification handling.
//!
//! Telegram's push gateway delivers an MTProto encrypted-message record
//! keyed by the 256-byte push key each login registered. No live
//! connection is needed: the decryptor matches the envelope to a login
//! by key fingerprint, decrypts the payload and renders the
//! human-readable text. An optional wakeup may then bring the session
//! online to catch up on real data.

use std::fmt;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use grammers_crypto::decrypt_ige;
use log::debug;
use serde::Deserialize;
use sha1::{Digest as Sha1Digest, Sha1};
use sha2::{Digest as Sha2Digest, Sha256};

use crate::ids::{GhostId, PortalKey};
use crate::store::{ScopedStore, StoreBackend};

/// KDF offset for messages the server encrypts towards the client.
const KDF_X: usize = 8;

/// The JSON envelope carried by the push transport.
#[derive(Deserialize)]
struct Envelope {
    p: String,
}

#[derive(Deserialize, Default)]
struct PayloadCustom {
    #[serde(default)]
    msg_id: Option<serde_json::Value>,
    #[serde(default)]
    channel_id: Option<serde_json::Value>,
    #[serde(default)]
    chat_id: Option<serde_json::Value>,
    #[serde(default)]
    from_id: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct Payload {
    loc_key: String,
    #[serde(default)]
    loc_args: Vec<String>,
    #[serde(default)]
    custom: PayloadCustom,
    #[serde(default)]
    sound: Option<String>,
}

/// A decrypted, resolved push notification.
#[derive(Clone, Debug)]
pub struct PushNotification {
    /// The login whose key matched the envelope.
    pub login_id: i64,
    pub portal: Option<PortalKey>,
    pub sender: Option<GhostId>,
    pub message_id: Option<i32>,
    pub loc_key: String,
    /// Rendered human-readable text.
    pub text: String,
    pub sound: Option<String>,
}

/// This error occurs when an envelope cannot be decrypted.
#[derive(Debug)]
pub enum PushError {
    BadEnvelope,
    /// No login's push key matches the envelope's auth key id.
    UnknownKey,
    /// The payload failed its integrity check.
    MacMismatch,
    BadPayload,
}

impl fmt::Display for PushError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadEnvelope => write!(f, "push error: malformed envelope"),
            Self::UnknownKey => write!(f, "push error: no login matches the auth key id"),
            Self::MacMismatch => write!(f, "push error: payload integrity check failed"),
            Self::BadPayload => write!(f, "push error: undecodable payload"),
        }
    }
}

impl std::error::Error for PushError {}

/// Human-readable formats for the notification keys the bridge renders.
/// `%N` is replaced by `loc_args[N-1]`.
const LOC_KEY_FORMATS: &[(&str, &str)] = &[
    ("MESSAGE_TEXT", "%1: %2"),
    ("MESSAGE_NOTEXT", "%1 sent you a message"),
    ("MESSAGE_PHOTO", "%1 sent you a photo"),
    ("MESSAGE_VIDEO", "%1 sent you a video"),
    ("MESSAGE_DOC", "%1 sent you a document"),
    ("MESSAGE_AUDIO", "%1 sent you a voice message"),
    ("MESSAGE_STICKER", "%1 sent you a %2 sticker"),
    ("MESSAGE_GEO", "%1 sent you a location"),
    ("MESSAGE_CONTACT", "%1 shared a contact"),
    ("MESSAGE_POLL", "%1 sent you a poll %2"),
    ("MESSAGE_GIF", "%1 sent you a GIF"),
    ("MESSAGE_ROUND", "%1 sent you a video message"),
    ("MESSAGES", "%1 sent you an album"),
    ("CHAT_MESSAGE_TEXT", "%1 @ %2: %3"),
    ("CHAT_MESSAGE_NOTEXT", "%1 sent a message to the group %2"),
    ("CHAT_MESSAGE_PHOTO", "%1 sent a photo to the group %2"),
    ("CHAT_MESSAGE_VIDEO", "%1 sent a video to the group %2"),
    ("CHAT_MESSAGE_DOC", "%1 sent a document to the group %2"),
    ("CHAT_MESSAGE_AUDIO", "%1 sent a voice message to the group %2"),
    ("CHAT_MESSAGE_STICKER", "%1 sent a %3 sticker to the group %2"),
    ("CHAT_MESSAGE_GEO", "%1 sent a location to the group %2"),
    ("CHAT_MESSAGE_CONTACT", "%1 shared a contact in the group %2"),
    ("CHAT_MESSAGES", "%1 sent an album to the group %2"),
    ("CHANNEL_MESSAGE_TEXT", "%1: %2"),
    ("CHANNEL_MESSAGE_NOTEXT", "%1 posted a message"),
    ("CHANNEL_MESSAGE_PHOTO", "%1 posted a photo"),
    ("CHANNEL_MESSAGE_VIDEO", "%1 posted a video"),
    ("CHANNEL_MESSAGE_DOC", "%1 posted a document"),
    ("CHAT_ADD_YOU", "%1 invited you to the group %2"),
    ("CHAT_DELETE_YOU", "%1 removed you from the group %2"),
    ("CHAT_ADD_MEMBER", "%1 invited %3 to the group %2"),
    ("PINNED_TEXT", "%1 pinned \"%2\""),
    ("PHONE_CALL_REQUEST", "%1 is calling you"),
    ("PHONE_CALL_MISSED", "You missed a call from %1"),
    ("REACT_TEXT", "%1 reacted %2 to your message %3"),
];

fn render_loc_key(loc_key: &str, loc_args: &[String]) -> String {
    let template = LOC_KEY_FORMATS
        .iter()
        .find(|(key, _)| *key == loc_key)
        .map(|(_, template)| *template);
    match template {
        Some(template) => {
            let mut out = template.to_string();
            for (i, arg) in loc_args.iter().enumerate() {
                out = out.replace(&format!("%{}", i + 1), arg);
            }
            out
        }
        // Unknown keys still surface, just unrendered.
        None => {
            if loc_args.is_empty() {
                loc_key.to_string()
            } else {
                format!("{loc_key}: {}", loc_args.join(", "))
            }
        }
    }
}

fn value_as_i64(value: &Option<serde_json::Value>) -> Option<i64> {
    match value.as_ref()? {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// The low 8 bytes of SHA-1 over the key, same as MTProto auth key ids.
fn key_fingerprint(key: &[u8; 256]) -> [u8; 8] {
    let digest = Sha1::digest(key);
    digest[12..20].try_into().unwrap()
}

/// Derives the AES key and IV for one message key, MTProto 2.0 style.
fn derive_aes(auth_key: &[u8; 256], msg_key: &[u8; 16]) -> ([u8; 32], [u8; 32]) {
    let mut a = Sha256::new();
    a.update(msg_key);
    a.update(&auth_key[KDF_X..KDF_X + 36]);
    let a = a.finalize();

    let mut b = Sha256::new();
    b.update(&auth_key[40 + KDF_X..40 + KDF_X + 36]);
    b.update(msg_key);
    let b = b.finalize();

    let mut key = [0u8; 32];
    key[0..8].copy_from_slice(&a[0..8]);
    key[8..24].copy_from_slice(&b[8..24]);
    key[24..32].copy_from_slice(&a[24..32]);

    let mut iv = [0u8; 32];
    iv[0..8].copy_from_slice(&b[0..8]);
    iv[8..24].copy_from_slice(&a[8..24]);
    iv[24..32].copy_from_slice(&b[24..32]);

    (key, iv)
}

/// Matches encrypted envelopes to logins and decrypts their payloads.
pub struct PushDecryptor {
    backend: Arc<dyn StoreBackend>,
}

impl PushDecryptor {
    pub fn new(backend: Arc<dyn StoreBackend>) -> Self {
        Self { backend }
    }

    /// Decrypts one notification envelope.
    pub fn decrypt(&self, envelope: &[u8]) -> Result<PushNotification, PushError> {
        let envelope: Envelope =
            serde_json::from_slice(envelope).map_err(|_| PushError::BadEnvelope)?;
        let data = URL_SAFE_NO_PAD
            .decode(&envelope.p)
            .map_err(|_| PushError::BadEnvelope)?;
        if data.len() < 24 + 16 || (data.len() - 24) % 16 != 0 {
            return Err(PushError::BadEnvelope);
        }
        let auth_key_id: [u8; 8] = data[0..8].try_into().unwrap();
        let msg_key: [u8; 16] = data[8..24].try_into().unwrap();

        // Scan every login for the key whose fingerprint matches.
        for login in self.backend.logins() {
            let store = ScopedStore::new(Arc::clone(&self.backend), login);
            let metadata = match store.login_metadata() {
                Some(metadata) => metadata,
                None => continue,
            };
            let push_key = match metadata.push_key_bytes() {
                Some(key) => key,
                None => continue,
            };
            if key_fingerprint(&push_key) != auth_key_id {
                continue;
            }

            debug!("push envelope matches login {}", metadata.user_id);
            let (aes_key, aes_iv) = derive_aes(&push_key, &msg_key);
            let plaintext = decrypt_ige(&data[24..], &aes_key, &aes_iv);

            // Integrity: the message key must re-derive from the
            // decrypted plaintext.
            let mut check = Sha256::new();
            check.update(&push_key[88 + KDF_X..88 + KDF_X + 32]);
            check.update(&plaintext);
            let check = check.finalize();
            if check[8..24] != msg_key {
                return Err(PushError::MacMismatch);
            }

            if plaintext.len() < 4 {
                return Err(PushError::BadPayload);
            }
            let length = u32::from_le_bytes(plaintext[0..4].try_into().unwrap()) as usize;
            if plaintext.len() < 4 + length {
                return Err(PushError::BadPayload);
            }
            let payload: Payload = serde_json::from_slice(&plaintext[4..4 + length])
                .map_err(|_| PushError::BadPayload)?;

            let channel_id = value_as_i64(&payload.custom.channel_id);
            let chat_id = value_as_i64(&payload.custom.chat_id);
            let from_id = value_as_i64(&payload.custom.from_id);
            let portal = if let Some(id) = channel_id {
                Some(PortalKey::channel(id))
            } else if let Some(id) = chat_id {
                Some(PortalKey::chat(id))
            } else {
                from_id.map(PortalKey::user)
            };

            return Ok(PushNotification {
                login_id: metadata.user_id,
                portal,
                sender: from_id.map(GhostId::User),
                message_id: value_as_i64(&payload.custom.msg_id).map(|id| id as i32),
                text: render_loc_key(&payload.loc_key, &payload.loc_args),
                loc_key: payload.loc_key,
                sound: payload.sound,
            });
        }

        Err(PushError::UnknownKey)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{LoginMetadata, MemoryStore};
    use grammers_crypto::encrypt_ige;

    fn build_envelope(push_key: &[u8; 256], payload_json: &[u8]) -> Vec<u8> {
        let mut plaintext = (payload_json.len() as u32).to_le_bytes().to_vec();
        plaintext.extend_from_slice(payload_json);
        while plaintext.len() % 16 != 0 {
            plaintext.push(0);
        }

        let mut msg_key_src = Sha256::new();
        msg_key_src.update(&push_key[88 + KDF_X..88 + KDF_X + 32]);
        msg_key_src.update(&plaintext);
        let msg_key: [u8; 16] = msg_key_src.finalize()[8..24].try_into().unwrap();

        let (aes_key, aes_iv) = derive_aes(push_key, &msg_key);
        let ciphertext = encrypt_ige(&plaintext, &aes_key, &aes_iv);

        let mut data = key_fingerprint(push_key).to_vec();
        data.extend_from_slice(&msg_key);
        data.extend_from_slice(&ciphertext);
        format!("{{\"p\":\"{}\"}}", URL_SAFE_NO_PAD.encode(data)).into_bytes()
    }

    #[test]
    fn decrypts_matching_login() {
        let backend = Arc::new(MemoryStore::new());
        let store = ScopedStore::new(backend.clone(), "100");
        let metadata = LoginMetadata::new(100, "+15551234567".into());
        store.set_login_metadata(&metadata);

        let payload = br#"{"loc_key":"MESSAGE_TEXT","loc_args":["Some Body","hello"],"custom":{"msg_id":"42","from_id":"7"},"sound":"default"}"#;
        let envelope = build_envelope(&metadata.push_key_bytes().unwrap(), payload);

        let decryptor = PushDecryptor::new(backend);
        let notification = decryptor.decrypt(&envelope).unwrap();
        assert_eq!(notification.login_id, 100);
        assert_eq!(notification.text, "Some Body: hello");
        assert_eq!(notification.message_id, Some(42));
        assert_eq!(notification.sender, Some(GhostId::User(7)));
        assert_eq!(notification.portal, Some(PortalKey::user(7)));
        assert_eq!(notification.sound.as_deref(), Some("default"));
    }

    #[test]
    fn rejects_unknown_keys() {
        let backend = Arc::new(MemoryStore::new());
        let store = ScopedStore::new(backend.clone(), "100");
        store.set_login_metadata(&LoginMetadata::new(100, String::new()));

        let other_key = [9u8; 256];
        let envelope = build_envelope(&other_key, br#"{"loc_key":"X"}"#);
        let decryptor = PushDecryptor::new(backend);
        assert!(matches!(
            decryptor.decrypt(&envelope),
            Err(PushError::UnknownKey)
        ));
    }

    #[test]
    fn renders_group_formats() {
        assert_eq!(
            render_loc_key(
                "CHAT_MESSAGE_TEXT",
                &["A".to_string(), "B".to_string(), "hi".to_string()]
            ),
            "A @ B: hi"
        );
        assert_eq!(render_loc_key("SOMETHING_NEW", &[]), "SOMETHING_NEW");
    }
}
