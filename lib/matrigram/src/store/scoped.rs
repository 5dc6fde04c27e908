// Copyright 2024 - developers of the `matrigram` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::net::{SocketAddrV4, SocketAddrV6};
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use grammers_session::defs::DcOption;
use grammers_session::SessionData;
use log::warn;
use serde::{Deserialize, Serialize};

use super::StoreBackend;
use crate::ids::{PeerType, PortalKey};

const NS_LOGIN: &str = "login";
const NS_ACCESS_HASH: &str = "access-hash";
const NS_USERNAME: &str = "username";
const NS_PHONE: &str = "phone";
const NS_PORTAL: &str = "portal";
const NS_MESSAGE: &str = "message";
const NS_REACTION: &str = "reaction";
const NS_EMOJI_FILE: &str = "emoji-file";

const KEY_METADATA: &str = "metadata";

/// The persisted MTProto session of one login: permanent auth key plus
/// the datacenter it is bound to. Everything else in the session state
/// is reconstructable.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionBlob {
    pub dc_id: i32,
    pub ipv4: String,
    pub ipv6: String,
    /// Base64 of the 256-byte permanent authorization key.
    pub auth_key: String,
}

impl SessionBlob {
    /// Capture the blob out of a live session's state.
    pub fn from_session_data(data: &SessionData) -> Option<Self> {
        let dc = data.dc_options.get(&data.home_dc)?;
        Some(Self {
            dc_id: dc.id,
            ipv4: dc.ipv4.to_string(),
            ipv6: dc.ipv6.to_string(),
            auth_key: STANDARD_NO_PAD.encode(dc.auth_key?),
        })
    }

    /// Rebuild session state that will resume this authorization.
    pub fn to_session_data(&self) -> SessionData {
        let mut data = SessionData::default();
        data.home_dc = self.dc_id;

        let auth_key = STANDARD_NO_PAD
            .decode(&self.auth_key)
            .ok()
            .and_then(|bytes| <[u8; 256]>::try_from(bytes).ok());
        let (ipv4, ipv6) = match (self.ipv4.parse::<SocketAddrV4>(), self.ipv6.parse::<SocketAddrV6>()) {
            (Ok(v4), Ok(v6)) => (v4, v6),
            _ => match data.dc_options.get(&self.dc_id) {
                Some(known) => (known.ipv4, known.ipv6),
                None => return data,
            },
        };
        if auth_key.is_none() {
            warn!("stored session blob has an unusable auth key; login will need to re-auth");
        }

        data.dc_options.insert(
            self.dc_id,
            DcOption {
                id: self.dc_id,
                ipv4,
                ipv6,
                auth_key,
            },
        );
        data
    }
}

/// Everything persisted about one login besides the bridged records.
///
/// The session blob, the push key and the takeout handle are the only
/// fields whose loss is user-visible; the rest is cache.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoginMetadata {
    pub user_id: i64,
    pub phone: String,
    pub session: Option<SessionBlob>,
    /// Base64 of the 256 random bytes registered with Telegram for push
    /// payload encryption.
    pub push_key: String,
    pub takeout_id: Option<i64>,
    pub dialog_crawl_cursor: Option<String>,
    pub dialog_crawl_done: bool,
    /// Portal ids currently pinned on the Telegram side.
    pub pinned: Vec<String>,
}

impl LoginMetadata {
    pub fn new(user_id: i64, phone: String) -> Self {
        let mut key = [0u8; 256];
        getrandom::getrandom(&mut key).expect("failed to generate push key");
        Self {
            user_id,
            phone,
            session: None,
            push_key: STANDARD_NO_PAD.encode(key),
            takeout_id: None,
            dialog_crawl_cursor: None,
            dialog_crawl_done: false,
            pinned: Vec::new(),
        }
    }

    pub fn push_key_bytes(&self) -> Option<[u8; 256]> {
        let bytes = STANDARD_NO_PAD.decode(&self.push_key).ok()?;
        <[u8; 256]>::try_from(bytes).ok()
    }
}

/// Portal-level state the converters need at hand.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PortalMeta {
    pub name: Option<String>,
    pub is_supergroup: bool,
    pub dm: bool,
    /// Disappearing-message period applied to new messages, if set.
    pub messages_ttl: Option<i32>,
    /// `None` = all reactions allowed, empty = none, list = whitelist.
    pub allowed_reactions: Option<Vec<String>>,
    pub read_upto: i32,
}

/// One bridged message part. Uniqueness: `(telegram id, portal, part)`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageRecord {
    pub portal: String,
    pub tg_message_id: i32,
    pub part_id: String,
    pub mxid: String,
    pub sender: String,
    pub timestamp: i64,
    pub edit_count: i32,
    /// Hex SHA-256 over the Telegram text plus the stable media id.
    pub content_hash: String,
    /// Telegram photo/document id of the bridged media, if any.
    pub media_id: Option<i64>,
    /// Matrix content URI of the bridged media, used to skip re-uploads
    /// on edits that do not change the media.
    pub content_uri: Option<String>,
}

impl MessageRecord {
    fn key(portal: &str, tg_message_id: i32, part_id: &str) -> String {
        // Zero-padded so string order matches numeric order on scans.
        format!("{tg_message_id:010}:{portal}:{part_id}")
    }
}

/// One bridged reaction.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReactionRecord {
    pub portal: String,
    pub tg_message_id: i32,
    pub sender: String,
    pub emoji_id: String,
    pub mxid: String,
}

impl ReactionRecord {
    fn key(portal: &str, tg_message_id: i32, sender: &str, emoji_id: &str) -> String {
        format!("{portal}:{tg_message_id:010}:{sender}:{emoji_id}")
    }
}

/// Typed, per-login facade over the framework's key/value backend.
///
/// Safe for concurrent callers; every write is last-writer-wins.
#[derive(Clone)]
pub struct ScopedStore {
    backend: Arc<dyn StoreBackend>,
    login: String,
}

impl ScopedStore {
    pub fn new(backend: Arc<dyn StoreBackend>, login: impl Into<String>) -> Self {
        Self {
            backend,
            login: login.into(),
        }
    }

    pub fn login_id(&self) -> &str {
        &self.login
    }

    pub fn backend(&self) -> &Arc<dyn StoreBackend> {
        &self.backend
    }

    fn get_json<T: for<'de> Deserialize<'de>>(&self, ns: &str, key: &str) -> Option<T> {
        let raw = self.backend.get(&self.login, ns, key)?;
        match serde_json::from_slice(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("discarding undecodable {ns}/{key} record: {e}");
                None
            }
        }
    }

    fn put_json<T: Serialize>(&self, ns: &str, key: &str, value: &T) {
        let raw = serde_json::to_vec(value).expect("record serialization cannot fail");
        self.backend.put(&self.login, ns, key, raw);
    }

    // Login metadata.

    pub fn login_metadata(&self) -> Option<LoginMetadata> {
        self.get_json(NS_LOGIN, KEY_METADATA)
    }

    pub fn set_login_metadata(&self, metadata: &LoginMetadata) {
        self.put_json(NS_LOGIN, KEY_METADATA, metadata);
    }

    /// Read-modify-write helper for single metadata fields.
    pub fn update_login_metadata(&self, f: impl FnOnce(&mut LoginMetadata)) {
        if let Some(mut metadata) = self.login_metadata() {
            f(&mut metadata);
            self.set_login_metadata(&metadata);
        }
    }

    // Access hashes. Learned implicitly from every response carrying
    // entity objects; stale values are overwritten on every observation.

    pub fn access_hash(&self, peer_type: PeerType, id: i64) -> Option<i64> {
        let raw = self
            .backend
            .get(&self.login, NS_ACCESS_HASH, &format!("{peer_type}:{id}"))?;
        String::from_utf8(raw).ok()?.parse().ok()
    }

    pub fn set_access_hash(&self, peer_type: PeerType, id: i64, hash: i64) {
        self.backend.put(
            &self.login,
            NS_ACCESS_HASH,
            &format!("{peer_type}:{id}"),
            hash.to_string().into_bytes(),
        );
    }

    // Username and phone resolution caches.

    pub fn entity_by_username(&self, username: &str) -> Option<(PeerType, i64)> {
        let raw = self
            .backend
            .get(&self.login, NS_USERNAME, &username.to_lowercase())?;
        let text = String::from_utf8(raw).ok()?;
        let portal = PortalKey::parse(&text).ok()?;
        Some((portal.peer_type, portal.id))
    }

    pub fn set_username(&self, peer_type: PeerType, id: i64, username: &str) {
        self.backend.put(
            &self.login,
            NS_USERNAME,
            &username.to_lowercase(),
            format!("{peer_type}:{id}").into_bytes(),
        );
        self.backend.put(
            &self.login,
            NS_USERNAME,
            &format!("rev:{peer_type}:{id}"),
            username.as_bytes().to_vec(),
        );
    }

    pub fn username_of(&self, peer_type: PeerType, id: i64) -> Option<String> {
        let raw = self
            .backend
            .get(&self.login, NS_USERNAME, &format!("rev:{peer_type}:{id}"))?;
        String::from_utf8(raw).ok()
    }

    pub fn user_id_by_phone(&self, normalized_phone: &str) -> Option<i64> {
        let raw = self.backend.get(&self.login, NS_PHONE, normalized_phone)?;
        String::from_utf8(raw).ok()?.parse().ok()
    }

    pub fn set_phone(&self, normalized_phone: &str, user_id: i64) {
        self.backend.put(
            &self.login,
            NS_PHONE,
            normalized_phone,
            user_id.to_string().into_bytes(),
        );
    }

    // Portal metadata.

    pub fn portal_meta(&self, portal: PortalKey) -> Option<PortalMeta> {
        self.get_json(NS_PORTAL, &portal.to_string())
    }

    pub fn set_portal_meta(&self, portal: PortalKey, meta: &PortalMeta) {
        self.put_json(NS_PORTAL, &portal.to_string(), meta);
    }

    pub fn update_portal_meta(&self, portal: PortalKey, f: impl FnOnce(&mut PortalMeta)) {
        let mut meta = self.portal_meta(portal).unwrap_or_default();
        f(&mut meta);
        self.set_portal_meta(portal, &meta);
    }

    // Message records.

    pub fn put_message(&self, record: &MessageRecord) {
        let key = MessageRecord::key(&record.portal, record.tg_message_id, &record.part_id);
        self.put_json(NS_MESSAGE, &key, record);
    }

    pub fn message_parts(&self, portal: PortalKey, tg_message_id: i32) -> Vec<MessageRecord> {
        let portal = portal.to_string();
        let prefix = format!("{tg_message_id:010}:{portal}:");
        self.backend
            .scan(&self.login, NS_MESSAGE)
            .into_iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(_, raw)| serde_json::from_slice(&raw).ok())
            .collect()
    }

    /// All records with the given Telegram id, across every portal the
    /// login participates in. A single non-channel delete may hit
    /// several rooms.
    pub fn messages_by_tg_id(&self, tg_message_id: i32) -> Vec<MessageRecord> {
        let prefix = format!("{tg_message_id:010}:");
        self.backend
            .scan(&self.login, NS_MESSAGE)
            .into_iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(_, raw)| serde_json::from_slice(&raw).ok())
            .collect()
    }

    pub fn delete_message(&self, portal: PortalKey, tg_message_id: i32, part_id: &str) {
        let key = MessageRecord::key(&portal.to_string(), tg_message_id, part_id);
        self.backend.delete(&self.login, NS_MESSAGE, &key);
    }

    // Reaction records.

    pub fn put_reaction(&self, record: &ReactionRecord) {
        let key = ReactionRecord::key(
            &record.portal,
            record.tg_message_id,
            &record.sender,
            &record.emoji_id,
        );
        self.put_json(NS_REACTION, &key, record);
    }

    pub fn reactions_for_message(
        &self,
        portal: PortalKey,
        tg_message_id: i32,
    ) -> Vec<ReactionRecord> {
        let prefix = format!("{}:{tg_message_id:010}:", portal);
        self.backend
            .scan(&self.login, NS_REACTION)
            .into_iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(_, raw)| serde_json::from_slice(&raw).ok())
            .collect()
    }

    pub fn delete_reaction(
        &self,
        portal: PortalKey,
        tg_message_id: i32,
        sender: &str,
        emoji_id: &str,
    ) {
        let key = ReactionRecord::key(&portal.to_string(), tg_message_id, sender, emoji_id);
        self.backend.delete(&self.login, NS_REACTION, &key);
    }

    // Custom emoji files bridged to the Matrix media repository. Mapped
    // both ways so outgoing reactions can reuse a known document id.

    pub fn emoji_file_by_mxc(&self, mxc: &str) -> Option<i64> {
        let raw = self
            .backend
            .get(&self.login, NS_EMOJI_FILE, &format!("mxc:{mxc}"))?;
        String::from_utf8(raw).ok()?.parse().ok()
    }

    pub fn emoji_mxc_by_document(&self, document_id: i64) -> Option<String> {
        let raw = self
            .backend
            .get(&self.login, NS_EMOJI_FILE, &format!("doc:{document_id}"))?;
        String::from_utf8(raw).ok()
    }

    pub fn set_emoji_file(&self, document_id: i64, mxc: &str) {
        self.backend.put(
            &self.login,
            NS_EMOJI_FILE,
            &format!("mxc:{mxc}"),
            document_id.to_string().into_bytes(),
        );
        self.backend.put(
            &self.login,
            NS_EMOJI_FILE,
            &format!("doc:{document_id}"),
            mxc.as_bytes().to_vec(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn store() -> ScopedStore {
        ScopedStore::new(Arc::new(MemoryStore::new()), "100")
    }

    #[test]
    fn access_hash_learning() {
        let store = store();
        assert_eq!(store.access_hash(PeerType::Channel, 10), None);
        store.set_access_hash(PeerType::Channel, 10, 0x1234);
        assert_eq!(store.access_hash(PeerType::Channel, 10), Some(0x1234));
        // Stale values are overwritten.
        store.set_access_hash(PeerType::Channel, 10, 0x5678);
        assert_eq!(store.access_hash(PeerType::Channel, 10), Some(0x5678));
    }

    #[test]
    fn username_resolution() {
        let store = store();
        store.set_username(PeerType::User, 42, "SomeBody");
        assert_eq!(store.entity_by_username("somebody"), Some((PeerType::User, 42)));
        assert_eq!(store.entity_by_username("nobody"), None);
    }

    #[test]
    fn message_records_by_tg_id() {
        let store = store();
        let record = MessageRecord {
            portal: PortalKey::user(5).to_string(),
            tg_message_id: 77,
            part_id: "0".into(),
            mxid: "$a".into(),
            sender: "5".into(),
            timestamp: 0,
            edit_count: 0,
            content_hash: "00".into(),
            media_id: None,
            content_uri: None,
        };
        store.put_message(&record);
        let mut other = record.clone();
        other.portal = PortalKey::chat(9).to_string();
        other.mxid = "$b".into();
        store.put_message(&other);

        let found = store.messages_by_tg_id(77);
        assert_eq!(found.len(), 2);
        assert_eq!(store.message_parts(PortalKey::user(5), 77), vec![record]);
        assert!(store.messages_by_tg_id(78).is_empty());
    }

    #[test]
    fn session_blob_roundtrip() {
        let mut data = SessionData::default();
        data.home_dc = 2;
        let mut dc = data.dc_options.get(&2).unwrap().clone();
        dc.auth_key = Some([7u8; 256]);
        data.dc_options.insert(2, dc);

        let blob = SessionBlob::from_session_data(&data).unwrap();
        let restored = blob.to_session_data();
        assert_eq!(restored.home_dc, 2);
        assert_eq!(restored.dc_options.get(&2).unwrap().auth_key, Some([7u8; 256]));
    }

    #[test]
    fn login_metadata_push_key() {
        let metadata = LoginMetadata::new(100, "+15551234567".into());
        let key = metadata.push_key_bytes().unwrap();
        assert_eq!(key.len(), 256);
        // Regenerating produces a different key; persisting must not.
        let store = store();
        store.set_login_metadata(&metadata);
        assert_eq!(store.login_metadata().unwrap().push_key_bytes().unwrap(), key);
    }
}
