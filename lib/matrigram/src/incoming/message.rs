// Copyright 2024 - developers of the `matrigram` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Message conversion, edits and deletes.

use std::collections::HashMap;

use grammers_tl_types as tl;
use log::{debug, warn};
use sha2::{Digest, Sha256};

use super::SessionClient;
use crate::bridge::events::{
    BridgeEvent, ConvertedEdit, ConvertedMessage, ConvertedPart, Disappearing, MessageProfile,
    PartKind,
};
use crate::errors::BridgeError;
use crate::ids::{GhostId, MessageId, PeerType, PortalKey};
use crate::parsers::{generate_matrix_html, EntityFormatContext};
use crate::store::MessageRecord;

/// Telegram encodes view-once media as this sentinel TTL.
const VIEW_ONCE_TTL: i32 = 2147483647;
/// View-once media self-destructs shortly after being read.
const VIEW_ONCE_SECONDS: i32 = 15;

/// Part id of a caption that could not be merged into its media part.
const CAPTION_PART: &str = "caption";

/// SHA-256 over the message body and the stable media identifier.
///
/// Two conversions of the same Telegram content must agree on this, so
/// it only covers data that is stable across conversions: the raw text
/// and the photo/document id (zero bytes for anything else).
pub(crate) fn content_hash(body: &str, media_id: Option<i64>) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(body.as_bytes());
    hasher.update(match media_id {
        Some(id) => (id as u64).to_be_bytes(),
        None => [0u8; 8],
    });
    hasher.finalize().into()
}

pub(crate) fn hash_hex(hash: &[u8; 32]) -> String {
    let mut out = String::with_capacity(64);
    for byte in hash {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn media_hash_id(media: Option<&tl::enums::MessageMedia>) -> Option<i64> {
    match media? {
        tl::enums::MessageMedia::Photo(m) => match &m.photo {
            Some(tl::enums::Photo::Photo(photo)) => Some(photo.id),
            _ => None,
        },
        tl::enums::MessageMedia::Document(m) => match &m.document {
            Some(tl::enums::Document::Document(document)) => Some(document.id),
            _ => None,
        },
        // Polls, dice, contacts and the rest hash as "no media".
        _ => None,
    }
}

fn media_ttl(media: Option<&tl::enums::MessageMedia>) -> Option<i32> {
    match media? {
        tl::enums::MessageMedia::Photo(m) => m.ttl_seconds,
        tl::enums::MessageMedia::Document(m) => m.ttl_seconds,
        _ => None,
    }
}

fn profile_slug(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect()
}

impl SessionClient {
    pub(crate) async fn on_new_message(
        &self,
        message: tl::enums::Message,
    ) -> Result<(), BridgeError> {
        match message {
            tl::enums::Message::Message(msg) => {
                let portal = self.portal_for_peer(&msg.peer_id);
                if portal.peer_type == PeerType::Channel && self.is_left_channel(portal.id) {
                    return Ok(());
                }
                let converted = self.convert_message(&msg, portal).await?;
                self.emit(BridgeEvent::Message(converted));
                // Reactions run on every message, empty or not; this is
                // also how cleared reactions on old messages propagate.
                let reactions = msg.reactions.map(tl::types::MessageReactions::from);
                self.sync_reactions(portal, msg.id, reactions.as_ref()).await
            }
            tl::enums::Message::Service(msg) => self.on_service_message(msg).await,
            tl::enums::Message::Empty(_) => Ok(()),
        }
    }

    /// The sender ghost of a message.
    ///
    /// `out` means the login itself; otherwise `from_id` when present,
    /// falling back to the peer, which is only correct for direct
    /// chats. Channel senders become the synthetic channel ghost.
    fn resolve_sender(&self, msg: &tl::types::Message, portal: PortalKey) -> GhostId {
        if msg.out {
            return self.self_ghost();
        }
        match &msg.from_id {
            Some(peer) => super::ghost_for_peer(peer),
            None => GhostId::User(portal.id),
        }
    }

    fn resolve_disappearing(
        &self,
        msg_media_ttl: Option<i32>,
        portal_ttl: Option<i32>,
    ) -> (Option<Disappearing>, bool) {
        match msg_media_ttl {
            Some(VIEW_ONCE_TTL) => {
                if self.config().disable_view_once {
                    (None, true)
                } else {
                    (
                        Some(Disappearing::AfterRead {
                            seconds: VIEW_ONCE_SECONDS,
                        }),
                        false,
                    )
                }
            }
            Some(seconds) if seconds > 0 => {
                (Some(Disappearing::AfterRead { seconds }), false)
            }
            _ => match portal_ttl {
                Some(seconds) if seconds > 0 => {
                    (Some(Disappearing::AfterSend { seconds }), false)
                }
                _ => (None, false),
            },
        }
    }

    fn format_context_parts(
        &self,
        text: &str,
        entities: Option<&Vec<tl::enums::MessageEntity>>,
    ) -> Option<String> {
        let entities = entities?;
        if entities.is_empty() {
            return None;
        }
        let store = self.store().clone();
        let config = self.config().clone();
        let mxid_for_username = move |username: &str| {
            store
                .entity_by_username(username)
                .and_then(|(_, id)| config.ghost_mxid(&GhostId::User(id)))
        };
        let config = self.config().clone();
        let mxid_for_user_id =
            move |user_id: i64| config.ghost_mxid(&GhostId::User(user_id));
        let store = self.store().clone();
        let mxc_for_custom_emoji = move |document_id: i64| store.emoji_mxc_by_document(document_id);

        let ctx = EntityFormatContext {
            mxid_for_username: Some(&mxid_for_username),
            mxid_for_user_id: Some(&mxid_for_user_id),
            mxc_for_custom_emoji: Some(&mxc_for_custom_emoji),
        };
        Some(generate_matrix_html(text, entities, &ctx))
    }

    /// Converts one Telegram message into its Matrix shape.
    pub(crate) async fn convert_message(
        &self,
        msg: &tl::types::Message,
        portal: PortalKey,
    ) -> Result<ConvertedMessage, BridgeError> {
        self.convert_message_with(msg, portal, None).await
    }

    async fn convert_message_with(
        &self,
        msg: &tl::types::Message,
        portal: PortalKey,
        reuse: Option<&MessageRecord>,
    ) -> Result<ConvertedMessage, BridgeError> {
        let sender = self.resolve_sender(msg, portal);
        let portal_meta = self.store().portal_meta(portal).unwrap_or_default();
        let media_id = media_hash_id(msg.media.as_ref());
        let (disappear, view_once_blocked) =
            self.resolve_disappearing(media_ttl(msg.media.as_ref()), portal_meta.messages_ttl);

        let formatted = self.format_context_parts(&msg.message, msg.entities.as_ref());

        let mut parts: Vec<ConvertedPart> = Vec::new();
        if view_once_blocked {
            parts.push(ConvertedPart {
                part_id: String::new(),
                kind: PartKind::Notice,
                body: "View-once media is not bridged".to_string(),
                formatted_body: None,
                media: None,
                media_id: None,
                geo_uri: None,
                link_preview: None,
                disappear: None,
                content_hash: content_hash(&msg.message, media_id),
            });
        } else {
            let media_result = match msg.media.as_ref() {
                Some(media) => self.convert_media(media, portal, msg.id, reuse).await?,
                None => None,
            };

            use crate::media::download::MediaResult;
            match media_result {
                Some(MediaResult::Media { kind, media }) => {
                    // Captions merge into the media part.
                    parts.push(ConvertedPart {
                        part_id: String::new(),
                        kind,
                        body: msg.message.clone(),
                        formatted_body: formatted.clone(),
                        media_id,
                        geo_uri: None,
                        link_preview: None,
                        disappear,
                        content_hash: content_hash(&msg.message, media_id),
                        media: Some(media),
                    });
                }
                Some(MediaResult::Location { body, geo_uri }) => {
                    parts.push(ConvertedPart {
                        part_id: String::new(),
                        kind: PartKind::Location,
                        body: if msg.message.is_empty() {
                            body
                        } else {
                            msg.message.clone()
                        },
                        formatted_body: formatted.clone(),
                        media: None,
                        media_id: None,
                        geo_uri: Some(geo_uri),
                        link_preview: None,
                        disappear,
                        content_hash: content_hash(&msg.message, media_id),
                    });
                }
                Some(MediaResult::Text { kind, body }) => {
                    parts.push(ConvertedPart {
                        part_id: String::new(),
                        kind,
                        body,
                        formatted_body: None,
                        media: None,
                        media_id: None,
                        geo_uri: None,
                        link_preview: None,
                        disappear,
                        content_hash: content_hash("", media_id),
                    });
                    if !msg.message.is_empty() {
                        parts.push(ConvertedPart {
                            part_id: CAPTION_PART.to_string(),
                            kind: PartKind::Text,
                            body: msg.message.clone(),
                            formatted_body: formatted.clone(),
                            media: None,
                            media_id: None,
                            geo_uri: None,
                            link_preview: None,
                            disappear,
                            content_hash: content_hash(&msg.message, None),
                        });
                    }
                }
                Some(MediaResult::Preview(preview)) => {
                    parts.push(ConvertedPart {
                        part_id: String::new(),
                        kind: PartKind::Text,
                        body: msg.message.clone(),
                        formatted_body: formatted.clone(),
                        media: None,
                        media_id: None,
                        geo_uri: None,
                        link_preview: Some(preview),
                        disappear,
                        content_hash: content_hash(&msg.message, media_id),
                    });
                }
                None => {
                    if !msg.message.is_empty() {
                        parts.push(ConvertedPart {
                            part_id: String::new(),
                            kind: PartKind::Text,
                            body: msg.message.clone(),
                            formatted_body: formatted.clone(),
                            media: None,
                            media_id: None,
                            geo_uri: None,
                            link_preview: None,
                            disappear,
                            content_hash: content_hash(&msg.message, media_id),
                        });
                    }
                }
            }
        }

        if parts.is_empty() {
            // Nothing representable; bridge a placeholder rather than a
            // hole in the room timeline.
            parts.push(ConvertedPart {
                part_id: String::new(),
                kind: PartKind::Notice,
                body: "Empty message".to_string(),
                formatted_body: None,
                media: None,
                media_id: None,
                geo_uri: None,
                link_preview: None,
                disappear,
                content_hash: content_hash(&msg.message, media_id),
            });
        }

        let reply_to = match &msg.reply_to {
            Some(tl::enums::MessageReplyHeader::Header(header)) => {
                header.reply_to_msg_id.map(|id| {
                    // Replies may point across portals; the header
                    // carries the peer when they do.
                    let reply_portal = header
                        .reply_to_peer_id
                        .as_ref()
                        .map(|peer| self.portal_for_peer(peer))
                        .unwrap_or(portal);
                    MessageId::make(reply_portal, id)
                })
            }
            _ => None,
        };

        // Broadcast posts all render under one channel ghost; the
        // per-message profile keeps distinct authors distinguishable.
        let profile = if portal.peer_type == PeerType::Channel
            && !portal_meta.is_supergroup
            && msg.post
        {
            let name = msg
                .post_author
                .clone()
                .or_else(|| portal_meta.name.clone())
                .unwrap_or_else(|| format!("Channel {}", portal.id));
            Some(MessageProfile {
                id: profile_slug(&name),
                name,
            })
        } else {
            None
        };

        Ok(ConvertedMessage {
            portal,
            sender,
            id: MessageId::make(portal, msg.id),
            timestamp: msg.date as i64,
            reply_to,
            parts,
            profile,
        })
    }

    /// Persists the records for a message the framework has bridged.
    ///
    /// `part_events` maps part ids to the Matrix event ids they became.
    /// Must be called for every bridged message; edit deduplication
    /// depends on these records.
    pub fn record_message(&self, message: &ConvertedMessage, part_events: &[(String, String)]) {
        let events: HashMap<&str, &str> = part_events
            .iter()
            .map(|(part, mxid)| (part.as_str(), mxid.as_str()))
            .collect();
        for part in &message.parts {
            let record = MessageRecord {
                portal: message.portal.to_string(),
                tg_message_id: message.id.id,
                part_id: part.part_id.clone(),
                mxid: events
                    .get(part.part_id.as_str())
                    .map(|mxid| mxid.to_string())
                    .unwrap_or_default(),
                sender: message.sender.to_string(),
                timestamp: message.timestamp,
                edit_count: 0,
                content_hash: hash_hex(&part.content_hash),
                media_id: part.media_id,
                content_uri: part
                    .media
                    .as_ref()
                    .and_then(|media| media.content_uri())
                    .map(str::to_string),
            };
            self.store().put_message(&record);
        }
    }

    pub(crate) async fn on_edit_message(
        &self,
        message: tl::enums::Message,
    ) -> Result<(), BridgeError> {
        let msg = match message {
            tl::enums::Message::Message(msg) => msg,
            _ => return Ok(()),
        };
        let portal = self.portal_for_peer(&msg.peer_id);

        // Telegram's service notification account edits its data-export
        // prompt in place once the user approves it.
        if portal.peer_type == PeerType::User
            && portal.id == 777000
            && msg.message.contains("Data export request")
            && msg.message.contains("Accepted")
        {
            debug!("takeout request accepted by service notification");
            self.0.takeout_accepted.set();
            return Ok(());
        }

        let mut stored = self.store().message_parts(portal, msg.id);
        if stored.is_empty() {
            debug!("edit for unknown message {portal}/{}; dropping", msg.id);
            return Ok(());
        }
        stored.sort_by(|a, b| a.part_id.cmp(&b.part_id));

        let reuse = stored.iter().find(|record| record.media_id.is_some());
        let converted = self
            .convert_message_with(&msg, portal, reuse)
            .await?;

        let (modified, updated_records) = diff_edit_parts(&stored, converted.parts)?;
        for record in updated_records {
            self.store().put_message(&record);
        }

        if modified.is_empty() {
            return Ok(());
        }
        self.emit(BridgeEvent::Edit(ConvertedEdit {
            portal,
            sender: converted.sender,
            id: converted.id,
            timestamp: msg.edit_date.unwrap_or(msg.date) as i64,
            parts: modified,
        }));
        Ok(())
    }

    /// Non-channel deletes do not say which chat they hit; a single
    /// update may fan out to several portals.
    pub(crate) fn on_delete_messages(&self, messages: &[i32]) -> Result<(), BridgeError> {
        let mut by_portal: HashMap<String, Vec<MessageRecord>> = HashMap::new();
        for &id in messages {
            for record in self.store().messages_by_tg_id(id) {
                by_portal.entry(record.portal.clone()).or_default().push(record);
            }
        }
        for (portal, records) in by_portal {
            let portal = match portal.parse() {
                Ok(portal) => portal,
                Err(_) => {
                    warn!("message record references unparseable portal {portal}");
                    continue;
                }
            };
            for record in &records {
                self.store()
                    .delete_message(portal, record.tg_message_id, &record.part_id);
            }
            self.emit(BridgeEvent::Delete { portal, records });
        }
        Ok(())
    }

    pub(crate) fn on_delete_channel_messages(
        &self,
        channel_id: i64,
        messages: &[i32],
    ) -> Result<(), BridgeError> {
        let portal = PortalKey::channel(channel_id);
        let mut records = Vec::new();
        for &id in messages {
            records.extend(self.store().message_parts(portal, id));
        }
        for record in &records {
            self.store()
                .delete_message(portal, record.tg_message_id, &record.part_id);
        }
        if !records.is_empty() {
            self.emit(BridgeEvent::Delete { portal, records });
        }
        Ok(())
    }
}

/// Computes the minimal set of parts an edit actually changed.
///
/// Returns the changed parts plus the refreshed records to persist. An
/// edit that adds or removes parts cannot be represented and fails.
pub(crate) fn diff_edit_parts(
    stored: &[MessageRecord],
    mut parts: Vec<ConvertedPart>,
) -> Result<(Vec<ConvertedPart>, Vec<MessageRecord>), BridgeError> {
    parts.sort_by(|a, b| a.part_id.cmp(&b.part_id));
    if parts.len() != stored.len() {
        return Err(BridgeError::PartCountChanged);
    }

    let mut modified = Vec::new();
    let mut updated_records = Vec::new();
    for (record, part) in stored.iter().zip(&parts) {
        if record.content_hash != hash_hex(&part.content_hash) {
            let mut updated = record.clone();
            updated.edit_count += 1;
            updated.content_hash = hash_hex(&part.content_hash);
            updated.media_id = part.media_id;
            updated.content_uri = part
                .media
                .as_ref()
                .and_then(|media| media.content_uri())
                .map(str::to_string)
                .or(updated.content_uri);
            updated_records.push(updated);
            modified.push(part.clone());
        }
    }
    Ok((modified, updated_records))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::events::{ConvertedMedia, MediaInfo};

    fn part(part_id: &str, body: &str, media_id: Option<i64>) -> ConvertedPart {
        ConvertedPart {
            part_id: part_id.to_string(),
            kind: if media_id.is_some() {
                PartKind::Image
            } else {
                PartKind::Text
            },
            body: body.to_string(),
            formatted_body: None,
            media: media_id.map(|id| ConvertedMedia::Uploaded {
                mxc: format!("mxc://h/{id}"),
                mime: "image/jpeg".to_string(),
                filename: None,
                size: None,
                info: MediaInfo::default(),
            }),
            media_id,
            geo_uri: None,
            link_preview: None,
            disappear: None,
            content_hash: content_hash(body, media_id),
        }
    }

    fn record_of(part: &ConvertedPart) -> MessageRecord {
        MessageRecord {
            portal: "user:5".to_string(),
            tg_message_id: 1,
            part_id: part.part_id.clone(),
            mxid: "$event".to_string(),
            sender: "5".to_string(),
            timestamp: 0,
            edit_count: 0,
            content_hash: hash_hex(&part.content_hash),
            media_id: part.media_id,
            content_uri: part
                .media
                .as_ref()
                .and_then(|media| media.content_uri())
                .map(str::to_string),
        }
    }

    #[test]
    fn unchanged_edit_produces_no_parts() {
        let parts = vec![part("", "hello", Some(9))];
        let stored: Vec<_> = parts.iter().map(record_of).collect();
        let (modified, records) = diff_edit_parts(&stored, parts).unwrap();
        assert!(modified.is_empty());
        assert!(records.is_empty());
    }

    #[test]
    fn body_change_touches_one_part() {
        let original = vec![part("", "media", Some(9)), part("caption", "old", None)];
        let stored: Vec<_> = original.iter().map(record_of).collect();

        let edited = vec![part("", "media", Some(9)), part("caption", "new", None)];
        let (modified, records) = diff_edit_parts(&stored, edited).unwrap();
        assert_eq!(modified.len(), 1);
        assert_eq!(modified[0].part_id, "caption");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].edit_count, 1);
    }

    #[test]
    fn media_change_touches_the_media_part() {
        let original = vec![part("", "media", Some(9)), part("caption", "same", None)];
        let stored: Vec<_> = original.iter().map(record_of).collect();

        let edited = vec![part("", "media", Some(10)), part("caption", "same", None)];
        let (modified, records) = diff_edit_parts(&stored, edited).unwrap();
        assert_eq!(modified.len(), 1);
        assert_eq!(modified[0].part_id, "");
        assert_eq!(records[0].media_id, Some(10));
        assert_eq!(records[0].content_uri.as_deref(), Some("mxc://h/10"));
    }

    #[test]
    fn part_count_change_is_rejected() {
        let original = vec![part("", "a", None)];
        let stored: Vec<_> = original.iter().map(record_of).collect();
        let edited = vec![part("", "a", None), part("caption", "b", None)];
        assert!(matches!(
            diff_edit_parts(&stored, edited),
            Err(BridgeError::PartCountChanged)
        ));
    }

    #[test]
    fn hash_is_stable() {
        assert_eq!(content_hash("hi", Some(7)), content_hash("hi", Some(7)));
        assert_ne!(content_hash("hi", Some(7)), content_hash("hi", Some(8)));
        assert_ne!(content_hash("hi", Some(7)), content_hash("ho", Some(7)));
        assert_ne!(content_hash("hi", None), content_hash("hi", Some(0x100)));
    }

    #[test]
    fn zero_media_matches_absent_media() {
        // The media hash id is "zero bytes" for non-media, which is the
        // same encoding an id of zero would produce.
        assert_eq!(content_hash("x", None), content_hash("x", Some(0)));
    }

    #[test]
    fn hex_encoding() {
        let hash = content_hash("", None);
        let hex = hash_hex(&hash);
        assert_eq!(hex.len(), 64);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn profile_slugs() {
        assert_eq!(profile_slug("Some Channel"), "some-channel");
        assert_eq!(profile_slug("News 24/7"), "news-24-7");
    }
}
