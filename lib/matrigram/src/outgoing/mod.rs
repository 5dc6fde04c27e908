// Copyright 2024 - developers of the `matrigram` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The Matrix to Telegram event pipeline.
//!
//! Every entry point first waits for the connection to finish
//! initialising; inbound Matrix traffic must never race the handshake.
//! Errors out of here are classified by [`errors`] into the Matrix
//! message-status taxonomy.

pub mod errors;
mod reactions;

use grammers_tl_types as tl;
use log::{debug, warn};

use crate::bridge::events::PartKind;
use crate::client::SessionClient;
use crate::errors::BridgeError;
use crate::ids::{GhostId, MessageId, PeerType, PortalKey};
use crate::incoming::message::{content_hash, hash_hex};
use crate::media::UploadRequest;
use crate::parsers::{parse_matrix_html, MentionTarget, ParsedMessage, ParserContext};
use crate::store::MessageRecord;
use crate::util::random_id_from_transaction;

/// One Matrix room message to deliver to Telegram.
pub struct MatrixMessage {
    pub portal: PortalKey,
    /// Matrix event id of the message, recorded for dedup and edits.
    pub event_id: String,
    /// Transaction id; numeric ones double as the Telegram send nonce,
    /// which makes Matrix-side retries idempotent.
    pub txn_id: String,
    pub kind: PartKind,
    pub body: String,
    pub formatted_body: Option<String>,
    pub reply_to: Option<MessageId>,
    pub media: Option<MatrixMediaRef>,
    /// `geo:` URI for location messages.
    pub geo_uri: Option<String>,
}

/// A file in the Matrix media repository, plus client-provided info.
pub struct MatrixMediaRef {
    pub mxc: String,
    pub mime: String,
    pub filename: Option<String>,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub duration: Option<f64>,
    pub waveform: Vec<u32>,
    pub voice: bool,
}

/// An edit of a previously-bridged message.
pub struct MatrixEdit {
    pub portal: PortalKey,
    pub target: MessageId,
    pub body: String,
    pub formatted_body: Option<String>,
    pub media: Option<MatrixMediaRef>,
}

/// What the send produced, for the framework's message record.
#[derive(Clone, Debug)]
pub struct SentMessage {
    pub id: MessageId,
    pub timestamp: i64,
}

impl SessionClient {
    fn parse_outgoing(&self, body: &str, formatted: Option<&str>) -> ParsedMessage {
        match formatted {
            Some(html) => {
                let store = self.store().clone();
                let config = self.config().clone();
                let resolve_mention = move |mxid: &str| {
                    let ghost = config.ghost_from_mxid(mxid)?;
                    let user_id = match ghost {
                        GhostId::User(id) => id,
                        GhostId::Channel(_) => return None,
                    };
                    match store.username_of(PeerType::User, user_id) {
                        Some(username) => Some(MentionTarget::Username(username)),
                        None => Some(MentionTarget::Name { user_id }),
                    }
                };
                let store = self.store().clone();
                let resolve_emoji = move |mxc: &str| store.emoji_file_by_mxc(mxc);
                let ctx = ParserContext {
                    resolve_mention: Some(&resolve_mention),
                    resolve_emoji: Some(&resolve_emoji),
                };
                parse_matrix_html(html, &ctx)
            }
            None => ParsedMessage {
                text: body.to_string(),
                entities: Vec::new(),
            },
        }
    }

    /// Swaps by-id mentions for their input form, attaching the cached
    /// access hash.
    fn finalize_entities(
        &self,
        entities: Vec<tl::enums::MessageEntity>,
    ) -> Option<Vec<tl::enums::MessageEntity>> {
        if entities.is_empty() {
            return None;
        }
        Some(
            entities
                .into_iter()
                .map(|entity| match entity {
                    tl::enums::MessageEntity::MentionName(mention) => {
                        tl::types::InputMessageEntityMentionName {
                            offset: mention.offset,
                            length: mention.length,
                            user_id: tl::enums::InputUser::User(tl::types::InputUser {
                                user_id: mention.user_id,
                                access_hash: self
                                    .store()
                                    .access_hash(PeerType::User, mention.user_id)
                                    .unwrap_or_default(),
                            }),
                        }
                        .into()
                    }
                    entity => entity,
                })
                .collect(),
        )
    }

    fn reply_header(reply_to: Option<MessageId>) -> Option<tl::enums::InputReplyTo> {
        reply_to.map(|reply| {
            tl::types::InputReplyToMessage {
                reply_to_msg_id: reply.id,
                top_msg_id: None,
                reply_to_peer_id: None,
                quote_text: None,
                quote_entities: None,
                quote_offset: None,
                monoforum_peer_id: None,
                todo_item_id: None,
            }
            .into()
        })
    }

    /// Delivers one Matrix message to Telegram.
    pub async fn handle_matrix_message(
        &self,
        message: MatrixMessage,
    ) -> Result<SentMessage, BridgeError> {
        self.wait_ready().await?;
        let peer = self.input_peer(message.portal)?;
        let random_id = random_id_from_transaction(&message.txn_id);

        let parsed = match message.kind {
            PartKind::Emote => {
                // Telegram has no emote rendering; inline the intent.
                let mut parsed = self.parse_outgoing(&message.body, None);
                parsed.text = format!("/me {}", parsed.text);
                parsed
            }
            _ => self.parse_outgoing(&message.body, message.formatted_body.as_deref()),
        };
        let entities = self.finalize_entities(parsed.entities);

        let media = if let Some(media) = &message.media {
            let data = self
                .0
                .media
                .download(&media.mxc)
                .await
                .map_err(|e| BridgeError::Media(e.to_string()))?;
            let request = UploadRequest {
                kind: if media.voice { PartKind::Voice } else { message.kind },
                mime: media.mime.clone(),
                filename: media.filename.clone(),
                width: media.width,
                height: media.height,
                duration: media.duration,
                waveform: media.waveform.clone(),
            };
            Some(self.prepare_upload(&request, data).await?)
        } else if let Some(geo) = &message.geo_uri {
            Some(parse_geo_uri(geo)?)
        } else {
            None
        };

        let updates = if let Some(media) = media {
            self.raw()?
                .invoke(&tl::functions::messages::SendMedia {
                    silent: false,
                    background: false,
                    clear_draft: false,
                    noforwards: false,
                    update_stickersets_order: false,
                    invert_media: false,
                    allow_paid_floodskip: false,
                    peer,
                    reply_to: Self::reply_header(message.reply_to),
                    media,
                    message: parsed.text.clone(),
                    random_id,
                    reply_markup: None,
                    entities,
                    schedule_date: None,
                    schedule_repeat_period: None,
                    send_as: None,
                    quick_reply_shortcut: None,
                    effect: None,
                    allow_paid_stars: None,
                    suggested_post: None,
                })
                .await?
        } else {
            self.raw()?
                .invoke(&tl::functions::messages::SendMessage {
                    no_webpage: false,
                    silent: false,
                    background: false,
                    clear_draft: false,
                    noforwards: false,
                    update_stickersets_order: false,
                    invert_media: false,
                    allow_paid_floodskip: false,
                    peer,
                    reply_to: Self::reply_header(message.reply_to),
                    message: parsed.text.clone(),
                    random_id,
                    reply_markup: None,
                    entities,
                    schedule_date: None,
                    schedule_repeat_period: None,
                    send_as: None,
                    quick_reply_shortcut: None,
                    effect: None,
                    allow_paid_stars: None,
                    suggested_post: None,
                })
                .await?
        };

        let (tg_id, timestamp, media_id) = extract_sent(random_id, updates)
            .ok_or(BridgeError::UnexpectedResponse("no sent message in updates"))?;

        let record = MessageRecord {
            portal: message.portal.to_string(),
            tg_message_id: tg_id,
            part_id: String::new(),
            mxid: message.event_id.clone(),
            sender: self.self_ghost().to_string(),
            timestamp,
            edit_count: 0,
            content_hash: hash_hex(&content_hash(&parsed.text, media_id)),
            media_id,
            content_uri: message.media.as_ref().map(|m| m.mxc.clone()),
        };
        self.store().put_message(&record);

        Ok(SentMessage {
            id: MessageId::make(message.portal, tg_id),
            timestamp,
        })
    }

    /// Applies a Matrix edit. Media is only re-uploaded when the Matrix
    /// content URI actually changed.
    pub async fn handle_matrix_edit(&self, edit: MatrixEdit) -> Result<(), BridgeError> {
        self.wait_ready().await?;
        let peer = self.input_peer(edit.portal)?;

        let mut records = self.store().message_parts(edit.portal, edit.target.id);
        records.sort_by(|a, b| a.part_id.cmp(&b.part_id));
        let record = records
            .first()
            .cloned()
            .ok_or(BridgeError::UnknownMessage(edit.portal, edit.target.id))?;

        let parsed = self.parse_outgoing(&edit.body, edit.formatted_body.as_deref());
        let entities = self.finalize_entities(parsed.entities);

        let media = match &edit.media {
            Some(media) if record.content_uri.as_deref() != Some(media.mxc.as_str()) => {
                let data = self
                    .0
                    .media
                    .download(&media.mxc)
                    .await
                    .map_err(|e| BridgeError::Media(e.to_string()))?;
                let request = UploadRequest {
                    kind: if media.voice { PartKind::Voice } else { PartKind::File },
                    mime: media.mime.clone(),
                    filename: media.filename.clone(),
                    width: media.width,
                    height: media.height,
                    duration: media.duration,
                    waveform: media.waveform.clone(),
                };
                Some(self.prepare_upload(&request, data).await?)
            }
            _ => {
                debug!("edit media unchanged, sending text-only edit");
                None
            }
        };

        self.raw()?
            .invoke(&tl::functions::messages::EditMessage {
                no_webpage: false,
                invert_media: false,
                peer,
                id: edit.target.id,
                message: Some(parsed.text.clone()),
                media,
                reply_markup: None,
                entities,
                schedule_date: None,
                schedule_repeat_period: None,
                quick_reply_shortcut_id: None,
            })
            .await?;

        let mut updated = record;
        updated.edit_count += 1;
        updated.content_hash = hash_hex(&content_hash(&parsed.text, updated.media_id));
        if let Some(media) = &edit.media {
            updated.content_uri = Some(media.mxc.clone());
        }
        self.store().put_message(&updated);
        Ok(())
    }

    /// Deletes messages for both sides.
    pub async fn handle_matrix_delete(
        &self,
        portal: PortalKey,
        target: MessageId,
    ) -> Result<(), BridgeError> {
        self.wait_ready().await?;
        let ids = vec![target.id];
        if portal.peer_type == PeerType::Channel {
            self.raw()?
                .invoke(&tl::functions::channels::DeleteMessages {
                    channel: self.input_channel(portal)?,
                    id: ids,
                })
                .await?;
        } else {
            self.raw()?
                .invoke(&tl::functions::messages::DeleteMessages { revoke: true, id: ids })
                .await?;
        }
        for record in self.store().message_parts(portal, target.id) {
            self.store()
                .delete_message(portal, record.tg_message_id, &record.part_id);
        }
        Ok(())
    }

    /// Propagates a Matrix read receipt.
    ///
    /// Mentions, reactions and history are acknowledged concurrently in
    /// the background; failures are collected and logged, never
    /// surfaced to the reader. Broadcast channels additionally get a
    /// reaction poll, since they never push reaction updates.
    pub async fn handle_matrix_receipt(
        &self,
        portal: PortalKey,
        up_to: MessageId,
    ) -> Result<(), BridgeError> {
        self.wait_ready().await?;
        let peer = self.input_peer(portal)?;
        let client = self.raw()?;
        let max_id = up_to.id;

        let this = self.clone();
        tokio::spawn(async move {
            let read_mentions = tl::functions::messages::ReadMentions {
                peer: peer.clone(),
                top_msg_id: None,
            };
            let read_reactions = tl::functions::messages::ReadReactions {
                peer: peer.clone(),
                top_msg_id: None,
            };
            let mentions = client.invoke(&read_mentions);
            let reactions = client.invoke(&read_reactions);
            let history = async {
                if portal.peer_type == PeerType::Channel {
                    let channel = match this.input_channel(portal) {
                        Ok(channel) => channel,
                        Err(_) => return Err(grammers_client::InvocationError::Dropped),
                    };
                    client
                        .invoke(&tl::functions::channels::ReadHistory { channel, max_id })
                        .await
                        .map(|_| ())
                } else {
                    client
                        .invoke(&tl::functions::messages::ReadHistory {
                            peer: peer.clone(),
                            max_id,
                        })
                        .await
                        .map(|_| ())
                }
            };

            let (mentions, reactions, history) = tokio::join!(mentions, reactions, history);
            let failures: Vec<String> = [
                mentions.err().map(|e| format!("readMentions: {e}")),
                reactions.err().map(|e| format!("readReactions: {e}")),
                history.err().map(|e| format!("readHistory: {e}")),
            ]
            .into_iter()
            .flatten()
            .collect();
            if !failures.is_empty() {
                warn!(
                    "login {}: receipt fan-out failures: {}",
                    this.user_id(),
                    failures.join("; ")
                );
            }

            if let Err(e) = this.maybe_poll_reactions(portal).await {
                warn!("login {}: reaction poll failed: {e}", this.user_id());
            }
        });
        Ok(())
    }

    pub async fn handle_matrix_typing(
        &self,
        portal: PortalKey,
        typing: bool,
    ) -> Result<(), BridgeError> {
        self.wait_ready().await?;
        let action = if typing {
            tl::enums::SendMessageAction::SendMessageTypingAction
        } else {
            tl::enums::SendMessageAction::SendMessageCancelAction
        };
        self.raw()?
            .invoke(&tl::functions::messages::SetTyping {
                peer: self.input_peer(portal)?,
                top_msg_id: None,
                action,
            })
            .await?;
        Ok(())
    }

    /// Applies the Matrix room's mute state to the Telegram dialog.
    pub async fn handle_matrix_mute(
        &self,
        portal: PortalKey,
        muted_until: Option<i64>,
    ) -> Result<(), BridgeError> {
        self.wait_ready().await?;
        self.raw()?
            .invoke(&tl::functions::account::UpdateNotifySettings {
                peer: tl::enums::InputNotifyPeer::Peer(tl::types::InputNotifyPeer {
                    peer: self.input_peer(portal)?,
                }),
                settings: tl::types::InputPeerNotifySettings {
                    show_previews: None,
                    silent: None,
                    mute_until: Some(muted_until.unwrap_or(0) as i32),
                    sound: None,
                    stories_muted: None,
                    stories_hide_sender: None,
                    stories_sound: None,
                }
                .into(),
            })
            .await?;
        Ok(())
    }

    /// The Matrix favourite tag maps to Telegram's pinned dialogs.
    pub async fn handle_matrix_tag(
        &self,
        portal: PortalKey,
        favourite: bool,
    ) -> Result<(), BridgeError> {
        self.wait_ready().await?;
        self.raw()?
            .invoke(&tl::functions::messages::ToggleDialogPin {
                pinned: favourite,
                peer: tl::enums::InputDialogPeer::Peer(tl::types::InputDialogPeer {
                    peer: self.input_peer(portal)?,
                }),
            })
            .await?;
        Ok(())
    }
}

fn parse_geo_uri(uri: &str) -> Result<tl::enums::InputMedia, BridgeError> {
    let coords = uri
        .strip_prefix("geo:")
        .ok_or(BridgeError::UnexpectedResponse("not a geo: URI"))?;
    let coords = coords.split(';').next().unwrap_or(coords);
    let mut parts = coords.split(',');
    let lat: f64 = parts
        .next()
        .and_then(|p| p.trim().parse().ok())
        .ok_or(BridgeError::UnexpectedResponse("geo: URI without latitude"))?;
    let long: f64 = parts
        .next()
        .and_then(|p| p.trim().parse().ok())
        .ok_or(BridgeError::UnexpectedResponse("geo: URI without longitude"))?;
    Ok(tl::enums::InputMedia::GeoPoint(
        tl::types::InputMediaGeoPoint {
            geo_point: tl::enums::InputGeoPoint::Point(tl::types::InputGeoPoint {
                lat,
                long,
                accuracy_radius: None,
            }),
        },
    ))
}

/// Digs the sent message out of the response updates.
fn extract_sent(random_id: i64, updates: tl::enums::Updates) -> Option<(i32, i64, Option<i64>)> {
    match updates {
        tl::enums::Updates::UpdateShortSentMessage(short) => {
            let media_id = short.media.as_ref().and_then(media_id_of);
            Some((short.id, short.date as i64, media_id))
        }
        tl::enums::Updates::Updates(container) => {
            let mut sent_id = None;
            for update in &container.updates {
                if let tl::enums::Update::MessageId(u) = update {
                    if u.random_id == random_id {
                        sent_id = Some(u.id);
                    }
                }
            }
            let mut found = None;
            for update in container.updates {
                let message = match update {
                    tl::enums::Update::NewMessage(u) => u.message,
                    tl::enums::Update::NewChannelMessage(u) => u.message,
                    _ => continue,
                };
                if let tl::enums::Message::Message(msg) = message {
                    if sent_id.is_none() || sent_id == Some(msg.id) {
                        let media_id = msg.media.as_ref().and_then(media_id_of);
                        found = Some((msg.id, msg.date as i64, media_id));
                    }
                }
            }
            found.or(sent_id.map(|id| (id, 0, None)))
        }
        _ => None,
    }
}

fn media_id_of(media: &tl::enums::MessageMedia) -> Option<i64> {
    match media {
        tl::enums::MessageMedia::Photo(m) => match &m.photo {
            Some(tl::enums::Photo::Photo(photo)) => Some(photo.id),
            _ => None,
        },
        tl::enums::MessageMedia::Document(m) => match &m.document {
            Some(tl::enums::Document::Document(document)) => Some(document.id),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geo_uri_parsing() {
        let media = parse_geo_uri("geo:52.5,13.4;u=35").unwrap();
        match media {
            tl::enums::InputMedia::GeoPoint(point) => match point.geo_point {
                tl::enums::InputGeoPoint::Point(p) => {
                    assert_eq!(p.lat, 52.5);
                    assert_eq!(p.long, 13.4);
                }
                _ => panic!("empty geo point"),
            },
            _ => panic!("wrong media"),
        }
        assert!(parse_geo_uri("geo:nope").is_err());
        assert!(parse_geo_uri("https://x").is_err());
    }
}
