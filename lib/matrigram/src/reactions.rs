// Copyright 2024 - developers of the `matrigram` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Reaction state synchronisation.
//!
//! Telegram reports reactions as per-emoji counts plus an optional
//! partial per-user list. The engine always emits the *full* reaction
//! state for a message; the framework diffs it against what it already
//! bridged.

use std::time::{Duration, Instant};

use grammers_tl_types as tl;
use log::{debug, warn};

use crate::bridge::events::{BridgeEvent, RemoteReaction};
use crate::client::SessionClient;
use crate::errors::BridgeError;
use crate::ids::{EmojiId, GhostId, MessageId, PeerType, PortalKey};

/// How often one broadcast-channel portal may be polled.
const POLL_INTERVAL: Duration = Duration::from_secs(20);
/// How many recent messages a poll covers.
const POLL_MESSAGE_COUNT: i32 = 20;

/// Free custom-emoji documents that are just Unicode emojis in disguise.
/// Reactions using them are bridged as the plain glyph.
const UNICODEMOJI_PACK: &[(i64, &str)] = &[
    (5368324170671202286, "\u{1F44D}"),
    (5368509153802498560, "\u{1F44E}"),
    (5370870893004203704, "\u{2764}\u{FE0F}"),
    (5372981976804366741, "\u{1F525}"),
    (5370900684540332325, "\u{1F973}"),
    (5368741306884979325, "\u{1F44F}"),
    (5370854690746184725, "\u{1F602}"),
    (5370954756721176160, "\u{1F914}"),
];

pub(crate) fn pack_glyph(document_id: i64) -> Option<&'static str> {
    UNICODEMOJI_PACK
        .iter()
        .find(|(id, _)| *id == document_id)
        .map(|(_, glyph)| *glyph)
}

pub(crate) fn pack_document(glyph: &str) -> Option<i64> {
    UNICODEMOJI_PACK
        .iter()
        .find(|(_, g)| *g == glyph)
        .map(|(id, _)| *id)
}

struct RawReaction {
    sender: GhostId,
    emoji: EmojiId,
}

impl SessionClient {
    /// Computes and emits the reaction state of one message.
    ///
    /// Invoked for every converted message, even when `reactions` is
    /// absent, so that cleared reactions on old messages propagate.
    pub(crate) async fn sync_reactions(
        &self,
        portal: PortalKey,
        msg_id: i32,
        reactions: Option<&tl::types::MessageReactions>,
    ) -> Result<(), BridgeError> {
        let raw = match reactions {
            Some(reactions) => match self.expand_reactions(portal, msg_id, reactions).await? {
                Some(raw) => raw,
                // Present but invisible; emitting would wrongly clear.
                None => return Ok(()),
            },
            None => Vec::new(),
        };

        let resolved = self.resolve_custom_emojis(raw).await;
        self.emit(BridgeEvent::ReactionSync {
            portal,
            message: MessageId::make(portal, msg_id),
            reactions: resolved,
        });
        Ok(())
    }

    /// Produces the per-user reaction list, or `None` when the server
    /// hides it.
    async fn expand_reactions(
        &self,
        portal: PortalKey,
        msg_id: i32,
        reactions: &tl::types::MessageReactions,
    ) -> Result<Option<Vec<RawReaction>>, BridgeError> {
        let counts: Vec<tl::types::ReactionCount> = reactions
            .results
            .iter()
            .cloned()
            .map(tl::types::ReactionCount::from)
            .collect();
        let total: i32 = counts.iter().map(|c| c.count).sum();

        if portal.peer_type == PeerType::User {
            return Ok(Some(self.split_dm_reaction_counts(portal, &counts)));
        }

        if !reactions.can_see_list && total > 0 {
            // Counts without a visible list cannot be attributed.
            return Ok(None);
        }

        let mut observed: Vec<RawReaction> = reactions
            .recent_reactions
            .iter()
            .flatten()
            .cloned()
            .map(tl::types::MessagePeerReaction::from)
            .filter_map(|r| {
                Some(RawReaction {
                    sender: crate::incoming::ghost_for_peer(&r.peer_id),
                    emoji: EmojiId::from_reaction(&r.reaction)?,
                })
            })
            .collect();

        // The inline list is capped; fetch the full one when counts say
        // there is more.
        if total > observed.len() as i32 {
            observed = self.fetch_reaction_list(portal, msg_id).await?;
        }
        Ok(Some(observed))
    }

    /// Direct chats only report counts. Each unit of count is pinned on
    /// one of the two participants, with `chosen_order` marking our own
    /// reaction.
    fn split_dm_reaction_counts(
        &self,
        portal: PortalKey,
        counts: &[tl::types::ReactionCount],
    ) -> Vec<RawReaction> {
        let mut out = Vec::new();
        for count in counts {
            let emoji = match EmojiId::from_reaction(&count.reaction) {
                Some(emoji) => emoji,
                None => continue,
            };
            let mine = count.chosen_order.map_or(false, |order| order > 0);
            if count.count >= 2 {
                out.push(RawReaction {
                    sender: self.self_ghost(),
                    emoji: emoji.clone(),
                });
                out.push(RawReaction {
                    sender: GhostId::User(portal.id),
                    emoji,
                });
            } else if mine {
                out.push(RawReaction {
                    sender: self.self_ghost(),
                    emoji,
                });
            } else {
                out.push(RawReaction {
                    sender: GhostId::User(portal.id),
                    emoji,
                });
            }
        }
        out
    }

    async fn fetch_reaction_list(
        &self,
        portal: PortalKey,
        msg_id: i32,
    ) -> Result<Vec<RawReaction>, BridgeError> {
        let response = self
            .raw()?
            .invoke(&tl::functions::messages::GetMessageReactionsList {
                peer: self.input_peer(portal)?,
                id: msg_id,
                reaction: None,
                offset: None,
                limit: 100,
            })
            .await?;
        let tl::enums::messages::MessageReactionsList::List(list) = response;
        self.absorb_entities(&list.users, &list.chats);
        Ok(list
            .reactions
            .into_iter()
            .map(tl::types::MessagePeerReaction::from)
            .filter_map(|r| {
                Some(RawReaction {
                    sender: crate::incoming::ghost_for_peer(&r.peer_id),
                    emoji: EmojiId::from_reaction(&r.reaction)?,
                })
            })
            .collect())
    }

    /// Rehydrates custom-emoji reactions: pack emojis become their
    /// Unicode glyph, the rest get a bridged image.
    async fn resolve_custom_emojis(&self, raw: Vec<RawReaction>) -> Vec<RemoteReaction> {
        let mut missing: Vec<i64> = raw
            .iter()
            .filter_map(|r| match r.emoji {
                EmojiId::CustomDocument(id) => {
                    (pack_glyph(id).is_none() && self.store().emoji_mxc_by_document(id).is_none())
                        .then_some(id)
                }
                _ => None,
            })
            .collect();
        missing.sort_unstable();
        missing.dedup();
        if !missing.is_empty() {
            if let Err(e) = self.bridge_custom_emojis(&missing).await {
                warn!("failed to bridge custom emoji documents: {e}");
            }
        }

        raw.into_iter()
            .map(|r| match r.emoji {
                EmojiId::CustomDocument(id) => match pack_glyph(id) {
                    Some(glyph) => RemoteReaction {
                        sender: r.sender,
                        emoji: EmojiId::unicode(glyph),
                        mxc: None,
                    },
                    None => RemoteReaction {
                        sender: r.sender,
                        emoji: EmojiId::CustomDocument(id),
                        mxc: self.store().emoji_mxc_by_document(id),
                    },
                },
                emoji => RemoteReaction {
                    sender: r.sender,
                    emoji,
                    mxc: None,
                },
            })
            .collect()
    }

    async fn bridge_custom_emojis(&self, document_ids: &[i64]) -> Result<(), BridgeError> {
        let documents = self
            .raw()?
            .invoke(&tl::functions::messages::GetCustomEmojiDocuments {
                document_id: document_ids.to_vec(),
            })
            .await?;
        for document in documents {
            let document = match document {
                tl::enums::Document::Document(document) => document,
                tl::enums::Document::Empty(_) => continue,
            };
            let location = tl::enums::InputFileLocation::InputDocumentFileLocation(
                tl::types::InputDocumentFileLocation {
                    id: document.id,
                    access_hash: document.access_hash,
                    file_reference: document.file_reference.clone(),
                    thumb_size: String::new(),
                },
            );
            let bytes = self.download_file(location).await?;
            let mxc = self
                .0
                .media
                .upload(bytes, &document.mime_type, None)
                .await
                .map_err(|e| BridgeError::Media(e.to_string()))?;
            self.store().set_emoji_file(document.id, &mxc);
        }
        Ok(())
    }

    /// Broadcast channels do not push reaction updates; a Matrix read
    /// receipt in such a portal triggers a bounded poll instead.
    pub(crate) async fn maybe_poll_reactions(
        &self,
        portal: PortalKey,
    ) -> Result<(), BridgeError> {
        let meta = self.store().portal_meta(portal).unwrap_or_default();
        if portal.peer_type != PeerType::Channel || meta.is_supergroup {
            return Ok(());
        }
        {
            let mut polls = self.0.reaction_polls.lock().unwrap();
            let now = Instant::now();
            if let Some(last) = polls.get(&portal) {
                if now.duration_since(*last) < POLL_INTERVAL {
                    return Ok(());
                }
            }
            polls.insert(portal, now);
        }

        let peer = self.input_peer(portal)?;
        let history = self
            .raw()?
            .invoke(&tl::functions::messages::GetHistory {
                peer: peer.clone(),
                offset_id: 0,
                offset_date: 0,
                add_offset: 0,
                limit: POLL_MESSAGE_COUNT,
                max_id: 0,
                min_id: 0,
                hash: 0,
            })
            .await?;

        use tl::enums::messages::Messages;
        let messages = match history {
            Messages::Messages(m) => m.messages,
            Messages::Slice(m) => m.messages,
            Messages::ChannelMessages(m) => m.messages,
            Messages::NotModified(_) => return Ok(()),
        };
        let ids: Vec<i32> = messages
            .iter()
            .filter_map(|m| match m {
                tl::enums::Message::Message(m) => Some(m.id),
                _ => None,
            })
            .collect();
        if ids.is_empty() {
            return Ok(());
        }

        debug!("polling reactions for {} messages in {portal}", ids.len());
        let updates = self
            .raw()?
            .invoke(&tl::functions::messages::GetMessagesReactions { peer, id: ids })
            .await?;
        if let tl::enums::Updates::Updates(updates) = updates {
            self.absorb_entities(&updates.users, &updates.chats);
            for update in updates.updates {
                if let tl::enums::Update::MessageReactions(u) = update {
                    let reactions: tl::types::MessageReactions = u.reactions.into();
                    self.sync_reactions(portal, u.msg_id, Some(&reactions)).await?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::make_client;

    #[test]
    fn pack_lookup_is_bidirectional() {
        for (id, glyph) in UNICODEMOJI_PACK {
            assert_eq!(pack_glyph(*id), Some(*glyph));
            assert_eq!(pack_document(glyph), Some(*id));
        }
        assert_eq!(pack_glyph(1), None);
    }

    fn count(emoticon: &str, count: i32, chosen_order: Option<i32>) -> tl::types::ReactionCount {
        tl::types::ReactionCount {
            chosen_order,
            reaction: tl::enums::Reaction::Emoji(tl::types::ReactionEmoji {
                emoticon: emoticon.to_string(),
            }),
            count,
        }
    }

    #[test]
    fn dm_expansion_attributes_both_participants() {
        let (client, _rx) = make_client(100);
        let portal = PortalKey::user(200);

        // Two units, no per-user list: one per participant.
        let out = client.split_dm_reaction_counts(portal, &[count("👍", 2, None)]);
        assert_eq!(out.len(), 2);
        let senders: Vec<GhostId> = out.iter().map(|r| r.sender).collect();
        assert!(senders.contains(&GhostId::User(100)));
        assert!(senders.contains(&GhostId::User(200)));
    }

    #[test]
    fn dm_expansion_uses_chosen_order() {
        let (client, _rx) = make_client(100);
        let portal = PortalKey::user(200);

        let mine = client.split_dm_reaction_counts(portal, &[count("🔥", 1, Some(1))]);
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].sender, GhostId::User(100));

        let theirs = client.split_dm_reaction_counts(portal, &[count("🔥", 1, None)]);
        assert_eq!(theirs.len(), 1);
        assert_eq!(theirs[0].sender, GhostId::User(200));
    }
}
