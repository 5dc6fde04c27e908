// Copyright 2024 - developers of the `matrigram` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Matrix reactions going to Telegram.

use grammers_tl_types as tl;

use crate::client::SessionClient;
use crate::errors::BridgeError;
use crate::ids::{EmojiId, MessageId, PortalKey};
use crate::reactions::pack_document;
use crate::store::ReactionRecord;

impl SessionClient {
    /// Resolves what a Matrix reaction key actually sends.
    ///
    /// The probe order is: a known bridged custom-emoji file, the
    /// always-custom override, then the peer's server-side availability,
    /// substituting a pack document only when the plain emoticon would
    /// be rejected.
    pub async fn pre_handle_reaction(
        &self,
        portal: PortalKey,
        key: &str,
    ) -> Result<EmojiId, BridgeError> {
        if key.starts_with("mxc://") {
            if let Some(document_id) = self.store().emoji_file_by_mxc(key) {
                return Ok(EmojiId::custom(document_id));
            }
            return Err(BridgeError::UnexpectedResponse(
                "reaction image has no known Telegram document",
            ));
        }

        if self.config().always_custom_emoji {
            if let Some(document_id) = pack_document(key) {
                return Ok(EmojiId::custom(document_id));
            }
        }

        let allowed = self
            .store()
            .portal_meta(portal)
            .and_then(|meta| meta.allowed_reactions);
        let available = match &allowed {
            // An explicit portal whitelist overrides the global set.
            Some(list) => list.contains(&key.to_string()),
            None => self
                .available_reactions()
                .await
                .map(|reactions| reactions.iter().any(|r| r == key))
                .unwrap_or(true),
        };
        if available {
            Ok(EmojiId::unicode(key))
        } else if let Some(document_id) = pack_document(key) {
            Ok(EmojiId::custom(document_id))
        } else {
            Ok(EmojiId::unicode(key))
        }
    }

    /// Sends the login's full reaction set for a message, which is how
    /// Telegram models adding one reaction.
    pub async fn handle_matrix_reaction(
        &self,
        portal: PortalKey,
        target: MessageId,
        emoji: EmojiId,
        event_id: &str,
    ) -> Result<(), BridgeError> {
        self.wait_ready().await?;

        let me = self.self_ghost().to_string();
        let mut kept: Vec<EmojiId> = self
            .store()
            .reactions_for_message(portal, target.id)
            .into_iter()
            .filter(|record| record.sender == me)
            .filter_map(|record| EmojiId::parse(&record.emoji_id).ok())
            .collect();
        if !kept.contains(&emoji) {
            kept.push(emoji.clone());
        }

        self.send_reaction_set(portal, target.id, &kept).await?;

        self.store().put_reaction(&ReactionRecord {
            portal: portal.to_string(),
            tg_message_id: target.id,
            sender: me,
            emoji_id: emoji.to_string(),
            mxid: event_id.to_string(),
        });
        Ok(())
    }

    /// Removes one of the login's reactions by resending the remainder.
    pub async fn handle_matrix_unreaction(
        &self,
        portal: PortalKey,
        target: MessageId,
        emoji: EmojiId,
    ) -> Result<(), BridgeError> {
        self.wait_ready().await?;

        let me = self.self_ghost().to_string();
        let kept: Vec<EmojiId> = self
            .store()
            .reactions_for_message(portal, target.id)
            .into_iter()
            .filter(|record| record.sender == me)
            .filter_map(|record| EmojiId::parse(&record.emoji_id).ok())
            .filter(|existing| *existing != emoji)
            .collect();

        self.send_reaction_set(portal, target.id, &kept).await?;
        self.store()
            .delete_reaction(portal, target.id, &me, &emoji.to_string());
        Ok(())
    }

    async fn send_reaction_set(
        &self,
        portal: PortalKey,
        msg_id: i32,
        emojis: &[EmojiId],
    ) -> Result<(), BridgeError> {
        let reaction: Vec<tl::enums::Reaction> =
            emojis.iter().map(|emoji| emoji.to_reaction()).collect();
        self.raw()?
            .invoke(&tl::functions::messages::SendReaction {
                big: false,
                add_to_recent: true,
                peer: self.input_peer(portal)?,
                msg_id,
                reaction: Some(reaction),
            })
            .await?;
        Ok(())
    }
}
