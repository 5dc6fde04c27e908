// Copyright 2024 - developers of the `matrigram` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The Telegram to Matrix event pipeline.
//!
//! Raw updates from the dispatcher land here, one at a time and in
//! order. Handlers convert them into neutral bridge events; a failure
//! converts exactly one update into a log line, never into a stalled
//! stream.

pub(crate) mod message;
mod service;
mod status;

use grammers_tl_types as tl;
use log::trace;

use crate::client::SessionClient;
use crate::errors::BridgeError;
use crate::ids::{GhostId, PortalKey};

impl SessionClient {
    /// The portal a Telegram peer maps to for this login.
    pub(crate) fn portal_for_peer(&self, peer: &tl::enums::Peer) -> PortalKey {
        let receiver = if self.config().split_portals {
            Some(self.user_id())
        } else {
            None
        };
        PortalKey::from_peer(peer, receiver)
    }

    pub(crate) async fn handle_update(
        &self,
        update: tl::enums::Update,
    ) -> Result<(), BridgeError> {
        use tl::enums::Update as U;
        match update {
            U::NewMessage(u) => self.on_new_message(u.message).await,
            U::NewChannelMessage(u) => self.on_new_message(u.message).await,
            U::EditMessage(u) => self.on_edit_message(u.message).await,
            U::EditChannelMessage(u) => self.on_edit_message(u.message).await,
            U::DeleteMessages(u) => self.on_delete_messages(&u.messages),
            U::DeleteChannelMessages(u) => {
                self.on_delete_channel_messages(u.channel_id, &u.messages)
            }
            U::UserTyping(u) => self.on_typing(
                self.portal_for_peer(&tl::types::PeerUser { user_id: u.user_id }.into()),
                GhostId::User(u.user_id),
                &u.action,
            ),
            U::ChatUserTyping(u) => self.on_typing(
                PortalKey::chat(u.chat_id),
                ghost_for_peer(&u.from_id),
                &u.action,
            ),
            U::ChannelUserTyping(u) => self.on_typing(
                PortalKey::channel(u.channel_id),
                ghost_for_peer(&u.from_id),
                &u.action,
            ),
            U::ReadHistoryInbox(u) => self.on_read(
                self.portal_for_peer(&u.peer),
                self.self_ghost(),
                u.max_id,
                false,
            ),
            U::ReadHistoryOutbox(u) => self.on_read_outbox(
                self.portal_for_peer(&u.peer),
                u.max_id,
            ),
            U::ReadChannelInbox(u) => self.on_read(
                PortalKey::channel(u.channel_id),
                self.self_ghost(),
                u.max_id,
                false,
            ),
            U::ReadChannelOutbox(u) => {
                // Group and channel outbox receipts are anonymous and
                // cannot be attributed to a sender.
                trace!("ignoring unattributable channel outbox receipt for {}", u.channel_id);
                Ok(())
            }
            U::UserName(u) => self.on_user_name(u),
            U::NotifySettings(u) => self.on_notify_settings(u),
            U::PinnedDialogs(u) => self.on_pinned_dialogs(u),
            U::ChatDefaultBannedRights(u) => self.on_default_banned_rights(u),
            U::PeerBlocked(u) => self.on_peer_blocked(u),
            U::Chat(u) => {
                self.emit(crate::bridge::events::BridgeEvent::ChatResync {
                    portal: PortalKey::chat(u.chat_id),
                    create: false,
                    info: None,
                });
                Ok(())
            }
            U::Channel(u) => {
                self.emit(crate::bridge::events::BridgeEvent::ChatResync {
                    portal: PortalKey::channel(u.channel_id),
                    create: false,
                    info: None,
                });
                Ok(())
            }
            U::MessageReactions(u) => {
                let portal = self.portal_for_peer(&u.peer);
                let reactions: tl::types::MessageReactions = u.reactions.into();
                self.sync_reactions(portal, u.msg_id, Some(&reactions)).await
            }
            _ => {
                trace!("ignoring unhandled update kind");
                Ok(())
            }
        }
    }
}

pub(crate) fn ghost_for_peer(peer: &tl::enums::Peer) -> GhostId {
    match peer {
        tl::enums::Peer::User(u) => GhostId::User(u.user_id),
        tl::enums::Peer::Chat(c) => GhostId::Channel(c.chat_id),
        tl::enums::Peer::Channel(c) => GhostId::Channel(c.channel_id),
    }
}
