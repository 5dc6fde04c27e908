// Copyright 2024 - developers of the `matrigram` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Service-message actions.

use grammers_tl_types as tl;

use super::SessionClient;
use crate::bridge::events::{BridgeEvent, ChatInfo, ConvertedMessage, ConvertedPart, PartKind};
use crate::errors::BridgeError;
use crate::ids::{GhostId, MessageId, PortalKey};

impl SessionClient {
    pub(crate) async fn on_service_message(
        &self,
        msg: tl::types::MessageService,
    ) -> Result<(), BridgeError> {
        let portal = self.portal_for_peer(&msg.peer_id);
        let sender = if msg.out {
            self.self_ghost()
        } else {
            msg.from_id
                .as_ref()
                .map(super::ghost_for_peer)
                .unwrap_or(GhostId::User(portal.id))
        };

        use tl::enums::MessageAction as MA;
        match msg.action {
            MA::ChatEditTitle(action) => {
                self.store().update_portal_meta(portal, |meta| {
                    meta.name = Some(action.title.clone())
                });
                self.emit(BridgeEvent::ChatResync {
                    portal,
                    create: false,
                    info: Some(ChatInfo {
                        name: Some(action.title),
                        ..Default::default()
                    }),
                });
                Ok(())
            }
            MA::ChatEditPhoto(action) => {
                let avatar_id = match action.photo {
                    tl::enums::Photo::Photo(photo) => photo.id,
                    tl::enums::Photo::Empty(_) => 0,
                };
                self.emit(BridgeEvent::ChatResync {
                    portal,
                    create: false,
                    info: Some(ChatInfo {
                        avatar_id: Some(avatar_id),
                        ..Default::default()
                    }),
                });
                Ok(())
            }
            MA::ChatDeletePhoto => {
                self.emit(BridgeEvent::ChatResync {
                    portal,
                    create: false,
                    info: Some(ChatInfo {
                        avatar_id: Some(0),
                        ..Default::default()
                    }),
                });
                Ok(())
            }
            MA::ChatAddUser(action) => {
                for user in action.users {
                    self.emit(BridgeEvent::Member {
                        portal,
                        ghost: GhostId::User(user),
                        joined: true,
                    });
                }
                Ok(())
            }
            MA::ChatJoinedByLink(_) => {
                self.emit(BridgeEvent::Member {
                    portal,
                    ghost: sender,
                    joined: true,
                });
                Ok(())
            }
            MA::ChatDeleteUser(action) => {
                if action.user_id == self.user_id() {
                    // Being removed is the chat disappearing for us.
                    self.emit(BridgeEvent::ChatDelete { portal });
                } else {
                    self.emit(BridgeEvent::Member {
                        portal,
                        ghost: GhostId::User(action.user_id),
                        joined: false,
                    });
                }
                Ok(())
            }
            MA::ChatCreate(_) | MA::ChannelCreate(_) => {
                self.emit(BridgeEvent::ChatResync {
                    portal,
                    create: true,
                    info: None,
                });
                Ok(())
            }
            MA::ChatMigrateTo(action) => {
                // The group became a supergroup; the new channel portal
                // replaces this one.
                self.emit(BridgeEvent::ChatResync {
                    portal: PortalKey::channel(action.channel_id),
                    create: true,
                    info: None,
                });
                self.emit(BridgeEvent::ChatDelete { portal });
                Ok(())
            }
            MA::ChannelMigrateFrom(action) => {
                self.emit(BridgeEvent::ChatDelete {
                    portal: PortalKey::chat(action.chat_id),
                });
                Ok(())
            }
            MA::SetMessagesTtl(action) => {
                let period = (action.period > 0).then_some(action.period);
                self.store()
                    .update_portal_meta(portal, |meta| meta.messages_ttl = period);
                self.emit(BridgeEvent::ChatResync {
                    portal,
                    create: false,
                    info: Some(ChatInfo {
                        messages_ttl: period,
                        ..Default::default()
                    }),
                });
                Ok(())
            }
            MA::ScreenshotTaken => {
                self.emit_service_notice(portal, sender, msg.id, msg.date, "took a screenshot");
                Ok(())
            }
            MA::ContactSignUp => {
                self.emit_service_notice(portal, sender, msg.id, msg.date, "joined Telegram");
                Ok(())
            }
            MA::PhoneCall(action) => {
                let body = if action.video {
                    "started a video call"
                } else {
                    "started a call"
                };
                self.emit_service_notice(portal, sender, msg.id, msg.date, body);
                Ok(())
            }
            // Handled through their dedicated updates or meaningless on
            // the Matrix side.
            MA::PinMessage | MA::HistoryClear | MA::Empty => Ok(()),
            other => Err(BridgeError::UnknownServiceAction(action_name(&other))),
        }
    }

    fn emit_service_notice(
        &self,
        portal: PortalKey,
        sender: GhostId,
        msg_id: i32,
        date: i32,
        body: &str,
    ) {
        self.emit(BridgeEvent::Message(ConvertedMessage {
            portal,
            sender,
            id: MessageId::make(portal, msg_id),
            timestamp: date as i64,
            reply_to: None,
            parts: vec![ConvertedPart {
                part_id: String::new(),
                kind: PartKind::Notice,
                body: body.to_string(),
                formatted_body: None,
                media: None,
                media_id: None,
                geo_uri: None,
                link_preview: None,
                disappear: None,
                content_hash: super::message::content_hash(body, None),
            }],
            profile: None,
        }));
    }
}

fn action_name(action: &tl::enums::MessageAction) -> &'static str {
    use tl::enums::MessageAction as MA;
    match action {
        MA::GameScore(_) => "gameScore",
        MA::PaymentSent(_) => "paymentSent",
        MA::PaymentSentMe(_) => "paymentSentMe",
        MA::GroupCall(_) => "groupCall",
        MA::InviteToGroupCall(_) => "inviteToGroupCall",
        MA::GroupCallScheduled(_) => "groupCallScheduled",
        MA::SetChatTheme(_) => "setChatTheme",
        MA::ChatJoinedByRequest => "chatJoinedByRequest",
        MA::GiftPremium(_) => "giftPremium",
        MA::TopicCreate(_) => "topicCreate",
        MA::TopicEdit(_) => "topicEdit",
        MA::SuggestProfilePhoto(_) => "suggestProfilePhoto",
        MA::RequestedPeer(_) => "requestedPeer",
        MA::SetChatWallPaper(_) => "setChatWallPaper",
        MA::GiftCode(_) => "giftCode",
        MA::GiveawayLaunch(_) => "giveawayLaunch",
        MA::GiveawayResults(_) => "giveawayResults",
        MA::BoostApply(_) => "boostApply",
        _ => "unknown",
    }
}
