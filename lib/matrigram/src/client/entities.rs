// Copyright 2024 - developers of the `matrigram` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Implicit entity learning.
//!
//! Almost every Telegram response carries `users` and `chats` lists.
//! Everything that invokes such a call funnels the lists through here,
//! which (a) learns and persists access hashes, (b) refreshes ghost
//! profiles, and (c) notifies the bridge when a channel's left/banned
//! state flips. Min entities never overwrite a full hash.

use std::sync::atomic::Ordering;

use grammers_tl_types as tl;
use log::debug;

use super::SessionClient;
use crate::bridge::events::{BridgeEvent, GhostInfo};
use crate::ids::{GhostId, PeerType, PortalKey};
use crate::util::normalize_phone;

fn compose_name(first: Option<&str>, last: Option<&str>) -> Option<String> {
    match (first, last) {
        (Some(first), Some(last)) => Some(format!("{first} {last}")),
        (Some(first), None) => Some(first.to_string()),
        (None, Some(last)) => Some(last.to_string()),
        (None, None) => None,
    }
}

fn active_username(
    username: Option<&String>,
    usernames: Option<&Vec<tl::enums::Username>>,
) -> Option<String> {
    if let Some(username) = username {
        return Some(username.clone());
    }
    usernames?.iter().find_map(|u| {
        let tl::enums::Username::Username(u) = u;
        u.active.then(|| u.username.clone())
    })
}

impl SessionClient {
    pub(crate) fn absorb_entities(
        &self,
        users: &[tl::enums::User],
        chats: &[tl::enums::Chat],
    ) {
        self.absorb_users(users);
        self.absorb_chats(chats);
    }

    pub(crate) fn absorb_users(&self, users: &[tl::enums::User]) {
        let store = &self.0.store;
        for user in users {
            let user = match user {
                tl::enums::User::User(user) => user,
                tl::enums::User::Empty(_) => continue,
            };

            if !user.min {
                if let Some(hash) = user.access_hash {
                    store.set_access_hash(PeerType::User, user.id, hash);
                }
            }
            let username = active_username(user.username.as_ref(), user.usernames.as_ref());
            if let Some(username) = &username {
                store.set_username(PeerType::User, user.id, username);
            }
            if let Some(phone) = &user.phone {
                store.set_phone(&normalize_phone(phone), user.id);
            }
            if user.is_self {
                self.0.premium.store(user.premium, Ordering::Relaxed);
            }

            self.emit(BridgeEvent::GhostUpdate(GhostInfo {
                id: Some(GhostId::User(user.id)),
                name: compose_name(user.first_name.as_deref(), user.last_name.as_deref()),
                username,
                phone: user.phone.clone(),
                avatar_id: Some(match &user.photo {
                    Some(tl::enums::UserProfilePhoto::Photo(photo)) => photo.photo_id,
                    _ => 0,
                }),
                is_bot: Some(user.bot),
                is_premium: Some(user.premium),
                is_channel: false,
                blocked: None,
            }));
        }
    }

    pub(crate) fn absorb_chats(&self, chats: &[tl::enums::Chat]) {
        let store = &self.0.store;
        for chat in chats {
            match chat {
                tl::enums::Chat::Empty(_) | tl::enums::Chat::Chat(_) => {}
                tl::enums::Chat::Forbidden(chat) => {
                    self.emit(BridgeEvent::ChatDelete {
                        portal: PortalKey::chat(chat.id),
                    });
                }
                tl::enums::Chat::Channel(channel) => {
                    if !channel.min {
                        if let Some(hash) = channel.access_hash {
                            store.set_access_hash(PeerType::Channel, channel.id, hash);
                        }
                    }
                    let username =
                        active_username(channel.username.as_ref(), channel.usernames.as_ref());
                    if let Some(username) = &username {
                        store.set_username(PeerType::Channel, channel.id, username);
                    }
                    store.update_portal_meta(PortalKey::channel(channel.id), |meta| {
                        meta.is_supergroup = channel.megagroup;
                        meta.name = Some(channel.title.clone());
                    });

                    // Broadcast channels double as a sender identity.
                    if channel.broadcast {
                        self.emit(BridgeEvent::GhostUpdate(GhostInfo {
                            id: Some(GhostId::Channel(channel.id)),
                            name: Some(channel.title.clone()),
                            username,
                            phone: None,
                            avatar_id: Some(match &channel.photo {
                                tl::enums::ChatPhoto::Photo(photo) => photo.photo_id,
                                _ => 0,
                            }),
                            is_bot: Some(false),
                            is_premium: None,
                            is_channel: true,
                            blocked: None,
                        }));
                    }

                    self.set_left_channel_state(PortalKey::channel(channel.id), channel.left);
                }
                tl::enums::Chat::ChannelForbidden(channel) => {
                    store.set_access_hash(PeerType::Channel, channel.id, channel.access_hash);
                    self.set_left_channel_state(PortalKey::channel(channel.id), true);
                }
            }
        }
    }

    /// Tracks the left/banned flag of a channel and tells the framework
    /// when it flips.
    fn set_left_channel_state(&self, portal: PortalKey, left: bool) {
        let changed = {
            let mut set = self.0.left_channels.lock().unwrap();
            if left {
                set.insert(portal.id)
            } else {
                set.remove(&portal.id)
            }
        };
        if changed {
            debug!(
                "login {}: {portal} is now {}",
                self.0.user_id,
                if left { "left" } else { "joined" }
            );
            if left {
                self.emit(BridgeEvent::ChatDelete { portal });
            } else {
                self.emit(BridgeEvent::ChatResync {
                    portal,
                    create: false,
                    info: None,
                });
            }
        }
    }
}
