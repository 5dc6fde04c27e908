// Copyright 2024 - developers of the `matrigram` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Presence-ish updates: typing, receipts, names, mutes, pins, blocks.

use std::collections::BTreeSet;
use std::time::Duration;

use grammers_tl_types as tl;
use log::trace;

use super::SessionClient;
use crate::bridge::events::{BridgeEvent, GhostInfo};
use crate::errors::BridgeError;
use crate::ids::{GhostId, PeerType, PortalKey};

const TYPING_TIMEOUT: Duration = Duration::from_secs(6);

impl SessionClient {
    pub(crate) fn on_typing(
        &self,
        portal: PortalKey,
        sender: GhostId,
        action: &tl::enums::SendMessageAction,
    ) -> Result<(), BridgeError> {
        use tl::enums::SendMessageAction as SMA;
        let timeout = match action {
            SMA::SendMessageCancelAction => Duration::ZERO,
            SMA::SendMessageTypingAction
            | SMA::SendMessageRecordVideoAction
            | SMA::SendMessageUploadVideoAction(_)
            | SMA::SendMessageRecordAudioAction
            | SMA::SendMessageUploadAudioAction(_)
            | SMA::SendMessageUploadPhotoAction(_)
            | SMA::SendMessageUploadDocumentAction(_)
            | SMA::SendMessageRecordRoundAction
            | SMA::SendMessageUploadRoundAction(_)
            | SMA::SendMessageGamePlayAction
            | SMA::SendMessageGeoLocationAction
            | SMA::SendMessageChooseContactAction => TYPING_TIMEOUT,
            _ => {
                trace!("ignoring unmapped typing action");
                return Ok(());
            }
        };
        self.emit(BridgeEvent::Typing {
            portal,
            sender,
            timeout,
        });
        Ok(())
    }

    pub(crate) fn on_read(
        &self,
        portal: PortalKey,
        sender: GhostId,
        max_id: i32,
        outbox: bool,
    ) -> Result<(), BridgeError> {
        self.store().update_portal_meta(portal, |meta| {
            if max_id > meta.read_upto {
                meta.read_upto = max_id;
            }
        });
        self.emit(BridgeEvent::Receipt {
            portal,
            sender,
            up_to_message: max_id,
            outbox,
        });
        Ok(())
    }

    /// Outbox receipts are only attributable in direct chats, where the
    /// reader must be the remote user.
    pub(crate) fn on_read_outbox(
        &self,
        portal: PortalKey,
        max_id: i32,
    ) -> Result<(), BridgeError> {
        if portal.peer_type != PeerType::User {
            trace!("ignoring unattributable outbox receipt for {portal}");
            return Ok(());
        }
        self.emit(BridgeEvent::Receipt {
            portal,
            sender: GhostId::User(portal.id),
            up_to_message: max_id,
            outbox: true,
        });
        Ok(())
    }

    pub(crate) fn on_user_name(
        &self,
        update: tl::types::UpdateUserName,
    ) -> Result<(), BridgeError> {
        let username = update.usernames.iter().find_map(|u| {
            let tl::enums::Username::Username(u) = u;
            u.active.then(|| u.username.clone())
        });
        if let Some(username) = &username {
            self.store()
                .set_username(PeerType::User, update.user_id, username);
        }

        let name = match (update.first_name.is_empty(), update.last_name.is_empty()) {
            (false, false) => Some(format!("{} {}", update.first_name, update.last_name)),
            (false, true) => Some(update.first_name.clone()),
            (true, false) => Some(update.last_name.clone()),
            (true, true) => None,
        };
        self.emit(BridgeEvent::GhostUpdate(GhostInfo {
            id: Some(GhostId::User(update.user_id)),
            name,
            username,
            ..Default::default()
        }));
        Ok(())
    }

    pub(crate) fn on_notify_settings(
        &self,
        update: tl::types::UpdateNotifySettings,
    ) -> Result<(), BridgeError> {
        let peer = match update.peer {
            tl::enums::NotifyPeer::Peer(peer) => peer.peer,
            // Per-class defaults have no portal to map onto.
            _ => return Ok(()),
        };
        let settings: tl::types::PeerNotifySettings = update.notify_settings.into();
        self.emit(BridgeEvent::Mute {
            portal: self.portal_for_peer(&peer),
            muted_until: settings.mute_until.filter(|&ts| ts > 0).map(|ts| ts as i64),
        });
        Ok(())
    }

    /// Applies a new pinned-dialog set: diffs against the persisted
    /// one, persists the new set, then emits tag events.
    ///
    /// Persisting before emitting means a crash in between re-emits
    /// nothing on restart; the framework treats tag events as
    /// idempotent, while a double emission after replay would not be.
    pub(crate) fn apply_pinned_dialogs(&self, pinned: Vec<PortalKey>) {
        let new: BTreeSet<String> = pinned.iter().map(|p| p.to_string()).collect();
        let old: BTreeSet<String> = self
            .store()
            .login_metadata()
            .map(|m| m.pinned.into_iter().collect())
            .unwrap_or_default();

        if new == old {
            return;
        }
        self.store()
            .update_login_metadata(|m| m.pinned = new.iter().cloned().collect());

        for added in new.difference(&old) {
            if let Ok(portal) = added.parse() {
                self.emit(BridgeEvent::Tag {
                    portal,
                    favourite: true,
                });
            }
        }
        for removed in old.difference(&new) {
            if let Ok(portal) = removed.parse() {
                self.emit(BridgeEvent::Tag {
                    portal,
                    favourite: false,
                });
            }
        }
    }

    pub(crate) fn on_pinned_dialogs(
        &self,
        update: tl::types::UpdatePinnedDialogs,
    ) -> Result<(), BridgeError> {
        let order = match update.order {
            Some(order) => order,
            // Without an order the server expects us to refetch; the
            // dialog crawl will reconcile eventually.
            None => return Ok(()),
        };
        let pinned = order
            .into_iter()
            .filter_map(|peer| match peer {
                tl::enums::DialogPeer::Peer(peer) => {
                    Some(PortalKey::from_peer(&peer.peer, None))
                }
                tl::enums::DialogPeer::Folder(_) => None,
            })
            .collect();
        self.apply_pinned_dialogs(pinned);
        Ok(())
    }

    pub(crate) fn on_default_banned_rights(
        &self,
        update: tl::types::UpdateChatDefaultBannedRights,
    ) -> Result<(), BridgeError> {
        // Power levels are derived from the full chat info; a resync
        // picks the new rights up.
        self.emit(BridgeEvent::ChatResync {
            portal: self.portal_for_peer(&update.peer),
            create: false,
            info: None,
        });
        Ok(())
    }

    pub(crate) fn on_peer_blocked(
        &self,
        update: tl::types::UpdatePeerBlocked,
    ) -> Result<(), BridgeError> {
        let user_id = match update.peer_id {
            tl::enums::Peer::User(user) => user.user_id,
            _ => return Ok(()),
        };
        self.emit(BridgeEvent::GhostUpdate(GhostInfo {
            id: Some(GhostId::User(user_id)),
            blocked: Some(update.blocked),
            ..Default::default()
        }));
        // The DM portal's events-default power level follows the block
        // state: blocked peers cannot deliver new messages.
        self.emit(BridgeEvent::Blocked {
            user_id,
            blocked: update.blocked,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{drain, make_client};

    #[test]
    fn pinned_dialog_diff() {
        let (client, mut rx) = make_client(100);
        client
            .store()
            .set_login_metadata(&crate::store::LoginMetadata::new(100, String::new()));

        let a = PortalKey::user(1);
        let b = PortalKey::user(2);
        let c = PortalKey::chat(3);
        let d = PortalKey::channel(4);

        client.apply_pinned_dialogs(vec![a, b, c]);
        drain(&mut rx);

        client.apply_pinned_dialogs(vec![b, c, d]);
        let events = drain(&mut rx);
        let mut added = Vec::new();
        let mut cleared = Vec::new();
        for event in events {
            match event {
                BridgeEvent::Tag { portal, favourite: true } => added.push(portal),
                BridgeEvent::Tag { portal, favourite: false } => cleared.push(portal),
                _ => {}
            }
        }
        assert_eq!(added, vec![d]);
        assert_eq!(cleared, vec![a]);

        // The persisted set matches the emission.
        let mut stored = client.store().login_metadata().unwrap().pinned;
        stored.sort();
        let mut expected: Vec<String> =
            [b, c, d].iter().map(|p| p.to_string()).collect();
        expected.sort();
        assert_eq!(stored, expected);

        // Re-applying the same set emits nothing.
        client.apply_pinned_dialogs(vec![b, c, d]);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn outbox_receipts_only_for_dms() {
        let (client, mut rx) = make_client(100);
        client.on_read_outbox(PortalKey::chat(5), 10).unwrap();
        assert!(drain(&mut rx).is_empty());

        client.on_read_outbox(PortalKey::user(7), 10).unwrap();
        let events = drain(&mut rx);
        assert!(matches!(
            events.as_slice(),
            [BridgeEvent::Receipt {
                sender: GhostId::User(7),
                outbox: true,
                ..
            }]
        ));
    }
}
