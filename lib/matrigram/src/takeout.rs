// Copyright 2024 - developers of the `matrigram` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Takeout sessions and historical backfill.
//!
//! Telegram gates reading old history behind a "takeout" session. The
//! engine keeps at most one takeout handle per login, persists it, and
//! releases it after an idle hour. Recent history (forward fills) does
//! not need the handle; only backward fills are wrapped in
//! `invokeWithTakeout`, serialised on the takeout lock.

use std::time::{Duration, Instant};

use grammers_tl_types as tl;
use log::{debug, info, warn};
use tokio::sync::watch;

use crate::bridge::events::{BackfillBatch, BridgeEvent};
use crate::client::SessionClient;
use crate::errors::BridgeError;
use crate::ids::PortalKey;

/// Upper bound for files included in takeout responses.
const TAKEOUT_FILE_MAX_SIZE: i64 = 2_147_483_647;

const DIALOG_PAGE_SIZE: i32 = 100;

impl SessionClient {
    fn takeout_idle_timeout(&self) -> Duration {
        Duration::from_secs((2 * self.config().backfill.batch_delay).max(60 * 60))
    }

    /// Invokes a request inside the login's takeout session.
    pub(crate) async fn invoke_takeout<R: tl::RemoteCall>(
        &self,
        takeout_id: i64,
        query: R,
    ) -> Result<R::Return, BridgeError> {
        let result = self
            .raw()?
            .invoke(&tl::functions::InvokeWithTakeout { takeout_id, query })
            .await;
        match result {
            Ok(value) => Ok(value),
            Err(e) if e.is("TAKEOUT_INVALID") || e.is("TAKEOUT_REQUIRED") => {
                // The server forgot the handle; drop ours so the next
                // backfill re-initialises.
                warn!("login {}: takeout {takeout_id} expired", self.user_id());
                self.store().update_login_metadata(|m| m.takeout_id = None);
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Obtains the takeout id, initialising a session if needed.
    ///
    /// Must be called with the takeout lock held; the lock is what makes
    /// concurrent callers share a single `initTakeoutSession` round trip.
    async fn acquire_takeout(&self) -> Result<i64, BridgeError> {
        if let Some(id) = self.store().login_metadata().and_then(|m| m.takeout_id) {
            self.bump_takeout_idle();
            self.spawn_dialog_crawl(id);
            return Ok(id);
        }

        let client = self.raw()?;
        let request = tl::functions::account::InitTakeoutSession {
            contacts: false,
            message_users: true,
            message_chats: true,
            message_megagroups: true,
            message_channels: true,
            files: true,
            file_max_size: Some(TAKEOUT_FILE_MAX_SIZE),
        };

        loop {
            match client.invoke(&request).await {
                Ok(takeout) => {
                    let takeout: tl::types::account::Takeout = takeout.into();
                    info!("login {}: takeout session {}", self.user_id(), takeout.id);
                    self.store()
                        .update_login_metadata(|m| m.takeout_id = Some(takeout.id));
                    self.start_idle_timer(takeout.id);
                    self.spawn_dialog_crawl(takeout.id);
                    return Ok(takeout.id);
                }
                Err(e) if e.is("TAKEOUT_INIT_DELAY") => {
                    // The user has to approve the data-export request;
                    // the service notification edit sets the event.
                    let delay = match &e {
                        grammers_client::InvocationError::Rpc(rpc) => {
                            rpc.value.unwrap_or(60) as u64
                        }
                        _ => 60,
                    };
                    debug!(
                        "login {}: takeout delayed, waiting up to {delay}s for approval",
                        self.user_id()
                    );
                    self.0.takeout_accepted.clear();
                    let accepted = self
                        .0
                        .takeout_accepted
                        .wait_timeout(Duration::from_secs(delay));
                    tokio::select! {
                        _ = accepted => {}
                        _ = self.0.stopped.wait() => return Err(BridgeError::Cancelled),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn start_idle_timer(&self, takeout_id: i64) {
        let idle = self.takeout_idle_timeout();
        let (tx, mut rx) = watch::channel(Instant::now() + idle);
        *self.0.takeout_idle_bump.lock().unwrap() = Some(tx);

        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let deadline = *rx.borrow_and_update();
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline.into()) => {
                        if *rx.borrow() <= Instant::now() {
                            this.finish_takeout(takeout_id).await;
                            break;
                        }
                    }
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = this.0.stopped.wait() => break,
                }
            }
        });
    }

    /// Postpones the idle release; called on every takeout use.
    pub(crate) fn bump_takeout_idle(&self) {
        let idle = self.takeout_idle_timeout();
        if let Some(tx) = &*self.0.takeout_idle_bump.lock().unwrap() {
            let _ = tx.send(Instant::now() + idle);
        }
    }

    async fn finish_takeout(&self, takeout_id: i64) {
        debug!("login {}: finishing idle takeout {takeout_id}", self.user_id());
        let result = self
            .invoke_takeout(
                takeout_id,
                tl::functions::account::FinishTakeoutSession { success: true },
            )
            .await;
        if let Err(e) = result {
            warn!("login {}: failed to finish takeout: {e}", self.user_id());
        }
        self.store().update_login_metadata(|m| m.takeout_id = None);
        *self.0.takeout_idle_bump.lock().unwrap() = None;
    }

    /// Fetches one batch of history around `anchor`.
    ///
    /// Forward fetches read recent messages, which Telegram serves
    /// freely. Backward fetches are history reads and go through the
    /// takeout session, serialised on the takeout lock. The anchor is
    /// the inclusive stop condition on both sides.
    pub async fn fetch_messages(
        &self,
        portal: PortalKey,
        anchor: i32,
        count: usize,
        forward: bool,
    ) -> Result<BackfillBatch, BridgeError> {
        self.wait_ready().await?;

        let is_supergroup = self
            .store()
            .portal_meta(portal)
            .map(|meta| meta.is_supergroup)
            .unwrap_or(false);
        let limit = count
            .min(self.config().backfill.count_for(portal.peer_type, is_supergroup))
            as i32;

        let peer = self.input_peer(portal)?;
        let request = tl::functions::messages::GetHistory {
            peer,
            offset_id: anchor,
            offset_date: 0,
            add_offset: if forward { -limit } else { 0 },
            limit,
            max_id: 0,
            min_id: 0,
            hash: 0,
        };

        let response = if forward {
            self.raw()?.invoke(&request).await?
        } else {
            let _guard = self.0.takeout_lock.lock().await;
            let takeout_id = self.acquire_takeout().await?;
            let response = self.invoke_takeout(takeout_id, request).await?;
            self.bump_takeout_idle();
            response
        };

        use tl::enums::messages::Messages;
        let (messages, users, chats) = match response {
            Messages::Messages(m) => (m.messages, m.users, m.chats),
            Messages::Slice(m) => (m.messages, m.users, m.chats),
            Messages::ChannelMessages(m) => (m.messages, m.users, m.chats),
            Messages::NotModified(_) => {
                return Err(BridgeError::UnexpectedResponse(
                    "messagesNotModified for getHistory",
                ));
            }
        };
        self.absorb_entities(&users, &chats);

        let mut converted = Vec::with_capacity(messages.len());
        for message in &messages {
            let message = match message {
                tl::enums::Message::Message(m) => m,
                _ => continue,
            };
            if anchor != 0 {
                if forward && message.id <= anchor {
                    continue;
                }
                if !forward && message.id >= anchor {
                    continue;
                }
            }
            match self.convert_message(message, portal).await {
                Ok(message) => converted.push(message),
                Err(e) => warn!(
                    "login {}: skipping unconvertible history message {}: {e}",
                    self.user_id(),
                    message.id
                ),
            }
        }
        // Stream order is the Telegram message id.
        converted.sort_by_key(|m| m.id.id);

        Ok(BackfillBatch {
            portal,
            forward,
            messages: converted,
        })
    }

    /// Walks every dialog once per login, creating portals and learning
    /// peers along the way. Runs in the background; safe to call on
    /// every takeout acquisition.
    fn spawn_dialog_crawl(&self, takeout_id: i64) {
        let done = self
            .store()
            .login_metadata()
            .map(|m| m.dialog_crawl_done)
            .unwrap_or(false);
        if done {
            return;
        }
        if self
            .0
            .crawl_started
            .swap(true, std::sync::atomic::Ordering::SeqCst)
        {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move { this.dialog_crawl(takeout_id).await });
    }

    async fn dialog_crawl(self, takeout_id: i64) {
        let mut cursor = self
            .store()
            .login_metadata()
            .and_then(|m| m.dialog_crawl_cursor)
            .and_then(|c| PortalKey::parse(&c).ok());
        let mut first_page = cursor.is_none();
        let mut offset_id = 0;
        let mut offset_date = 0;
        let mut offset_peer = match cursor {
            Some(portal) => match self.input_peer(portal) {
                Ok(peer) => peer,
                Err(_) => tl::enums::InputPeer::Empty,
            },
            None => tl::enums::InputPeer::Empty,
        };

        info!("login {}: starting dialog crawl", self.user_id());
        loop {
            if self.0.stopped.is_set() {
                return;
            }
            let request = tl::functions::messages::GetDialogs {
                exclude_pinned: false,
                folder_id: None,
                offset_date,
                offset_id,
                offset_peer: offset_peer.clone(),
                limit: DIALOG_PAGE_SIZE,
                hash: 0,
            };
            let response = match self.invoke_takeout(takeout_id, request).await {
                Ok(response) => response,
                Err(e) => {
                    warn!("login {}: dialog crawl aborted: {e}", self.user_id());
                    return;
                }
            };

            use tl::enums::messages::Dialogs;
            let (dialogs, messages, users, chats, last_page) = match response {
                Dialogs::Dialogs(d) => (d.dialogs, d.messages, d.users, d.chats, true),
                Dialogs::Slice(d) => (d.dialogs, d.messages, d.users, d.chats, false),
                Dialogs::NotModified(_) => return,
            };
            self.absorb_entities(&users, &chats);

            if first_page {
                // The first page carries the authoritative pinned set.
                let pinned: Vec<PortalKey> = dialogs
                    .iter()
                    .filter_map(|d| match d {
                        tl::enums::Dialog::Dialog(d) if d.pinned => {
                            Some(PortalKey::from_peer(&d.peer, None))
                        }
                        _ => None,
                    })
                    .collect();
                self.apply_pinned_dialogs(pinned);
                first_page = false;
            }

            let mut advanced = false;
            for dialog in &dialogs {
                let dialog = match dialog {
                    tl::enums::Dialog::Dialog(d) => d,
                    tl::enums::Dialog::Folder(_) => continue,
                };
                let portal = PortalKey::from_peer(&dialog.peer, None);
                self.emit(BridgeEvent::ChatResync {
                    portal,
                    create: true,
                    info: None,
                });

                if cursor != Some(portal) {
                    advanced = true;
                }
                cursor = Some(portal);
                offset_id = dialog.top_message;
                offset_date = messages
                    .iter()
                    .find_map(|m| match m {
                        tl::enums::Message::Message(m)
                            if m.id == dialog.top_message
                                && PortalKey::from_peer(&m.peer_id, None) == portal =>
                        {
                            Some(m.date)
                        }
                        _ => None,
                    })
                    .unwrap_or(offset_date);
                offset_peer = match self.input_peer(portal) {
                    Ok(peer) => peer,
                    Err(_) => break,
                };
                self.store().update_login_metadata(|m| {
                    m.dialog_crawl_cursor = Some(portal.to_string())
                });
            }

            if last_page || dialogs.is_empty() || !advanced {
                info!("login {}: dialog crawl finished", self.user_id());
                self.store()
                    .update_login_metadata(|m| m.dialog_crawl_done = true);
                return;
            }
            self.bump_takeout_idle();
        }
    }
}
