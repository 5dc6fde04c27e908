// Copyright 2024 - developers of the `matrigram` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The per-login session client.
//!
//! One [`SessionClient`] owns one MTProto connection, its update
//! dispatcher and the shared caches everything else in the engine reads.
//! Method implementations are spread across the engine's modules, the
//! same way the underlying client library spreads its own.

mod caches;
mod connect;
mod entities;

pub use caches::AppConfig;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use grammers_client::Client;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::bridge::events::BridgeEvent;
use crate::bridge::intent::MatrixMedia;
use crate::config::Config;
use crate::errors::BridgeError;
use crate::ids::{GhostId, PeerType, PortalKey};
use crate::store::ScopedStore;
use crate::util::Event;

pub(crate) struct ClientInner {
    pub(crate) user_id: i64,
    pub(crate) config: Config,
    pub(crate) store: ScopedStore,
    pub(crate) media: Arc<dyn MatrixMedia>,
    pub(crate) events: mpsc::UnboundedSender<BridgeEvent>,

    pub(crate) connection: StdMutex<Option<Connection>>,
    /// Fires once the connection has verified its authorization. Matrix
    /// events arriving earlier block on this.
    pub(crate) initialized: Event,
    /// Fires when the login is being torn down; cancels pending waits.
    pub(crate) stopped: Event,

    // Takeout state (see `takeout.rs`).
    pub(crate) takeout_lock: tokio::sync::Mutex<()>,
    pub(crate) takeout_accepted: Event,
    pub(crate) takeout_idle_bump: StdMutex<Option<tokio::sync::watch::Sender<Instant>>>,

    /// Ensures at most one dialog-crawl task per process.
    pub(crate) crawl_started: AtomicBool,

    // Shared caches.
    pub(crate) app_config: tokio::sync::Mutex<caches::AppConfigCache>,
    pub(crate) available_reactions: tokio::sync::Mutex<caches::AvailableReactionsCache>,
    pub(crate) premium: AtomicBool,

    /// Channels the login has left or been banned from; messages that
    /// still reference them are dropped.
    pub(crate) left_channels: StdMutex<HashSet<i64>>,
    /// Last reaction-poll instant per broadcast-channel portal.
    pub(crate) reaction_polls: StdMutex<HashMap<PortalKey, Instant>>,
}

pub(crate) struct Connection {
    pub(crate) client: Client,
    pub(crate) tasks: Vec<AbortHandle>,
}

/// Everything needed to build a [`SessionClient`].
pub struct SessionParams {
    /// Telegram user id of the login.
    pub user_id: i64,
    pub config: Config,
    pub store: ScopedStore,
    pub media: Arc<dyn MatrixMedia>,
    /// Channel the neutral bridge events are delivered on, in update
    /// order per portal.
    pub events: mpsc::UnboundedSender<BridgeEvent>,
}

/// Wrapper around one login's connection to Telegram and the state
/// shared by the conversion pipelines.
///
/// Cloning is cheap and all clones drive the same connection.
#[derive(Clone)]
pub struct SessionClient(pub(crate) Arc<ClientInner>);

impl SessionClient {
    pub fn new(params: SessionParams) -> Self {
        Self(Arc::new(ClientInner {
            user_id: params.user_id,
            config: params.config,
            store: params.store,
            media: params.media,
            events: params.events,
            connection: StdMutex::new(None),
            initialized: Event::new(),
            stopped: Event::new(),
            takeout_lock: tokio::sync::Mutex::new(()),
            takeout_accepted: Event::new(),
            takeout_idle_bump: StdMutex::new(None),
            crawl_started: AtomicBool::new(false),
            app_config: tokio::sync::Mutex::new(Default::default()),
            available_reactions: tokio::sync::Mutex::new(Default::default()),
            premium: AtomicBool::new(false),
            left_channels: StdMutex::new(HashSet::new()),
            reaction_polls: StdMutex::new(HashMap::new()),
        }))
    }

    pub fn user_id(&self) -> i64 {
        self.0.user_id
    }

    pub fn store(&self) -> &ScopedStore {
        &self.0.store
    }

    pub(crate) fn config(&self) -> &Config {
        &self.0.config
    }

    /// The ghost identity of the login's own account.
    pub fn self_ghost(&self) -> GhostId {
        GhostId::User(self.0.user_id)
    }

    /// Whether the logged-in account has Telegram Premium.
    pub fn is_premium(&self) -> bool {
        self.0.premium.load(Ordering::Relaxed)
    }

    /// Emits one event to the framework. Delivery failures mean the
    /// framework is gone, which only happens during shutdown.
    pub(crate) fn emit(&self, event: BridgeEvent) {
        let _ = self.0.events.send(event);
    }

    /// The connected raw client.
    pub(crate) fn raw(&self) -> Result<Client, BridgeError> {
        self.0
            .connection
            .lock()
            .unwrap()
            .as_ref()
            .map(|conn| conn.client.clone())
            .ok_or(BridgeError::Cancelled)
    }

    /// Blocks until the connection finished initialising.
    ///
    /// Returns a cancellation error if the login is stopped first; this
    /// is the ordering gate every inbound Matrix event passes through.
    pub async fn wait_ready(&self) -> Result<(), BridgeError> {
        tokio::select! {
            _ = self.0.initialized.wait() => Ok(()),
            _ = self.0.stopped.wait() => Err(BridgeError::Cancelled),
        }
    }

    /// Resolves a portal to an input peer using the access-hash cache.
    ///
    /// Users fall back to the ambient (zero) authority, which Telegram
    /// accepts for contacts. Channels cannot be addressed without their
    /// current hash, so a miss is an error there.
    pub(crate) fn input_peer(
        &self,
        portal: PortalKey,
    ) -> Result<grammers_tl_types::enums::InputPeer, BridgeError> {
        use grammers_tl_types as tl;
        match portal.peer_type {
            PeerType::User => Ok(tl::enums::InputPeer::User(tl::types::InputPeerUser {
                user_id: portal.id,
                access_hash: self
                    .0
                    .store
                    .access_hash(PeerType::User, portal.id)
                    .unwrap_or_default(),
            })),
            PeerType::Chat => Ok(tl::enums::InputPeer::Chat(tl::types::InputPeerChat {
                chat_id: portal.id,
            })),
            PeerType::Channel => {
                let access_hash = self
                    .0
                    .store
                    .access_hash(PeerType::Channel, portal.id)
                    .ok_or(BridgeError::MissingAccessHash(portal))?;
                Ok(tl::enums::InputPeer::Channel(tl::types::InputPeerChannel {
                    channel_id: portal.id,
                    access_hash,
                }))
            }
        }
    }

    pub(crate) fn input_channel(
        &self,
        portal: PortalKey,
    ) -> Result<grammers_tl_types::enums::InputChannel, BridgeError> {
        use grammers_tl_types as tl;
        let access_hash = self
            .0
            .store
            .access_hash(PeerType::Channel, portal.id)
            .ok_or(BridgeError::MissingAccessHash(portal))?;
        Ok(tl::enums::InputChannel::Channel(tl::types::InputChannel {
            channel_id: portal.id,
            access_hash,
        }))
    }

    pub(crate) fn is_left_channel(&self, channel_id: i64) -> bool {
        self.0.left_channels.lock().unwrap().contains(&channel_id)
    }
}
