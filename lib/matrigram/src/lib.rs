// Copyright 2024 - developers of the `matrigram` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! # Brief on the bridge core
//!
//! This library implements the per-session engine that bridges one Matrix
//! user's Telegram account into Matrix rooms. Each authenticated Telegram
//! account is a *login*; every Telegram chat a login participates in is
//! mirrored as a *portal*, and every Telegram user or broadcast channel is
//! mirrored as a *ghost*.
//!
//! The engine is a consumer of the [`grammers`] crates for everything at
//! the MTProto layer: connections, the update stream, and the raw
//! [`tl`] schema. On top of that it provides:
//!
//! - the persistent, resumable session client with its update pipeline
//!   and access-hash cache ([`client`], [`store`]);
//! - the bidirectional event converter for messages, media and reactions
//!   ([`incoming`], [`outgoing`], [`media`], [`reactions`]);
//! - the historical backfill engine built on Telegram's takeout sessions
//!   ([`takeout`]);
//! - the direct-media addressable-storage scheme ([`media::reference`]);
//! - the phased phone/code/password login machine ([`login`]) and the
//!   legacy provisioning endpoints that drive it ([`provisioning`]);
//! - the push notification decryptor ([`push`]).
//!
//! The Matrix side of the bridge (portal room management, ghost intents,
//! the database) is deliberately not here; the engine talks to it through
//! the narrow seam in [`bridge`].
//!
//! [`grammers`]: https://github.com/Lonami/grammers

#![deny(unsafe_code)]

pub mod bridge;
pub mod client;
pub mod config;
pub mod errors;
pub mod ids;
pub mod incoming;
pub mod login;
pub mod media;
pub mod outgoing;
pub mod parsers;
pub mod provisioning;
pub mod push;
pub mod reactions;
pub mod store;
pub mod takeout;
#[cfg(test)]
pub(crate) mod testutil;
pub(crate) mod util;

pub use bridge::events::BridgeEvent;
pub use client::SessionClient;
pub use config::Config;
pub use errors::BridgeError;
pub use grammers_client::{Client, InvocationError};
pub use grammers_tl_types as tl;
pub use ids::{EmojiId, GhostId, MessageId, PeerType, PortalKey};
pub use login::{LoginFlow, LoginStep};
pub use store::{MemoryStore, ScopedStore, StoreBackend};
