// Copyright 2024 - developers of the `matrigram` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The slice of process configuration the engine reads.
//!
//! Loading and validating the full deployment config is the daemon's
//! job; the engine only sees this struct.

use serde::{Deserialize, Serialize};

use crate::ids::PeerType;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Developer's [Application Identifier](https://core.telegram.org/myapp).
    pub api_id: i32,
    /// Application hash paired with [`Config::api_id`].
    pub api_hash: String,

    /// Homeserver domain ghosts live on. Empty disables ghost mention
    /// links in formatted bodies.
    pub homeserver_domain: String,
    /// Localpart template for ghost user ids; `{}` is replaced with the
    /// ghost identifier.
    pub username_template: String,

    /// Separate portal rooms per login for direct chats.
    pub split_portals: bool,

    /// Serve Telegram media to homeservers on demand instead of
    /// re-uploading it to the Matrix media repository.
    pub direct_media: bool,

    /// Always send reactions as custom emojis from the bundled pack, even
    /// when the plain emoticon would be accepted.
    pub always_custom_emoji: bool,

    /// Replace view-once media with a notice instead of bridging it.
    pub disable_view_once: bool,

    /// Convert animated stickers with ffmpeg before handing them to
    /// Matrix. When enabled, stickers are never served via direct media
    /// because the converted bytes differ from Telegram's.
    pub animated_sticker_conversion: bool,

    /// Images whose pixel area exceeds this are sent as documents rather
    /// than photos, to dodge Telegram's server-side re-encoding.
    pub photo_max_area: i64,

    pub backfill: BackfillConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BackfillConfig {
    /// Delay between backfill batches, in seconds. Also stretches the
    /// takeout idle timeout, which is `max(1h, 2 * batch_delay)`.
    pub batch_delay: u64,

    /// Per-batch message count caps by portal kind.
    pub user_count: usize,
    pub normal_group_count: usize,
    pub supergroup_count: usize,
    pub channel_count: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_id: 0,
            api_hash: String::new(),
            homeserver_domain: String::new(),
            username_template: "telegram_{}".to_string(),
            split_portals: false,
            direct_media: false,
            always_custom_emoji: false,
            disable_view_once: false,
            animated_sticker_conversion: true,
            photo_max_area: 2560 * 2560,
            backfill: BackfillConfig::default(),
        }
    }
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            batch_delay: 20,
            user_count: 50,
            normal_group_count: 100,
            supergroup_count: 200,
            channel_count: 200,
        }
    }
}

impl Config {
    /// The Matrix user id of the ghost for a Telegram identity.
    pub fn ghost_mxid(&self, ghost: &crate::ids::GhostId) -> Option<String> {
        if self.homeserver_domain.is_empty() {
            return None;
        }
        // Ghost ids may carry a type prefix; colons cannot appear in a
        // Matrix localpart.
        let id = ghost.to_string().replace(':', "");
        let localpart = self.username_template.replace("{}", &id);
        Some(format!("@{}:{}", localpart, self.homeserver_domain))
    }

    /// Inverse of [`Config::ghost_mxid`].
    pub fn ghost_from_mxid(&self, mxid: &str) -> Option<crate::ids::GhostId> {
        use crate::ids::GhostId;
        if self.homeserver_domain.is_empty() {
            return None;
        }
        let localpart = mxid
            .strip_prefix('@')?
            .strip_suffix(&format!(":{}", self.homeserver_domain))?;
        let (prefix, suffix) = self.username_template.split_once("{}")?;
        let id = localpart.strip_prefix(prefix)?.strip_suffix(suffix)?;
        if let Some(channel) = id.strip_prefix("channel") {
            Some(GhostId::Channel(channel.parse().ok()?))
        } else {
            Some(GhostId::User(id.parse().ok()?))
        }
    }
}

impl BackfillConfig {
    /// The message-count cap for one backfill batch in the given portal.
    pub fn count_for(&self, peer_type: PeerType, is_supergroup: bool) -> usize {
        match peer_type {
            PeerType::User => self.user_count,
            PeerType::Chat => self.normal_group_count,
            PeerType::Channel if is_supergroup => self.supergroup_count,
            PeerType::Channel => self.channel_count,
        }
    }
}
