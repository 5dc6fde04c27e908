// Copyright 2024 - developers of the `matrigram` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The neutral event model the converters emit.
//!
//! Nothing in here references Telegram's schema or live connection
//! state; entities are addressed only by the stable identifiers of
//! [`crate::ids`], so the framework can queue, persist and replay these
//! freely.

use std::time::Duration;

use crate::ids::{EmojiId, GhostId, MessageId, PortalKey};
use crate::media::reference::DirectMediaRef;
use crate::store::MessageRecord;

/// One event handed to the bridge framework.
#[derive(Clone, Debug)]
pub enum BridgeEvent {
    Message(ConvertedMessage),
    Edit(ConvertedEdit),
    Delete {
        portal: PortalKey,
        records: Vec<MessageRecord>,
    },
    /// Full reaction state for one message. Emitted for every converted
    /// message, even with no reactions, because this is also how
    /// reaction removals on old messages reach Matrix.
    ReactionSync {
        portal: PortalKey,
        message: MessageId,
        reactions: Vec<RemoteReaction>,
    },
    Receipt {
        portal: PortalKey,
        sender: GhostId,
        up_to_message: i32,
        /// Whether this is the remote user reading our messages
        /// (outbox receipts are only attributable in user DMs).
        outbox: bool,
    },
    Typing {
        portal: PortalKey,
        sender: GhostId,
        /// Zero means "stopped typing".
        timeout: Duration,
    },
    GhostUpdate(GhostInfo),
    /// Portal-level notification settings changed on the remote side.
    Mute {
        portal: PortalKey,
        /// Unix timestamp until which the portal is muted; `None` unmutes.
        muted_until: Option<i64>,
    },
    /// A dialog was (un)pinned on Telegram; maps to the Matrix
    /// favourite room tag.
    Tag {
        portal: PortalKey,
        favourite: bool,
    },
    /// A user blocked or unblocked the login. Raises or restores the DM
    /// portal's events-default power level.
    Blocked {
        user_id: i64,
        blocked: bool,
    },
    /// Portal metadata changed, or the portal was first referenced and
    /// may need to be created.
    ChatResync {
        portal: PortalKey,
        create: bool,
        info: Option<ChatInfo>,
    },
    /// The login left the chat (or was removed); the framework cleans up
    /// its side of the portal.
    ChatDelete {
        portal: PortalKey,
    },
    /// A member joined or left, observed via a service message.
    Member {
        portal: PortalKey,
        ghost: GhostId,
        joined: bool,
    },
    Backfill(BackfillBatch),
    /// A decrypted push notification, bridged while no live connection
    /// exists.
    Notification(crate::push::PushNotification),
    /// The server invalidated the authorization; the user must log in
    /// again.
    LoggedOut,
}

/// A Telegram message converted to Matrix shape.
#[derive(Clone, Debug)]
pub struct ConvertedMessage {
    pub portal: PortalKey,
    pub sender: GhostId,
    pub id: MessageId,
    /// Unix timestamp of the Telegram message.
    pub timestamp: i64,
    pub reply_to: Option<MessageId>,
    pub parts: Vec<ConvertedPart>,
    /// Distinguishes authors of broadcast-channel posts rendered under
    /// the single channel ghost.
    pub profile: Option<MessageProfile>,
}

/// A converted edit carrying only the parts that actually changed.
#[derive(Clone, Debug)]
pub struct ConvertedEdit {
    pub portal: PortalKey,
    pub sender: GhostId,
    pub id: MessageId,
    pub timestamp: i64,
    pub parts: Vec<ConvertedPart>,
}

#[derive(Clone, Debug)]
pub struct ConvertedPart {
    /// Stable within the message; `""` for the only part, `"caption"`
    /// for a split caption.
    pub part_id: String,
    pub kind: PartKind,
    pub body: String,
    /// Matrix HTML, present when the plain body loses formatting.
    pub formatted_body: Option<String>,
    pub media: Option<ConvertedMedia>,
    /// Telegram photo/document id behind `media`, used for edit
    /// deduplication and re-upload avoidance.
    pub media_id: Option<i64>,
    /// `geo:` URI for location parts.
    pub geo_uri: Option<String>,
    pub link_preview: Option<LinkPreview>,
    pub disappear: Option<Disappearing>,
    /// SHA-256 over the Telegram text and stable media id, for edit
    /// deduplication.
    pub content_hash: [u8; 32],
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PartKind {
    Text,
    Notice,
    Emote,
    Image,
    File,
    Audio,
    Voice,
    Video,
    Sticker,
    Location,
}

/// Media accompanying a part, either already uploaded to the Matrix
/// repository or addressable via direct media.
#[derive(Clone, Debug)]
pub enum ConvertedMedia {
    Uploaded {
        mxc: String,
        mime: String,
        filename: Option<String>,
        size: Option<i64>,
        info: MediaInfo,
    },
    Direct {
        reference: DirectMediaRef,
        mime: Option<String>,
        filename: Option<String>,
        size: Option<i64>,
        info: MediaInfo,
    },
}

impl ConvertedMedia {
    pub fn content_uri(&self) -> Option<&str> {
        match self {
            ConvertedMedia::Uploaded { mxc, .. } => Some(mxc),
            ConvertedMedia::Direct { .. } => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct MediaInfo {
    pub width: Option<i32>,
    pub height: Option<i32>,
    /// Seconds, for audio and video.
    pub duration: Option<f64>,
}

/// Beeper-style link preview derived from a Telegram webpage media.
#[derive(Clone, Debug)]
pub struct LinkPreview {
    pub url: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub site_name: Option<String>,
    pub image: Option<ConvertedMedia>,
}

/// How a part self-destructs, mapped from Telegram's TTL variants.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disappearing {
    /// Explicit media TTL: counts from when the recipient reads it.
    AfterRead { seconds: i32 },
    /// Portal-level message TTL: counts from when it was sent.
    AfterSend { seconds: i32 },
}

/// Displayed author of a broadcast-channel post.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageProfile {
    pub id: String,
    pub name: String,
}

#[derive(Clone, Debug)]
pub struct RemoteReaction {
    pub sender: GhostId,
    pub emoji: EmojiId,
    /// Matrix fallback for custom emojis bridged into the media repo.
    pub mxc: Option<String>,
}

/// Remote profile state of a ghost, refreshed on every observation.
#[derive(Clone, Debug, Default)]
pub struct GhostInfo {
    pub id: Option<GhostId>,
    pub name: Option<String>,
    pub username: Option<String>,
    pub phone: Option<String>,
    /// Telegram photo id of the current avatar; zero clears it.
    pub avatar_id: Option<i64>,
    pub is_bot: Option<bool>,
    pub is_premium: Option<bool>,
    pub is_channel: bool,
    pub blocked: Option<bool>,
}

/// Remote state of a portal, refreshed on resync.
#[derive(Clone, Debug, Default)]
pub struct ChatInfo {
    pub name: Option<String>,
    pub about: Option<String>,
    pub avatar_id: Option<i64>,
    pub is_supergroup: bool,
    pub dm: bool,
    pub messages_ttl: Option<i32>,
    /// `None` = all, empty = none, list = whitelist of emoji ids.
    pub allowed_reactions: Option<Vec<String>>,
}

/// A page of history produced by the backfill engine. Stream order
/// within the batch is the Telegram message id.
#[derive(Clone, Debug)]
pub struct BackfillBatch {
    pub portal: PortalKey,
    pub forward: bool,
    pub messages: Vec<ConvertedMessage>,
}
