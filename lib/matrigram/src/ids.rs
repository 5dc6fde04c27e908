// Copyright 2024 - developers of the `matrigram` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Stable textual identifiers exchanged with the Matrix side.
//!
//! Everything the bridge hands to the framework is addressed by strings:
//! portals, ghosts, messages and reaction emojis. The encodings here are
//! bijective so that any identifier coming back from the framework can be
//! resolved to the Telegram entity it was minted from.

use std::fmt;
use std::str::FromStr;

use grammers_tl_types as tl;
use serde::{Deserialize, Serialize};

/// Kind of Telegram peer a portal mirrors.
///
/// The [`PeerType::code`] byte is only used inside binary direct-media
/// references; everywhere else peers are spelled out by name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerType {
    User,
    Chat,
    Channel,
}

impl PeerType {
    /// Single-byte encoding used in direct-media references.
    pub fn code(self) -> u8 {
        match self {
            PeerType::User => 1,
            PeerType::Chat => 2,
            PeerType::Channel => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(PeerType::User),
            2 => Some(PeerType::Chat),
            3 => Some(PeerType::Channel),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PeerType::User => "user",
            PeerType::Chat => "chat",
            PeerType::Channel => "channel",
        }
    }
}

impl fmt::Display for PeerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PeerType {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(PeerType::User),
            "chat" => Ok(PeerType::Chat),
            "channel" => Ok(PeerType::Channel),
            _ => Err(IdParseError::BadPeerType),
        }
    }
}

/// Identity of one portal: a Telegram chat as seen by one (or all) logins.
///
/// The `receiver` is only set when the deployment runs in split-portal
/// mode, where each login gets its own Matrix room for direct chats. It is
/// intentionally not part of the textual form; the framework carries it as
/// a separate column.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortalKey {
    pub peer_type: PeerType,
    pub id: i64,
    pub receiver: Option<i64>,
}

impl PortalKey {
    pub fn user(id: i64) -> Self {
        Self {
            peer_type: PeerType::User,
            id,
            receiver: None,
        }
    }

    pub fn chat(id: i64) -> Self {
        Self {
            peer_type: PeerType::Chat,
            id,
            receiver: None,
        }
    }

    pub fn channel(id: i64) -> Self {
        Self {
            peer_type: PeerType::Channel,
            id,
            receiver: None,
        }
    }

    pub fn with_receiver(mut self, receiver: Option<i64>) -> Self {
        self.receiver = receiver;
        self
    }

    /// Portal the given Telegram peer belongs to.
    pub fn from_peer(peer: &tl::enums::Peer, receiver: Option<i64>) -> Self {
        match peer {
            tl::enums::Peer::User(u) => Self::user(u.user_id).with_receiver(receiver),
            tl::enums::Peer::Chat(c) => Self::chat(c.chat_id),
            tl::enums::Peer::Channel(c) => Self::channel(c.channel_id),
        }
    }

    /// Telegram-side peer for this portal.
    pub fn to_peer(&self) -> tl::enums::Peer {
        match self.peer_type {
            PeerType::User => tl::enums::Peer::User(tl::types::PeerUser { user_id: self.id }),
            PeerType::Chat => tl::enums::Peer::Chat(tl::types::PeerChat { chat_id: self.id }),
            PeerType::Channel => tl::enums::Peer::Channel(tl::types::PeerChannel {
                channel_id: self.id,
            }),
        }
    }

    pub fn parse(s: &str) -> Result<Self, IdParseError> {
        let (ty, id) = s.split_once(':').ok_or(IdParseError::BadPortal)?;
        Ok(Self {
            peer_type: ty.parse()?,
            id: id.parse().map_err(|_| IdParseError::BadPortal)?,
            receiver: None,
        })
    }
}

impl fmt::Display for PortalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.peer_type, self.id)
    }
}

impl FromStr for PortalKey {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Identity of a ghost: a Telegram user, or a broadcast channel rendered
/// as a single sender account.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GhostId {
    User(i64),
    Channel(i64),
}

impl GhostId {
    pub fn bare_id(self) -> i64 {
        match self {
            GhostId::User(id) | GhostId::Channel(id) => id,
        }
    }

    pub fn is_channel(self) -> bool {
        matches!(self, GhostId::Channel(_))
    }

    pub fn parse(s: &str) -> Result<Self, IdParseError> {
        if let Some(id) = s.strip_prefix("channel:") {
            Ok(GhostId::Channel(
                id.parse().map_err(|_| IdParseError::BadGhost)?,
            ))
        } else {
            Ok(GhostId::User(s.parse().map_err(|_| IdParseError::BadGhost)?))
        }
    }
}

impl fmt::Display for GhostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GhostId::User(id) => write!(f, "{id}"),
            GhostId::Channel(id) => write!(f, "channel:{id}"),
        }
    }
}

impl FromStr for GhostId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Identity of one login (an authenticated Telegram account), which is the
/// stringified Telegram user id.
pub fn make_login_id(user_id: i64) -> String {
    user_id.to_string()
}

pub fn parse_login_id(s: &str) -> Result<i64, IdParseError> {
    s.parse().map_err(|_| IdParseError::BadLogin)
}

/// Identity of one Telegram message as seen from Matrix.
///
/// Channel message ids are only unique within their channel, so the
/// portal key is embedded for channel portals. User and group chat
/// message ids live in the login-wide message box and are emitted bare.
/// Parsers accept both forms regardless of peer type and surface the
/// portal a qualified id implies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MessageId {
    pub portal: Option<PortalKey>,
    pub id: i32,
}

impl MessageId {
    pub fn bare(id: i32) -> Self {
        Self { portal: None, id }
    }

    /// Mint the identifier for a message in the given portal.
    pub fn make(portal: PortalKey, id: i32) -> Self {
        match portal.peer_type {
            PeerType::Channel => Self {
                portal: Some(portal),
                id,
            },
            _ => Self::bare(id),
        }
    }

    pub fn parse(s: &str) -> Result<Self, IdParseError> {
        match s.split_once('.') {
            Some((portal, id)) => Ok(Self {
                portal: Some(PortalKey::parse(portal)?),
                id: id.parse().map_err(|_| IdParseError::BadMessage)?,
            }),
            None => Ok(Self::bare(s.parse().map_err(|_| IdParseError::BadMessage)?)),
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.portal {
            Some(portal) => write!(f, "{}.{}", portal, self.id),
            None => write!(f, "{}", self.id),
        }
    }
}

impl FromStr for MessageId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Identity of a reaction emoji.
///
/// Plain Unicode reactions are carried verbatim. Telegram custom emojis
/// are document references, carried by id with a prefix that can never
/// collide with an emoticon.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum EmojiId {
    Unicode(String),
    CustomDocument(i64),
}

const CUSTOM_EMOJI_PREFIX: &str = "tg-emoji-";

impl EmojiId {
    pub fn unicode(emoticon: impl Into<String>) -> Self {
        EmojiId::Unicode(emoticon.into())
    }

    pub fn custom(document_id: i64) -> Self {
        EmojiId::CustomDocument(document_id)
    }

    pub fn parse(s: &str) -> Result<Self, IdParseError> {
        if let Some(id) = s.strip_prefix(CUSTOM_EMOJI_PREFIX) {
            Ok(EmojiId::CustomDocument(
                id.parse().map_err(|_| IdParseError::BadEmoji)?,
            ))
        } else if s.is_empty() {
            Err(IdParseError::BadEmoji)
        } else {
            Ok(EmojiId::Unicode(s.to_string()))
        }
    }

    /// The raw reaction to send back to Telegram.
    pub fn to_reaction(&self) -> tl::enums::Reaction {
        match self {
            EmojiId::Unicode(emoticon) => tl::enums::Reaction::Emoji(tl::types::ReactionEmoji {
                emoticon: emoticon.clone(),
            }),
            EmojiId::CustomDocument(document_id) => {
                tl::enums::Reaction::CustomEmoji(tl::types::ReactionCustomEmoji {
                    document_id: *document_id,
                })
            }
        }
    }

    /// The emoji id a raw Telegram reaction maps to, if it is bridgeable.
    pub fn from_reaction(reaction: &tl::enums::Reaction) -> Option<Self> {
        match reaction {
            tl::enums::Reaction::Emoji(r) => Some(EmojiId::Unicode(r.emoticon.clone())),
            tl::enums::Reaction::CustomEmoji(r) => Some(EmojiId::CustomDocument(r.document_id)),
            _ => None,
        }
    }
}

impl fmt::Display for EmojiId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmojiId::Unicode(emoticon) => f.write_str(emoticon),
            EmojiId::CustomDocument(id) => write!(f, "{CUSTOM_EMOJI_PREFIX}{id}"),
        }
    }
}

impl FromStr for EmojiId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// The error type which is returned when an identifier fails to parse.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdParseError {
    BadPeerType,
    BadPortal,
    BadGhost,
    BadLogin,
    BadMessage,
    BadEmoji,
}

impl fmt::Display for IdParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadPeerType => write!(f, "invalid peer type"),
            Self::BadPortal => write!(f, "invalid portal id"),
            Self::BadGhost => write!(f, "invalid ghost id"),
            Self::BadLogin => write!(f, "invalid login id"),
            Self::BadMessage => write!(f, "invalid message id"),
            Self::BadEmoji => write!(f, "invalid emoji id"),
        }
    }
}

impl std::error::Error for IdParseError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn portal_roundtrip() {
        for key in [
            PortalKey::user(777000),
            PortalKey::chat(123456),
            PortalKey::channel(1234567890),
            PortalKey::user(42).with_receiver(Some(7)),
        ] {
            let parsed = PortalKey::parse(&key.to_string()).unwrap();
            assert_eq!(parsed.peer_type, key.peer_type);
            assert_eq!(parsed.id, key.id);
            // The receiver is carried out-of-band, never in the string.
            assert_eq!(parsed.receiver, None);
        }
    }

    #[test]
    fn portal_text_format() {
        assert_eq!(PortalKey::user(42).to_string(), "user:42");
        assert_eq!(PortalKey::chat(9).to_string(), "chat:9");
        assert_eq!(PortalKey::channel(100).to_string(), "channel:100");
    }

    #[test]
    fn message_id_forms() {
        let channel = PortalKey::channel(1000);
        let qualified = MessageId::make(channel, 55);
        assert_eq!(qualified.to_string(), "channel:1000.55");
        assert_eq!(MessageId::parse("channel:1000.55").unwrap(), qualified);

        let bare = MessageId::make(PortalKey::user(5), 77);
        assert_eq!(bare.to_string(), "77");
        assert_eq!(MessageId::parse("77").unwrap(), bare);
    }

    #[test]
    fn message_id_rejects_garbage() {
        assert!(MessageId::parse("channel:x.55").is_err());
        assert!(MessageId::parse("nope").is_err());
    }

    #[test]
    fn ghost_roundtrip() {
        for ghost in [GhostId::User(1234), GhostId::Channel(4321)] {
            assert_eq!(GhostId::parse(&ghost.to_string()).unwrap(), ghost);
        }
        assert_eq!(GhostId::parse("channel:77").unwrap(), GhostId::Channel(77));
    }

    #[test]
    fn emoji_roundtrip() {
        for emoji in [
            EmojiId::unicode("\u{1F44D}"),
            EmojiId::custom(5368324170671202286),
        ] {
            assert_eq!(EmojiId::parse(&emoji.to_string()).unwrap(), emoji);
        }
    }

    #[test]
    fn login_id_roundtrip() {
        assert_eq!(parse_login_id(&make_login_id(987654321)).unwrap(), 987654321);
    }

    #[test]
    fn peer_type_codes() {
        for ty in [PeerType::User, PeerType::Chat, PeerType::Channel] {
            assert_eq!(PeerType::from_code(ty.code()), Some(ty));
        }
        assert_eq!(PeerType::from_code(0), None);
    }
}
