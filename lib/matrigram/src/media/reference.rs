// Copyright 2024 - developers of the `matrigram` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Addressable references for on-demand media fetches.
//!
//! In direct-media mode the bridge does not copy Telegram files into the
//! Matrix media repository. It hands the homeserver an opaque media id
//! encoding everything needed to fetch the bytes later: which login can
//! authenticate the download, which message owns the media, and whether
//! the thumbnail is wanted. The binary layout is an external contract;
//! older, shorter layouts must keep decoding forever.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

use crate::ids::PeerType;

const VERSION: u8 = 0;
/// version + peer type + 4×i64 + thumbnail flag.
const FULL_LEN: usize = 35;

/// A fixed-layout binary tuple addressing one piece of Telegram media.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DirectMediaRef {
    pub peer_type: PeerType,
    pub peer_id: i64,
    /// Login whose authorization can perform the fetch. Zero in legacy
    /// references; the serving side then picks any login in the portal.
    pub login_user_id: i64,
    /// Owning message. Zero for avatar and profile photo references.
    pub message_id: i64,
    /// Photo or document id, or the avatar id.
    pub media_id: i64,
    pub thumbnail: bool,
}

impl DirectMediaRef {
    pub fn encode(&self) -> [u8; FULL_LEN] {
        let mut out = [0u8; FULL_LEN];
        out[0] = VERSION;
        out[1] = self.peer_type.code();
        out[2..10].copy_from_slice(&self.peer_id.to_be_bytes());
        out[10..18].copy_from_slice(&self.login_user_id.to_be_bytes());
        out[18..26].copy_from_slice(&self.message_id.to_be_bytes());
        out[26..34].copy_from_slice(&self.media_id.to_be_bytes());
        out[34] = self.thumbnail as u8;
        out
    }

    /// Decodes any historically-produced layout.
    ///
    /// The 18-, 19- and 27-byte forms predate the login and message
    /// fields; whatever a layout lacks decodes as zero.
    pub fn decode(data: &[u8]) -> Result<Self, RefDecodeError> {
        let read_i64 = |at: usize| i64::from_be_bytes(data[at..at + 8].try_into().unwrap());

        if data.len() < 2 || data[0] != VERSION {
            return Err(RefDecodeError::BadVersion);
        }
        let peer_type = PeerType::from_code(data[1]).ok_or(RefDecodeError::BadPeerType)?;

        match data.len() {
            18 => Ok(Self {
                peer_type,
                peer_id: read_i64(2),
                login_user_id: 0,
                message_id: 0,
                media_id: read_i64(10),
                thumbnail: false,
            }),
            19 => Ok(Self {
                peer_type,
                peer_id: read_i64(2),
                login_user_id: 0,
                message_id: 0,
                media_id: read_i64(10),
                thumbnail: data[18] != 0,
            }),
            27 => Ok(Self {
                peer_type,
                peer_id: read_i64(2),
                login_user_id: 0,
                message_id: read_i64(10),
                media_id: read_i64(18),
                thumbnail: data[26] != 0,
            }),
            FULL_LEN => Ok(Self {
                peer_type,
                peer_id: read_i64(2),
                login_user_id: read_i64(10),
                message_id: read_i64(18),
                media_id: read_i64(26),
                thumbnail: data[34] != 0,
            }),
            _ => Err(RefDecodeError::BadLength(data.len())),
        }
    }

    /// The reference as an opaque media id string.
    pub fn to_media_id(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.encode())
    }

    pub fn from_media_id(id: &str) -> Result<Self, RefDecodeError> {
        let data = URL_SAFE_NO_PAD
            .decode(id)
            .map_err(|_| RefDecodeError::BadEncoding)?;
        Self::decode(&data)
    }
}

/// This error occurs when a media id cannot be interpreted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefDecodeError {
    BadEncoding,
    BadVersion,
    BadPeerType,
    BadLength(usize),
}

impl fmt::Display for RefDecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadEncoding => write!(f, "media id is not valid base64url"),
            Self::BadVersion => write!(f, "unknown media reference version"),
            Self::BadPeerType => write!(f, "unknown peer type in media reference"),
            Self::BadLength(len) => write!(f, "media reference has invalid length {len}"),
        }
    }
}

impl std::error::Error for RefDecodeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let reference = DirectMediaRef {
            peer_type: PeerType::Channel,
            peer_id: 1234567890,
            login_user_id: 777,
            message_id: 42,
            media_id: -5,
            thumbnail: true,
        };
        assert_eq!(DirectMediaRef::decode(&reference.encode()).unwrap(), reference);
        assert_eq!(
            DirectMediaRef::from_media_id(&reference.to_media_id()).unwrap(),
            reference
        );
    }

    #[test]
    fn known_layout() {
        let reference = DirectMediaRef {
            peer_type: PeerType::User,
            peer_id: 42,
            login_user_id: 7,
            message_id: 100,
            media_id: 999,
            thumbnail: false,
        };
        let mut expected = vec![0u8, 1u8];
        expected.extend_from_slice(&42i64.to_be_bytes());
        expected.extend_from_slice(&7i64.to_be_bytes());
        expected.extend_from_slice(&100i64.to_be_bytes());
        expected.extend_from_slice(&999i64.to_be_bytes());
        expected.push(0);
        assert_eq!(reference.encode().to_vec(), expected);
    }

    #[test]
    fn legacy_layouts() {
        let mut legacy18 = vec![0u8, 3u8];
        legacy18.extend_from_slice(&55i64.to_be_bytes());
        legacy18.extend_from_slice(&77i64.to_be_bytes());
        let decoded = DirectMediaRef::decode(&legacy18).unwrap();
        assert_eq!(decoded.peer_type, PeerType::Channel);
        assert_eq!(decoded.peer_id, 55);
        assert_eq!(decoded.media_id, 77);
        assert_eq!(decoded.login_user_id, 0);
        assert_eq!(decoded.message_id, 0);
        assert!(!decoded.thumbnail);

        let mut legacy19 = legacy18.clone();
        legacy19.push(1);
        assert!(DirectMediaRef::decode(&legacy19).unwrap().thumbnail);

        let mut legacy27 = vec![0u8, 2u8];
        legacy27.extend_from_slice(&9i64.to_be_bytes());
        legacy27.extend_from_slice(&10i64.to_be_bytes());
        legacy27.extend_from_slice(&11i64.to_be_bytes());
        legacy27.push(0);
        let decoded = DirectMediaRef::decode(&legacy27).unwrap();
        assert_eq!(decoded.peer_id, 9);
        assert_eq!(decoded.message_id, 10);
        assert_eq!(decoded.media_id, 11);
        assert_eq!(decoded.login_user_id, 0);
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(
            DirectMediaRef::decode(&[1, 1]),
            Err(RefDecodeError::BadVersion)
        );
        assert_eq!(
            DirectMediaRef::decode(&[0, 9]),
            Err(RefDecodeError::BadPeerType)
        );
        assert_eq!(
            DirectMediaRef::decode(&[0, 1, 2, 3]),
            Err(RefDecodeError::BadLength(4))
        );
    }
}
