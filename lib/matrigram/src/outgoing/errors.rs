// Copyright 2024 - developers of the `matrigram` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Classification of send failures into Matrix message statuses.

use grammers_client::InvocationError;

use crate::errors::BridgeError;

/// The status category the framework attaches to the Matrix event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusKind {
    /// Blocked, banned, restricted or otherwise not allowed. Permanent.
    NoPermission,
    /// The content itself cannot be delivered. Permanent.
    Unsupported,
    /// Transient; the framework may retry the event.
    Retryable,
}

#[derive(Clone, Debug)]
pub struct MessageStatus {
    pub kind: StatusKind,
    /// Permanent failures are certain; retryable ones are not.
    pub is_certain: bool,
    /// Seconds to wait before retrying, from flood-wait errors.
    pub retry_after: Option<u32>,
    pub message: String,
}

const NO_PERMISSION: &[&str] = &[
    "CHAT_WRITE_FORBIDDEN",
    "CHAT_ADMIN_REQUIRED",
    "CHAT_RESTRICTED",
    "CHAT_GUEST_SEND_FORBIDDEN",
    "USER_IS_BLOCKED",
    "USER_BANNED_IN_CHANNEL",
    "YOU_BLOCKED_USER",
    "CHAT_SEND_PLAIN_FORBIDDEN",
    "CHAT_SEND_MEDIA_FORBIDDEN",
    "CHAT_SEND_PHOTOS_FORBIDDEN",
    "CHAT_SEND_VIDEOS_FORBIDDEN",
    "CHAT_SEND_STICKERS_FORBIDDEN",
    "CHAT_SEND_GIFS_FORBIDDEN",
    "CHAT_SEND_DOCS_FORBIDDEN",
    "CHAT_SEND_VOICES_FORBIDDEN",
];

const UNSUPPORTED: &[&str] = &[
    "MESSAGE_TOO_LONG",
    "ENTITIES_TOO_LONG",
    "ENTITY_BOUNDS_INVALID",
    "MESSAGE_EMPTY",
    "MESSAGE_EDIT_TIME_EXPIRED",
    "MEDIA_INVALID",
    "MEDIA_EMPTY",
    "REACTION_INVALID",
];

/// Maps a failed write-path operation onto a Matrix message status.
pub fn classify(error: &BridgeError) -> MessageStatus {
    match error {
        BridgeError::Invocation(InvocationError::Rpc(rpc)) => {
            if NO_PERMISSION.iter().any(|name| rpc.is(name)) {
                MessageStatus {
                    kind: StatusKind::NoPermission,
                    is_certain: true,
                    retry_after: None,
                    message: rpc.name.clone(),
                }
            } else if UNSUPPORTED.iter().any(|name| rpc.is(name)) {
                MessageStatus {
                    kind: StatusKind::Unsupported,
                    is_certain: true,
                    retry_after: None,
                    message: rpc.name.clone(),
                }
            } else if rpc.is("FLOOD_WAIT") || rpc.is("FLOOD_PREMIUM_WAIT") {
                // The cooldown is honoured silently; the message is
                // delivered late rather than failed.
                MessageStatus {
                    kind: StatusKind::Retryable,
                    is_certain: false,
                    retry_after: rpc.value,
                    message: rpc.name.clone(),
                }
            } else {
                MessageStatus {
                    kind: StatusKind::Retryable,
                    is_certain: false,
                    retry_after: None,
                    message: rpc.name.clone(),
                }
            }
        }
        BridgeError::PartCountChanged | BridgeError::UnknownServiceAction(_) => MessageStatus {
            kind: StatusKind::Unsupported,
            is_certain: true,
            retry_after: None,
            message: error.to_string(),
        },
        BridgeError::MissingAccessHash(_) | BridgeError::UnknownMessage(..) => MessageStatus {
            kind: StatusKind::Unsupported,
            is_certain: true,
            retry_after: None,
            message: error.to_string(),
        },
        // Network-level failures, cancellations and everything else are
        // worth retrying once the connection recovers.
        _ => MessageStatus {
            kind: StatusKind::Retryable,
            is_certain: false,
            retry_after: None,
            message: error.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grammers_mtsender::RpcError;

    fn rpc(code: i32, name: &str, value: Option<u32>) -> BridgeError {
        BridgeError::Invocation(InvocationError::Rpc(RpcError {
            code,
            name: name.to_string(),
            value,
            caused_by: None,
        }))
    }

    #[test]
    fn permission_failures_are_certain() {
        let status = classify(&rpc(403, "CHAT_WRITE_FORBIDDEN", None));
        assert_eq!(status.kind, StatusKind::NoPermission);
        assert!(status.is_certain);
    }

    #[test]
    fn content_failures_are_unsupported() {
        for name in ["MESSAGE_TOO_LONG", "MESSAGE_EDIT_TIME_EXPIRED", "MESSAGE_EMPTY"] {
            let status = classify(&rpc(400, name, None));
            assert_eq!(status.kind, StatusKind::Unsupported, "{name}");
            assert!(status.is_certain);
        }
    }

    #[test]
    fn flood_wait_carries_delay() {
        let status = classify(&rpc(420, "FLOOD_WAIT", Some(31)));
        assert_eq!(status.kind, StatusKind::Retryable);
        assert_eq!(status.retry_after, Some(31));
        assert!(!status.is_certain);
    }

    #[test]
    fn unknown_rpc_errors_retry() {
        let status = classify(&rpc(500, "INTERNAL", None));
        assert_eq!(status.kind, StatusKind::Retryable);
    }
}
