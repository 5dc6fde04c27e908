// Copyright 2024 - developers of the `matrigram` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::fmt;

use grammers_mtsender::InvocationError;

use crate::ids::PortalKey;

/// This error occurs when a bridging operation fails.
///
/// Read-path failures (update handlers) are logged and swallowed so a
/// single bad update cannot stall the stream; write-path failures are
/// returned to the framework, which classifies them into a Matrix
/// message status (see [`crate::outgoing::errors`]).
#[derive(Debug)]
pub enum BridgeError {
    /// The underlying API call failed.
    Invocation(InvocationError),

    /// The operation waited on the connection becoming ready, but the
    /// login was stopped first.
    Cancelled,

    /// The login has no usable authorization; a fresh login flow is
    /// required before the session can connect.
    NotLoggedIn,

    /// No access hash is cached for the portal's peer and the call cannot
    /// proceed without addressing it.
    MissingAccessHash(PortalKey),

    /// An edit or reaction referenced a message the bridge has no record
    /// of. Consumers are expected to look records up by id, not rely on
    /// arrival order, so this is only an error on the write path.
    UnknownMessage(PortalKey, i32),

    /// An edit changed the number of message parts, which cannot be
    /// represented as a Matrix edit.
    PartCountChanged,

    /// A Telegram service action the converter does not understand.
    UnknownServiceAction(&'static str),

    /// The response had a shape the engine cannot interpret. Fatal to the
    /// single operation, never to the session.
    UnexpectedResponse(&'static str),

    /// A media transfer failed outside of the RPC layer.
    Media(String),
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invocation(e) => write!(f, "bridge error: {e}"),
            Self::Cancelled => write!(f, "bridge error: cancelled"),
            Self::NotLoggedIn => write!(f, "bridge error: not logged in"),
            Self::MissingAccessHash(portal) => {
                write!(f, "bridge error: no access hash for {portal}")
            }
            Self::UnknownMessage(portal, id) => {
                write!(f, "bridge error: no record of message {id} in {portal}")
            }
            Self::PartCountChanged => {
                write!(f, "bridge error: parts were added or removed in edit")
            }
            Self::UnknownServiceAction(name) => {
                write!(f, "bridge error: unhandled service action {name}")
            }
            Self::UnexpectedResponse(what) => {
                write!(f, "bridge error: unexpected response: {what}")
            }
            Self::Media(what) => write!(f, "bridge error: media transfer failed: {what}"),
        }
    }
}

impl std::error::Error for BridgeError {}

impl From<InvocationError> for BridgeError {
    fn from(error: InvocationError) -> Self {
        Self::Invocation(error)
    }
}

impl BridgeError {
    /// Matches on the name of the RPC error (case-sensitive), with the
    /// same single-asterisk wildcard the sender's error type accepts.
    ///
    /// Returns `false` for anything that is not an RPC error.
    #[inline]
    pub fn is(&self, rpc_error: &str) -> bool {
        match self {
            Self::Invocation(err) => err.is(rpc_error),
            _ => false,
        }
    }
}
