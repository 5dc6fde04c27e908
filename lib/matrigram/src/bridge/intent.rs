// Copyright 2024 - developers of the `matrigram` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::fmt;

use futures_util::future::BoxFuture;

/// Access to the Matrix media repository, provided by the framework.
///
/// Boxed futures keep the trait object-safe so one `Arc<dyn MatrixMedia>`
/// can be shared by every login.
pub trait MatrixMedia: Send + Sync {
    /// Upload bytes to the media repository, returning the `mxc://` URI.
    fn upload<'a>(
        &'a self,
        data: Vec<u8>,
        mime: &'a str,
        filename: Option<&'a str>,
    ) -> BoxFuture<'a, Result<String, IntentError>>;

    /// Download the content behind an `mxc://` URI.
    fn download<'a>(&'a self, uri: &'a str) -> BoxFuture<'a, Result<Vec<u8>, IntentError>>;
}

/// This error occurs when the Matrix homeserver rejects a media transfer.
#[derive(Debug)]
pub struct IntentError(pub String);

impl fmt::Display for IntentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "matrix media error: {}", self.0)
    }
}

impl std::error::Error for IntentError {}
