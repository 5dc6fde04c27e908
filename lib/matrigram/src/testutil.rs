// Copyright 2024 - developers of the `matrigram` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Helpers for unit tests that need a session client.

use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

use crate::bridge::events::BridgeEvent;
use crate::bridge::intent::{IntentError, MatrixMedia};
use crate::client::{SessionClient, SessionParams};
use crate::config::Config;
use crate::store::{MemoryStore, ScopedStore};

/// Media intent that fails every transfer; tests that exercise media
/// paths provide their own.
pub(crate) struct NoMedia;

impl MatrixMedia for NoMedia {
    fn upload<'a>(
        &'a self,
        _data: Vec<u8>,
        _mime: &'a str,
        _filename: Option<&'a str>,
    ) -> BoxFuture<'a, Result<String, IntentError>> {
        async { Err(IntentError("no media repository in tests".into())) }.boxed()
    }

    fn download<'a>(&'a self, _uri: &'a str) -> BoxFuture<'a, Result<Vec<u8>, IntentError>> {
        async { Err(IntentError("no media repository in tests".into())) }.boxed()
    }
}

pub(crate) fn make_client(
    user_id: i64,
) -> (SessionClient, mpsc::UnboundedReceiver<BridgeEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let backend = Arc::new(MemoryStore::new());
    let store = ScopedStore::new(backend, user_id.to_string());
    let client = SessionClient::new(SessionParams {
        user_id,
        config: Config::default(),
        store,
        media: Arc::new(NoMedia),
        events: tx,
    });
    (client, rx)
}

/// Drains every event currently queued.
pub(crate) fn drain(rx: &mut mpsc::UnboundedReceiver<BridgeEvent>) -> Vec<BridgeEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
