// Copyright 2024 - developers of the `matrigram` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Session-wide caches refreshed lazily off the API.

use std::sync::Arc;
use std::time::{Duration, Instant};

use grammers_tl_types as tl;
use log::debug;

use super::SessionClient;
use crate::errors::BridgeError;

const AVAILABLE_REACTIONS_REFRESH: Duration = Duration::from_secs(12 * 60 * 60);

/// Telegram's server-provided "app config" blob.
pub type AppConfig = Arc<serde_json::Value>;

#[derive(Default)]
pub(crate) struct AppConfigCache {
    hash: i32,
    value: Option<AppConfig>,
}

#[derive(Default)]
pub(crate) struct AvailableReactionsCache {
    hash: i32,
    fetched: Option<Instant>,
    /// Emoticons usable as plain reactions, in server order.
    emoticons: Arc<Vec<String>>,
}

fn json_to_serde(value: tl::enums::Jsonvalue) -> serde_json::Value {
    use tl::enums::Jsonvalue as J;
    match value {
        J::JsonNull => serde_json::Value::Null,
        J::JsonBool(v) => serde_json::Value::Bool(v.value),
        J::JsonNumber(v) => serde_json::Number::from_f64(v.value)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        J::JsonString(v) => serde_json::Value::String(v.value),
        J::JsonArray(v) => {
            serde_json::Value::Array(v.value.into_iter().map(json_to_serde).collect())
        }
        J::JsonObject(v) => serde_json::Value::Object(
            v.value
                .into_iter()
                .map(|pair| {
                    let pair: tl::types::JsonObjectValue = pair.into();
                    (pair.key, json_to_serde(pair.value))
                })
                .collect(),
        ),
    }
}

/// Cache accessors. Refreshes are single-flight by construction: the
/// cache mutex is held across the network call.
impl SessionClient {
    /// The server's app-config blob, refreshed with its hash.
    pub async fn app_config(&self) -> Result<AppConfig, BridgeError> {
        let mut cache = self.0.app_config.lock().await;
        let request = tl::functions::help::GetAppConfig { hash: cache.hash };
        match self.raw()?.invoke(&request).await? {
            tl::enums::help::AppConfig::Config(config) => {
                debug!("refreshed app config (hash {})", config.hash);
                cache.hash = config.hash;
                cache.value = Some(Arc::new(json_to_serde(config.config)));
            }
            tl::enums::help::AppConfig::NotModified => {}
        }
        cache
            .value
            .clone()
            .ok_or(BridgeError::UnexpectedResponse("empty app config"))
    }

    /// Emoticons the server allows as normal reactions. Refreshed every
    /// twelve hours.
    pub async fn available_reactions(&self) -> Result<Arc<Vec<String>>, BridgeError> {
        let mut cache = self.0.available_reactions.lock().await;
        let stale = match cache.fetched {
            Some(at) => at.elapsed() >= AVAILABLE_REACTIONS_REFRESH,
            None => true,
        };
        if stale {
            let request = tl::functions::messages::GetAvailableReactions { hash: cache.hash };
            match self.raw()?.invoke(&request).await? {
                tl::enums::messages::AvailableReactions::Reactions(reactions) => {
                    cache.hash = reactions.hash;
                    cache.emoticons = Arc::new(
                        reactions
                            .reactions
                            .into_iter()
                            .map(tl::types::AvailableReaction::from)
                            .filter(|r| !r.inactive)
                            .map(|r| r.reaction)
                            .collect(),
                    );
                }
                tl::enums::messages::AvailableReactions::NotModified => {}
            }
            cache.fetched = Some(Instant::now());
        }
        Ok(Arc::clone(&cache.emoticons))
    }
}
