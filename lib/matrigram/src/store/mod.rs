// Copyright 2024 - developers of the `matrigram` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Per-login persistent cache over the bridge's database.
//!
//! The engine never talks to a database directly. It sees a namespaced
//! key/value backend provided by the framework, and the typed
//! [`ScopedStore`] facade built on top of it. Writes are idempotent and
//! last-writer-wins; reads miss silently, and callers decide whether to
//! re-resolve or fail.

mod scoped;

use std::collections::BTreeMap;
use std::sync::Mutex;

pub use scoped::{
    LoginMetadata, MessageRecord, PortalMeta, ReactionRecord, ScopedStore, SessionBlob,
};

/// Storage interface the framework implements over its database.
///
/// All methods are synchronous and infallible, mirroring how the session
/// storages of the MTProto layer behave: the engine is not equipped to
/// deal with arbitrary storage errors mid-update, so backends are
/// expected to absorb them (e.g. by write-behind batching).
pub trait StoreBackend: Send + Sync {
    /// Look up one value. Missing keys are not errors.
    fn get(&self, login: &str, namespace: &str, key: &str) -> Option<Vec<u8>>;

    /// Insert or overwrite one value.
    fn put(&self, login: &str, namespace: &str, key: &str, value: Vec<u8>);

    /// Remove one value, if present.
    fn delete(&self, login: &str, namespace: &str, key: &str);

    /// All `(key, value)` pairs under one namespace, in key order.
    fn scan(&self, login: &str, namespace: &str) -> Vec<(String, Vec<u8>)>;

    /// Every login id that has any state stored.
    fn logins(&self) -> Vec<String>;
}

/// In-memory backend used by tests and the standalone daemon.
#[derive(Default)]
pub struct MemoryStore {
    // (login, namespace) -> key -> value
    data: Mutex<BTreeMap<(String, String), BTreeMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StoreBackend for MemoryStore {
    fn get(&self, login: &str, namespace: &str, key: &str) -> Option<Vec<u8>> {
        self.data
            .lock()
            .unwrap()
            .get(&(login.to_string(), namespace.to_string()))
            .and_then(|ns| ns.get(key).cloned())
    }

    fn put(&self, login: &str, namespace: &str, key: &str, value: Vec<u8>) {
        self.data
            .lock()
            .unwrap()
            .entry((login.to_string(), namespace.to_string()))
            .or_default()
            .insert(key.to_string(), value);
    }

    fn delete(&self, login: &str, namespace: &str, key: &str) {
        if let Some(ns) = self
            .data
            .lock()
            .unwrap()
            .get_mut(&(login.to_string(), namespace.to_string()))
        {
            ns.remove(key);
        }
    }

    fn scan(&self, login: &str, namespace: &str) -> Vec<(String, Vec<u8>)> {
        self.data
            .lock()
            .unwrap()
            .get(&(login.to_string(), namespace.to_string()))
            .map(|ns| ns.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }

    fn logins(&self) -> Vec<String> {
        let mut logins: Vec<String> = self
            .data
            .lock()
            .unwrap()
            .keys()
            .map(|(login, _)| login.clone())
            .collect();
        logins.dedup();
        logins
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_writer_wins() {
        let store = MemoryStore::new();
        store.put("1", "test", "k", b"a".to_vec());
        store.put("1", "test", "k", b"b".to_vec());
        assert_eq!(store.get("1", "test", "k"), Some(b"b".to_vec()));
    }

    #[test]
    fn scoping() {
        let store = MemoryStore::new();
        store.put("1", "test", "k", b"a".to_vec());
        assert_eq!(store.get("2", "test", "k"), None);
        assert_eq!(store.get("1", "other", "k"), None);
        store.delete("1", "test", "k");
        assert_eq!(store.get("1", "test", "k"), None);
    }

    #[test]
    fn scan_is_ordered() {
        let store = MemoryStore::new();
        store.put("1", "test", "b", vec![2]);
        store.put("1", "test", "a", vec![1]);
        let keys: Vec<_> = store.scan("1", "test").into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["a", "b"]);
    }
}
