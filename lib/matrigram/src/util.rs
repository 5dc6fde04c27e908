// Copyright 2024 - developers of the `matrigram` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::time::Duration;

use tokio::sync::watch;

/// Generate a random ID suitable for sending messages or media.
pub(crate) fn generate_random_id() -> i64 {
    let mut buffer = [0; 8];
    getrandom::getrandom(&mut buffer).expect("failed to generate random message id");
    i64::from_le_bytes(buffer)
}

/// The nonce for an outgoing send.
///
/// Matrix transaction ids that happen to be positive 64-bit decimals are
/// reused verbatim, which makes retried sends idempotent on the Telegram
/// side. Anything else gets a fresh random nonce.
pub(crate) fn random_id_from_transaction(txn_id: &str) -> i64 {
    match txn_id.parse::<i64>() {
        Ok(id) if id > 0 => id,
        _ => generate_random_id(),
    }
}

/// Strips formatting from a phone number, keeping a single leading `+`.
pub(crate) fn normalize_phone(phone: &str) -> String {
    let digits: String = phone.chars().filter(|c| c.is_ascii_digit()).collect();
    format!("+{digits}")
}

/// A one-shot broadcastable flag with cancellation-aware waits.
///
/// Used for the connection initialisation event, the takeout-accepted
/// event and the per-login stop signal. Once set it stays set; any number
/// of tasks may wait on it concurrently.
#[derive(Clone)]
pub struct Event {
    tx: watch::Sender<bool>,
}

impl Event {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn set(&self) {
        self.tx.send_replace(true);
    }

    /// Clears the flag so it can fire again. Only the takeout-accepted
    /// event uses this; the other events are one-shot for real.
    pub fn clear(&self) {
        self.tx.send_replace(false);
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    /// Waits until the flag is set.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so `changed` cannot fail.
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Waits until the flag is set or the timeout elapses.
    ///
    /// Returns `true` if the flag fired before the deadline.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_ok()
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_nonce() {
        assert_eq!(random_id_from_transaction("12345"), 12345);
        assert_ne!(random_id_from_transaction("-3"), -3);
        // Non-numeric ids must still produce something usable.
        let _ = random_id_from_transaction("m12345.67");
    }

    #[test]
    fn phone_normalization() {
        assert_eq!(normalize_phone("+1 555 123-4567"), "+15551234567");
        assert_eq!(normalize_phone("0049 (30) 1234"), "+0049301234");
    }

    #[tokio::test]
    async fn event_wakes_waiters() {
        let event = Event::new();
        let waiter = event.clone();
        let task = tokio::spawn(async move { waiter.wait().await });
        event.set();
        task.await.unwrap();
        assert!(event.is_set());
    }

    #[tokio::test]
    async fn event_timeout() {
        let event = Event::new();
        assert!(!event.wait_timeout(Duration::from_millis(10)).await);
        event.set();
        assert!(event.wait_timeout(Duration::from_millis(10)).await);
    }
}
