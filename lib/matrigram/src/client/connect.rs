// Copyright 2024 - developers of the `matrigram` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Connection lifecycle of one login.

use std::sync::Arc;

use grammers_client::{Client, InvocationError, UpdatesConfiguration};
use grammers_mtsender::SenderPool;
use grammers_session::storages::MemorySession;
use grammers_tl_types as tl;
use log::{debug, info, warn};

use super::{Connection, SessionClient};
use crate::bridge::events::BridgeEvent;
use crate::errors::BridgeError;

impl SessionClient {
    /// Establishes the MTProto connection and starts the update
    /// dispatcher.
    ///
    /// The readiness event fires once the stored authorization has been
    /// verified against the server; Matrix events arriving before that
    /// block in [`SessionClient::wait_ready`]. Calling this while a
    /// connection is already live coalesces to the existing one, which
    /// is what the push-wakeup path relies on.
    pub async fn connect(&self) -> Result<(), BridgeError> {
        if self.0.connection.lock().unwrap().is_some() {
            debug!("login {} is already connected", self.0.user_id);
            return Ok(());
        }

        let metadata = self.0.store.login_metadata().ok_or(BridgeError::NotLoggedIn)?;
        let blob = metadata.session.ok_or(BridgeError::NotLoggedIn)?;

        let session = Arc::new(MemorySession::from(blob.to_session_data()));
        let pool = SenderPool::new(Arc::clone(&session), self.0.config.api_id);
        let client = Client::new(&pool);
        let SenderPool {
            runner, updates, ..
        } = pool;

        self.0.stopped.clear();
        self.0.initialized.clear();

        // The runner owns all I/O and must be polled until the login
        // disconnects; parking it on the stop event is the prescribed
        // way to keep the connection up without a foreground task.
        let stopped = self.0.stopped.clone();
        let driver = tokio::spawn(async move {
            tokio::select! {
                _ = runner.run() => {}
                _ = stopped.wait() => {}
            }
        });

        let stream = client.stream_updates(
            updates,
            UpdatesConfiguration {
                catch_up: true,
                ..Default::default()
            },
        );
        let dispatcher = tokio::spawn(self.clone().dispatch_updates(stream));

        *self.0.connection.lock().unwrap() = Some(Connection {
            client: client.clone(),
            tasks: vec![driver.abort_handle(), dispatcher.abort_handle()],
        });

        match self.check_self(&client).await {
            Ok(()) => {
                info!("login {} connected and initialised", self.0.user_id);
                self.0.initialized.set();
                Ok(())
            }
            Err(InvocationError::Rpc(rpc)) if rpc.code == 401 => {
                warn!(
                    "login {} has a dead authorization ({}); marking logged out",
                    self.0.user_id, rpc.name
                );
                self.disconnect();
                self.0.store.update_login_metadata(|m| m.session = None);
                self.emit(BridgeEvent::LoggedOut);
                Err(BridgeError::NotLoggedIn)
            }
            Err(e) => {
                self.disconnect();
                Err(e.into())
            }
        }
    }

    /// Verifies the authorization by fetching the self user, learning
    /// its entity on the way.
    async fn check_self(&self, client: &Client) -> Result<(), InvocationError> {
        let users = client
            .invoke(&tl::functions::users::GetUsers {
                id: vec![tl::enums::InputUser::UserSelf],
            })
            .await?;
        self.absorb_users(&users);
        Ok(())
    }

    /// Tears the connection down and cancels every background task.
    pub fn disconnect(&self) {
        self.0.stopped.set();
        if let Some(conn) = self.0.connection.lock().unwrap().take() {
            conn.client.disconnect();
            for task in conn.tasks {
                task.abort();
            }
            info!("login {} disconnected", self.0.user_id);
        }
    }

    /// Whether a connection is currently live.
    pub fn is_connected(&self) -> bool {
        self.0.connection.lock().unwrap().is_some()
    }

    /// Whether the stored authorization is still accepted server-side.
    pub async fn is_logged_in(&self) -> bool {
        match self.raw() {
            Ok(client) => self.check_self(&client).await.is_ok(),
            Err(_) => false,
        }
    }

    /// Sequentially drains the update stream into the converters.
    ///
    /// Conversion failures of single updates are logged and swallowed;
    /// one bad update must not stall the stream. Updates are never
    /// reordered within a portal.
    async fn dispatch_updates(
        self,
        mut stream: grammers_client::client::updates::UpdateStream,
    ) {
        loop {
            let next = tokio::select! {
                next = stream.next_raw() => next,
                _ = self.0.stopped.wait() => break,
            };
            match next {
                Ok((update, _state, _peers)) => {
                    if let Err(e) = self.handle_update(update).await {
                        warn!("login {}: dropping bad update: {e}", self.0.user_id);
                    }
                }
                Err(InvocationError::Dropped) => break,
                Err(e) => {
                    warn!("login {}: update stream error: {e}", self.0.user_id);
                }
            }
        }
        debug!("login {}: update dispatcher exited", self.0.user_id);
    }
}
