// Copyright 2024 - developers of the `matrigram` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The phased phone/code/password login flow.
//!
//! The flow owns a throwaway MTProto client bound to a fresh in-memory
//! session. Each step is driven by one `submit` call carrying the
//! current step's field; on completion the resulting authorization is
//! persisted as the login's session blob. The whole flow is bounded by
//! an absolute one-hour deadline.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use grammers_client::types::PasswordToken;
use grammers_client::{Client, InvocationError, SignInError};
use grammers_mtsender::{SenderPool, SenderPoolHandle};
use grammers_session::storages::MemorySession;
use grammers_session::Session;
use grammers_tl_types as tl;
use log::{info, warn};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::ids::make_login_id;
use crate::store::{LoginMetadata, ScopedStore, SessionBlob, StoreBackend};
use crate::util::{normalize_phone, Event};

const LOGIN_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Field ids for [`LoginFlow::submit`].
pub const FIELD_PHONE: &str = "phone";
pub const FIELD_CODE: &str = "code";
pub const FIELD_PASSWORD: &str = "password";

/// Where the flow currently is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoginStep {
    Phone,
    Code,
    Password,
    Complete,
}

impl LoginStep {
    pub fn field_id(self) -> Option<&'static str> {
        match self {
            LoginStep::Phone => Some(FIELD_PHONE),
            LoginStep::Code => Some(FIELD_CODE),
            LoginStep::Password => Some(FIELD_PASSWORD),
            LoginStep::Complete => None,
        }
    }
}

/// The error type which is returned when a login step fails.
///
/// Step errors (wrong code, wrong password) leave the flow where it is;
/// everything else is terminal.
#[derive(Debug)]
pub enum LoginError {
    /// Sign-up with an official client is required; the bridge only
    /// puppets existing accounts.
    SignUpRequired,
    InvalidCode,
    CodeExpired,
    InvalidPassword,
    /// The expected input field was missing from the submission.
    MissingField(&'static str),
    /// The one-hour window for the whole flow ran out.
    TimedOut,
    Cancelled,
    Other(InvocationError),
}

impl fmt::Display for LoginError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SignUpRequired => write!(f, "login error: account does not exist"),
            Self::InvalidCode => write!(f, "login error: invalid code"),
            Self::CodeExpired => write!(f, "login error: code expired"),
            Self::InvalidPassword => write!(f, "login error: invalid password"),
            Self::MissingField(field) => write!(f, "login error: missing field {field}"),
            Self::TimedOut => write!(f, "login error: flow timed out"),
            Self::Cancelled => write!(f, "login error: cancelled"),
            Self::Other(e) => write!(f, "login error: {e}"),
        }
    }
}

impl std::error::Error for LoginError {}

impl From<InvocationError> for LoginError {
    fn from(error: InvocationError) -> Self {
        Self::Other(error)
    }
}

impl LoginError {
    /// Whether the flow can continue from its current step.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::InvalidCode
                | Self::CodeExpired
                | Self::InvalidPassword
                | Self::MissingField(_)
        )
    }
}

struct FlowClient {
    client: Client,
    session: Arc<MemorySession>,
    handle: SenderPoolHandle,
    driver: JoinHandle<()>,
    stop: Event,
}

/// One in-flight login.
pub struct LoginFlow {
    config: Config,
    backend: Arc<dyn StoreBackend>,
    step: LoginStep,
    deadline: Instant,
    client: Option<FlowClient>,
    phone: Option<String>,
    phone_code_hash: Option<String>,
    password_token: Option<PasswordToken>,
    /// Set on completion.
    pub user_id: Option<i64>,
}

impl LoginFlow {
    pub fn new(config: Config, backend: Arc<dyn StoreBackend>) -> Self {
        Self {
            config,
            backend,
            step: LoginStep::Phone,
            deadline: Instant::now() + LOGIN_TIMEOUT,
            client: None,
            phone: None,
            phone_code_hash: None,
            password_token: None,
            user_id: None,
        }
    }

    pub fn step(&self) -> LoginStep {
        self.step
    }

    /// Drives the flow one step forward with the user's input.
    pub async fn submit(
        &mut self,
        input: &HashMap<String, String>,
    ) -> Result<LoginStep, LoginError> {
        if Instant::now() >= self.deadline {
            self.cancel().await;
            return Err(LoginError::TimedOut);
        }
        let remaining = self.deadline - Instant::now();

        let step = self.step;
        let result = tokio::time::timeout(remaining, async {
            match step {
                LoginStep::Phone => {
                    let phone = input
                        .get(FIELD_PHONE)
                        .ok_or(LoginError::MissingField(FIELD_PHONE))?;
                    self.submit_phone(phone).await
                }
                LoginStep::Code => {
                    let code = input
                        .get(FIELD_CODE)
                        .ok_or(LoginError::MissingField(FIELD_CODE))?;
                    self.submit_code(code).await
                }
                LoginStep::Password => {
                    let password = input
                        .get(FIELD_PASSWORD)
                        .ok_or(LoginError::MissingField(FIELD_PASSWORD))?;
                    self.submit_password(password).await
                }
                LoginStep::Complete => Ok(LoginStep::Complete),
            }
        })
        .await;

        match result {
            Ok(Ok(step)) => {
                self.step = step;
                Ok(step)
            }
            Ok(Err(e)) if e.is_transient() => Err(e),
            Ok(Err(e)) => {
                self.cancel().await;
                Err(e)
            }
            Err(_elapsed) => {
                self.cancel().await;
                Err(LoginError::TimedOut)
            }
        }
    }

    async fn submit_phone(&mut self, phone: &str) -> Result<LoginStep, LoginError> {
        let phone = normalize_phone(phone);
        // A retried phone step must not leak the previous client.
        self.shutdown_client().await;

        // A fresh in-memory session; only persisted once authorized.
        let session = Arc::new(MemorySession::default());
        let pool = SenderPool::new(Arc::clone(&session), self.config.api_id);
        let client = Client::new(&pool);
        let SenderPool {
            runner, handle, ..
        } = pool;

        let stop = Event::new();
        let stop_signal = stop.clone();
        let driver = tokio::spawn(async move {
            tokio::select! {
                _ = runner.run() => {}
                _ = stop_signal.wait() => {}
            }
        });
        self.client = Some(FlowClient {
            client: client.clone(),
            session: Arc::clone(&session),
            handle,
            driver,
            stop,
        });

        let request = tl::functions::auth::SendCode {
            phone_number: phone.clone(),
            api_id: self.config.api_id,
            api_hash: self.config.api_hash.clone(),
            settings: tl::types::CodeSettings {
                allow_flashcall: false,
                current_number: false,
                allow_app_hash: false,
                allow_missed_call: false,
                allow_firebase: false,
                logout_tokens: None,
                token: None,
                app_sandbox: None,
                unknown_number: false,
            }
            .into(),
        };

        use tl::enums::auth::SentCode as SC;

        let sent = match client.invoke(&request).await {
            Ok(sent) => sent,
            Err(InvocationError::Rpc(err)) if err.code == 303 => {
                // The account lives in another datacenter; follow it.
                let flow = self.client.as_ref().unwrap();
                let old_dc_id = flow.session.home_dc_id();
                let new_dc_id = err.value.unwrap_or_default() as i32;
                flow.handle.disconnect_from_dc(old_dc_id);
                flow.session.set_home_dc_id(new_dc_id);
                client.invoke(&request).await?
            }
            Err(e) => return Err(e.into()),
        };

        self.phone = Some(phone);
        match sent {
            SC::Code(code) => {
                self.phone_code_hash = Some(code.phone_code_hash);
                Ok(LoginStep::Code)
            }
            SC::Success(success) => {
                // SIM-based auto-authorization skips the code entirely.
                info!("login authorized directly from sendCode");
                self.complete(success.authorization).await
            }
            _ => Err(LoginError::Other(InvocationError::Dropped)),
        }
    }

    async fn submit_code(&mut self, code: &str) -> Result<LoginStep, LoginError> {
        let client = self.raw()?;
        let phone = self.phone.clone().ok_or(LoginError::MissingField(FIELD_PHONE))?;
        let hash = self
            .phone_code_hash
            .clone()
            .ok_or(LoginError::MissingField(FIELD_CODE))?;

        match client
            .invoke(&tl::functions::auth::SignIn {
                phone_number: phone,
                phone_code_hash: hash,
                phone_code: Some(code.to_string()),
                email_verification: None,
            })
            .await
        {
            Ok(authorization) => self.complete(authorization).await,
            Err(err) if err.is("SESSION_PASSWORD_NEEDED") => {
                let password: tl::types::account::Password = client
                    .invoke(&tl::functions::account::GetPassword {})
                    .await?
                    .into();
                self.password_token = Some(PasswordToken::new(password));
                Ok(LoginStep::Password)
            }
            Err(err) if err.is("PHONE_CODE_EXPIRED") => Err(LoginError::CodeExpired),
            Err(err) if err.is("PHONE_CODE_*") => Err(LoginError::InvalidCode),
            Err(err) => Err(err.into()),
        }
    }

    async fn submit_password(&mut self, password: &str) -> Result<LoginStep, LoginError> {
        let client = self.raw()?;
        let token = match self.password_token.take() {
            Some(token) => token,
            None => {
                let password: tl::types::account::Password = client
                    .invoke(&tl::functions::account::GetPassword {})
                    .await?
                    .into();
                PasswordToken::new(password)
            }
        };

        let retry_token = token.clone();
        match client.check_password(token, password).await {
            Ok(user) => {
                // `check_password` already resolved the authorization;
                // synthesize the record from the returned user.
                self.finish(user.bare_id(), None).await
            }
            Err(SignInError::InvalidPassword) => {
                self.password_token = Some(retry_token);
                Err(LoginError::InvalidPassword)
            }
            Err(SignInError::Other(e)) => Err(e.into()),
            Err(_) => Err(LoginError::Other(InvocationError::Dropped)),
        }
    }

    async fn complete(
        &mut self,
        authorization: tl::enums::auth::Authorization,
    ) -> Result<LoginStep, LoginError> {
        match authorization {
            tl::enums::auth::Authorization::Authorization(auth) => {
                let (user_id, phone) = match auth.user {
                    tl::enums::User::User(user) => (user.id, user.phone),
                    tl::enums::User::Empty(user) => (user.id, None),
                };
                self.finish(user_id, phone).await
            }
            tl::enums::auth::Authorization::SignUpRequired(_) => Err(LoginError::SignUpRequired),
        }
    }

    /// Persists the session blob and metadata under the new login id.
    async fn finish(&mut self, user_id: i64, phone: Option<String>) -> Result<LoginStep, LoginError> {
        let flow = self.client.as_ref().ok_or(LoginError::Cancelled)?;

        let home_dc = flow.session.home_dc_id();
        let blob = flow.session.dc_option(home_dc).and_then(|dc| {
            Some(SessionBlob {
                dc_id: dc.id,
                ipv4: dc.ipv4.to_string(),
                ipv6: dc.ipv6.to_string(),
                auth_key: {
                    use base64::Engine;
                    base64::engine::general_purpose::STANDARD_NO_PAD.encode(dc.auth_key?)
                },
            })
        });
        if blob.is_none() {
            warn!("finished login has no permanent auth key to persist");
        }

        let phone = phone
            .map(|p| normalize_phone(&p))
            .or_else(|| self.phone.clone())
            .unwrap_or_default();

        let store = ScopedStore::new(Arc::clone(&self.backend), make_login_id(user_id));
        let mut metadata = store
            .login_metadata()
            .unwrap_or_else(|| LoginMetadata::new(user_id, phone.clone()));
        metadata.phone = phone;
        metadata.session = blob;
        store.set_login_metadata(&metadata);

        info!("login flow completed for user {user_id} (dc {home_dc})");
        self.user_id = Some(user_id);
        self.shutdown_client().await;
        Ok(LoginStep::Complete)
    }

    fn raw(&self) -> Result<Client, LoginError> {
        self.client
            .as_ref()
            .map(|flow| flow.client.clone())
            .ok_or(LoginError::Cancelled)
    }

    async fn shutdown_client(&mut self) {
        if let Some(flow) = self.client.take() {
            flow.client.disconnect();
            flow.stop.set();
            let _ = flow.driver.await;
        }
    }

    /// Cancels the background client task and waits for it to exit.
    pub async fn cancel(&mut self) {
        self.shutdown_client().await;
        if self.step != LoginStep::Complete {
            self.step = LoginStep::Phone;
        }
    }
}
