// Copyright 2024 - developers of the `matrigram` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The legacy provisioning endpoints.
//!
//! Three JSON POST endpoints drive the login flow step by step, plus a
//! logout. The HTTP plumbing lives in the homeserver-facing layer;
//! these handlers only speak the request/response bodies. In-flight
//! flows are held in memory keyed by the Matrix user driving them.

use std::collections::HashMap;
use std::sync::Arc;

use grammers_client::Client;
use grammers_mtsender::SenderPool;
use grammers_session::storages::MemorySession;
use grammers_tl_types as tl;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::ids::make_login_id;
use crate::login::{LoginError, LoginFlow, LoginStep, FIELD_CODE, FIELD_PASSWORD, FIELD_PHONE};
use crate::store::{ScopedStore, StoreBackend};

#[derive(Debug, Deserialize)]
pub struct PhoneRequest {
    pub phone: String,
}

#[derive(Debug, Deserialize)]
pub struct CodeRequest {
    pub code: String,
}

#[derive(Debug, Deserialize)]
pub struct PasswordRequest {
    pub password: String,
}

/// The body every endpoint answers with.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct ProvisioningResponse {
    pub state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errcode: Option<&'static str>,
}

fn state_name(step: LoginStep) -> &'static str {
    match step {
        LoginStep::Phone => "request",
        LoginStep::Code => "code",
        LoginStep::Password => "password",
        LoginStep::Complete => "logged-in",
    }
}

fn errcode(error: &LoginError) -> &'static str {
    match error {
        LoginError::SignUpRequired => "sign_up_required",
        LoginError::InvalidCode => "phone_code_invalid",
        LoginError::CodeExpired => "phone_code_expired",
        LoginError::InvalidPassword => "password_invalid",
        LoginError::MissingField(_) => "missing_field",
        LoginError::TimedOut => "login_timed_out",
        LoginError::Cancelled => "login_cancelled",
        LoginError::Other(_) => "unknown_error",
    }
}

fn error_response(step: LoginStep, error: LoginError) -> ProvisioningResponse {
    ProvisioningResponse {
        state: state_name(step),
        message: None,
        error: Some(error.to_string()),
        errcode: Some(errcode(&error)),
    }
}

/// Holds the in-flight login flows between endpoint calls.
pub struct ProvisioningApi {
    config: Config,
    backend: Arc<dyn StoreBackend>,
    flows: tokio::sync::Mutex<HashMap<String, LoginFlow>>,
}

impl ProvisioningApi {
    pub fn new(config: Config, backend: Arc<dyn StoreBackend>) -> Self {
        Self {
            config,
            backend,
            flows: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// `POST /login/request_code`
    pub async fn request_code(
        &self,
        matrix_user: &str,
        request: PhoneRequest,
    ) -> ProvisioningResponse {
        let mut flows = self.flows.lock().await;
        if let Some(mut stale) = flows.remove(matrix_user) {
            stale.cancel().await;
        }

        let mut flow = LoginFlow::new(self.config.clone(), Arc::clone(&self.backend));
        let input = HashMap::from([(FIELD_PHONE.to_string(), request.phone)]);
        let response = match flow.submit(&input).await {
            Ok(step) => ProvisioningResponse {
                state: state_name(step),
                message: Some("Code sent".to_string()),
                error: None,
                errcode: None,
            },
            Err(error) => return error_response(flow.step(), error),
        };
        flows.insert(matrix_user.to_string(), flow);
        response
    }

    /// `POST /login/send_code`
    pub async fn send_code(
        &self,
        matrix_user: &str,
        request: CodeRequest,
    ) -> ProvisioningResponse {
        self.submit_step(matrix_user, FIELD_CODE, request.code).await
    }

    /// `POST /login/send_password`
    pub async fn send_password(
        &self,
        matrix_user: &str,
        request: PasswordRequest,
    ) -> ProvisioningResponse {
        self.submit_step(matrix_user, FIELD_PASSWORD, request.password)
            .await
    }

    async fn submit_step(
        &self,
        matrix_user: &str,
        field: &str,
        value: String,
    ) -> ProvisioningResponse {
        let mut flows = self.flows.lock().await;
        let flow = match flows.get_mut(matrix_user) {
            Some(flow) => flow,
            None => {
                return ProvisioningResponse {
                    state: "request",
                    message: None,
                    error: Some("No login in progress".to_string()),
                    errcode: Some("no_login_in_progress"),
                };
            }
        };

        let input = HashMap::from([(field.to_string(), value)]);
        let result = flow.submit(&input).await;
        let step = flow.step();
        let user_id = flow.user_id;

        match result {
            Ok(LoginStep::Complete) => {
                flows.remove(matrix_user);
                info!("provisioned login {user_id:?} for {matrix_user}");
                ProvisioningResponse {
                    state: "logged-in",
                    message: Some("Successfully logged in".to_string()),
                    error: None,
                    errcode: None,
                }
            }
            Ok(step) => ProvisioningResponse {
                state: state_name(step),
                message: None,
                error: None,
                errcode: None,
            },
            Err(error) => {
                if !error.is_transient() {
                    flows.remove(matrix_user);
                }
                error_response(step, error)
            }
        }
    }

    /// `POST /logout`
    ///
    /// Revokes the authorization server-side on a best-effort basis and
    /// always clears the persisted session.
    pub async fn logout(&self, login_user_id: i64) -> ProvisioningResponse {
        let store = ScopedStore::new(Arc::clone(&self.backend), make_login_id(login_user_id));
        if let Some(metadata) = store.login_metadata() {
            if let Some(blob) = &metadata.session {
                let session = Arc::new(MemorySession::from(blob.to_session_data()));
                let pool = SenderPool::new(Arc::clone(&session), self.config.api_id);
                let client = Client::new(&pool);
                let SenderPool { runner, .. } = pool;
                let logout = async {
                    if let Err(e) = client.invoke(&tl::functions::auth::LogOut {}).await {
                        warn!("server-side logout for {login_user_id} failed: {e}");
                    }
                    client.disconnect();
                };
                tokio::select! {
                    _ = logout => {}
                    _ = runner.run() => {}
                }
            }
            store.update_login_metadata(|m| m.session = None);
        }
        ProvisioningResponse {
            state: "request",
            message: Some("Logged out".to_string()),
            error: None,
            errcode: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_shape() {
        let response = ProvisioningResponse {
            state: "code",
            message: None,
            error: None,
            errcode: None,
        };
        assert_eq!(serde_json::to_string(&response).unwrap(), "{\"state\":\"code\"}");

        let response = error_response(LoginStep::Code, LoginError::InvalidCode);
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["state"], "code");
        assert_eq!(json["errcode"], "phone_code_invalid");
        assert!(json["error"].as_str().unwrap().contains("invalid code"));
    }

    #[test]
    fn states_cover_all_steps() {
        assert_eq!(state_name(LoginStep::Phone), "request");
        assert_eq!(state_name(LoginStep::Code), "code");
        assert_eq!(state_name(LoginStep::Password), "password");
        assert_eq!(state_name(LoginStep::Complete), "logged-in");
    }
}
