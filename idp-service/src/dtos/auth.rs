use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use validator::Validate;

use crate::services::auth::{PasswordLogin, ProviderInfo, Registration};

#[derive(Debug, Deserialize, Validate)]
pub struct LoginRequest {
    /// Tenant id or slug. Only needed when the client id is not unique.
    pub tenant: Option<String>,

    #[validate(length(min = 1, message = "client_id is required"))]
    pub client_id: String,

    #[validate(length(min = 1, max = 320, message = "email is required"))]
    pub email: String,

    #[validate(length(min = 1, max = 1024, message = "password is required"))]
    pub password: String,

    pub scope: Option<String>,
}

impl From<LoginRequest> for PasswordLogin {
    fn from(req: LoginRequest) -> Self {
        PasswordLogin {
            tenant: req.tenant,
            client_id: req.client_id,
            email: req.email,
            password: req.password,
            scope: req.scope,
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct SessionLoginRequest {
    pub tenant: Option<String>,

    #[validate(length(min = 1, message = "client_id is required"))]
    pub client_id: String,

    #[validate(length(min = 1, max = 320, message = "email is required"))]
    pub email: String,

    #[validate(length(min = 1, max = 1024, message = "password is required"))]
    pub password: String,

    /// Where the browser goes once the cookie is set.
    pub return_to: Option<String>,
}

impl SessionLoginRequest {
    pub fn into_parts(self) -> (PasswordLogin, Option<String>) {
        (
            PasswordLogin {
                tenant: self.tenant,
                client_id: self.client_id,
                email: self.email,
                password: self.password,
                scope: None,
            },
            self.return_to,
        )
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct RegisterRequest {
    pub tenant: Option<String>,

    #[validate(length(min = 1, message = "client_id is required"))]
    pub client_id: String,

    #[validate(email(message = "Invalid email format"))]
    pub email: String,

    #[validate(length(min = 1, max = 1024, message = "password is required"))]
    pub password: String,

    #[serde(default)]
    pub custom_fields: Map<String, Value>,
}

impl From<RegisterRequest> for Registration {
    fn from(req: RegisterRequest) -> Self {
        Registration {
            tenant: req.tenant,
            client_id: req.client_id,
            email: req.email,
            password: req.password,
            custom_fields: req.custom_fields,
        }
    }
}

/// Body of `/auth/verify-email/start` and `/auth/forgot`.
#[derive(Debug, Deserialize, Validate)]
pub struct EmailFlowRequest {
    pub tenant: Option<String>,

    #[validate(length(min = 1, message = "client_id is required"))]
    pub client_id: String,

    #[validate(length(min = 1, max = 320, message = "email is required"))]
    pub email: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct VerifyEmailQuery {
    #[validate(length(min = 1, message = "token is required"))]
    pub token: String,

    #[validate(length(min = 1, message = "tenant is required"))]
    pub tenant: String,
}

#[derive(Debug, Serialize)]
pub struct VerifyEmailResponse {
    pub verified: bool,
    pub user_id: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ResetPasswordRequest {
    #[validate(length(min = 1, message = "tenant is required"))]
    pub tenant: String,

    #[validate(length(min = 1, message = "token is required"))]
    pub token: String,

    #[validate(length(min = 1, max = 1024, message = "new_password is required"))]
    pub new_password: String,
}

#[derive(Debug, Deserialize)]
pub struct ProvidersQuery {
    pub tenant: Option<String>,
    pub client_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ProvidersResponse {
    pub providers: Vec<ProviderInfo>,
}

#[derive(Debug, Deserialize)]
pub struct SocialStartQuery {
    pub tenant: Option<String>,
    pub client_id: String,
    pub redirect_uri: String,
}

#[derive(Debug, Deserialize)]
pub struct SocialCallbackQuery {
    pub state: Option<String>,
    pub code: Option<String>,
    /// Set by the provider when the user cancelled.
    pub error: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct SocialExchangeRequest {
    #[validate(length(min = 1, message = "login_code is required"))]
    pub login_code: String,

    #[validate(length(min = 1, message = "client_id is required"))]
    pub client_id: String,
}
