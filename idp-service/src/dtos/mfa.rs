use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use validator::Validate;

use crate::services::mfa::MfaFactor;

#[derive(Debug, Serialize)]
pub struct EnrollResponse {
    pub secret_base32: String,
    pub otpauth_url: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct VerifyTotpRequest {
    #[validate(length(min = 6, max = 8, message = "code must be 6 digits"))]
    pub code: String,
}

#[derive(Debug, Serialize)]
pub struct VerifyTotpResponse {
    pub enrolled: bool,
    /// Present only on the first confirmation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovery_codes: Option<Vec<String>>,
}

/// Exactly one of `code` or `recovery_code`.
#[derive(Debug, Deserialize, Validate)]
pub struct FactorInput {
    pub code: Option<String>,
    pub recovery_code: Option<String>,
}

impl FactorInput {
    pub fn factor(&self) -> Result<MfaFactor, AppError> {
        match (self.code.as_deref(), self.recovery_code.as_deref()) {
            (Some(code), None) if !code.is_empty() => Ok(MfaFactor::Totp(code.to_string())),
            (None, Some(code)) if !code.is_empty() => Ok(MfaFactor::Recovery(code.to_string())),
            _ => Err(AppError::bad_request(
                "invalid_request",
                "Provide exactly one of code or recovery_code",
            )),
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct ChallengeRequest {
    #[validate(length(min = 1, message = "mfa_token is required"))]
    pub mfa_token: String,

    #[serde(flatten)]
    pub factor: FactorInput,

    #[serde(default)]
    pub remember_device: bool,
}

#[derive(Debug, Serialize)]
pub struct RecoveryCodesResponse {
    pub recovery_codes: Vec<String>,
}
