pub mod amr;
pub mod cache_records;
pub mod client;
pub mod consent;
pub mod email_token;
pub mod mfa;
pub mod mutation;
pub mod refresh_token;
pub mod signing_key;
pub mod tenant;
pub mod user;

pub use cache_records::{
    AuthorizationCodeRecord, ConsentChallenge, MfaChallenge, SessionPayload, SocialLoginCode,
    SocialState,
};
pub use client::{Client, ClientType, PROVIDER_GOOGLE, PROVIDER_PASSWORD};
pub use consent::Consent;
pub use email_token::{EmailToken, EmailTokenPurpose};
pub use mfa::{MfaTotp, RecoveryCode, TrustedDevice};
pub use mutation::{Mutation, MutationKind, MutationPayload};
pub use refresh_token::{NewRefreshToken, RefreshToken, RotateOutcome};
pub use signing_key::{KeyScope, StoredKey, StoredKeySet};
pub use tenant::{
    GoogleSettings, IssuerMode, Scope, SmtpSettings, Tenant, TenantRef, TenantSettings,
    UserFieldDef, UserFieldType,
};
pub use user::{Credential, IdentProvider, Identity, NewUser, User};
