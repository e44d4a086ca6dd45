//! Services layer of the authorization server.
//!
//! Tenant and client resolution, signing keys and issuance, per-tenant
//! datastores, the short-lived cache, and the flows built on top of them.

pub mod admission;
pub mod auth;
pub mod cache;
pub mod catalog;
pub mod challenges;
pub mod client_resolver;
pub mod credentials;
pub mod crypto;
pub mod email;
pub mod error;
pub mod issuer;
pub mod keys;
pub mod mfa;
pub mod mutation_log;
pub mod oauth;
pub mod policy;
pub mod refresh;
pub mod social;
pub mod store;
pub mod tenant_resolver;
pub mod token;

pub use admission::TenantAdmission;
pub use auth::AuthService;
pub use cache::{Cache, CacheKey, MemoryCache, RedisCache, SingleUseClaim};
pub use catalog::Catalog;
pub use challenges::{ChallengeCache, ChallengeTtls};
pub use client_resolver::ClientResolver;
pub use credentials::CredentialService;
pub use crypto::SecretBox;
pub use email::{EmailProvider, EmailQueue, MockEmailService, SmtpEmailService};
pub use error::{ServiceError, ServiceResult};
pub use issuer::{AccessClaims, Issuer};
pub use keys::KeyRegistry;
pub use mfa::MfaService;
pub use mutation_log::{BroadcastMutationLog, ControlPlane, DirectMutationLog, LocalApplier, MutationLog};
pub use oauth::OAuthService;
pub use policy::PasswordPolicy;
pub use refresh::RefreshService;
pub use social::{GoogleExchange, GoogleOidc, SocialService};
pub use store::{MemoryStores, PgStores, TenantStore, TenantStores};
pub use tenant_resolver::TenantResolver;
pub use token::{TokenResponse, TokenService};
