pub mod admin;
pub mod admission;
pub mod auth;

pub use admin::admin_auth_middleware;
pub use admission::tenant_admission_middleware;
pub use auth::{bearer_token, AuthUser};
