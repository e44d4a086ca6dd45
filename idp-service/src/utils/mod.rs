pub mod password;
pub mod tokens;
pub mod validation;

pub use password::{hash_password, verify_password, HashParams, Password, PasswordHashString};
pub use tokens::{constant_time_eq, generate_opaque_token, hash_token, pkce_s256, verify_pkce};
pub use validation::{JsonOrForm, ValidatedJson};
