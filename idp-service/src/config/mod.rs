use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct IdpConfig {
    pub common: core_config::Config,
    pub environment: Environment,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub issuer: IssuerConfig,
    pub storage: StorageConfig,
    pub tokens: TokenConfig,
    pub secrets: SecretsConfig,
    pub keys: KeyConfig,
    pub password_policy: PasswordPolicyConfig,
    pub google: GoogleConfig,
    pub smtp: SmtpConfig,
    pub security: SecurityConfig,
    pub rate_limit: RateLimitConfig,
    pub admission: AdmissionConfig,
    pub timeouts: TimeoutConfig,
    pub email_workers: EmailWorkerConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Prod,
}

#[derive(Debug, Clone)]
pub struct IssuerConfig {
    /// Root of every effective issuer URL. No trailing slash.
    pub base_url: String,
    /// Login, consent and MFA pages live under this URL.
    pub ui_base_url: String,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Postgres DSN template. `{tenant}` is replaced by the tenant slug; without
    /// the placeholder every tenant shares one database under its own schema.
    pub database_url: Option<SecretString>,
    pub tenant_db_max_connections: u32,
    pub redis_url: Option<SecretString>,
    pub control_plane_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct TokenConfig {
    pub access_ttl_seconds: i64,
    pub id_token_ttl_seconds: i64,
    pub refresh_ttl_seconds: i64,
    pub code_ttl_seconds: i64,
    pub session_ttl_seconds: i64,
    pub mfa_token_ttl_seconds: i64,
    pub consent_token_ttl_seconds: i64,
    pub social_code_ttl_seconds: i64,
    pub social_state_ttl_seconds: i64,
    pub email_verify_ttl_seconds: i64,
    pub password_reset_ttl_seconds: i64,
}

#[derive(Debug, Clone)]
pub struct SecretsConfig {
    /// 32 bytes (hex or base64) for TOTP secret envelopes.
    pub mfa_master_key: SecretString,
    /// 32 bytes (hex or base64) for tenant secrets and private keys at rest.
    pub secretbox_master_key: SecretString,
}

#[derive(Debug, Clone)]
pub struct KeyConfig {
    pub rotation_grace_seconds: i64,
}

#[derive(Debug, Clone)]
pub struct PasswordPolicyConfig {
    pub min_length: usize,
    pub require_upper: bool,
    pub require_lower: bool,
    pub require_digit: bool,
    pub require_symbol: bool,
    pub blacklist_path: Option<PathBuf>,
    pub argon2_memory_kib: u32,
    pub argon2_iterations: u32,
    pub argon2_parallelism: u32,
}

/// Deployment-wide Google credentials. Tenants may override them in settings.
#[derive(Debug, Clone)]
pub struct GoogleConfig {
    pub client_id: Option<String>,
    pub client_secret: Option<SecretString>,
    pub redirect_uri: Option<String>,
}

/// Deployment-wide SMTP relay. Tenants may override it in settings.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: Option<String>,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<SecretString>,
    pub from: String,
    pub starttls: bool,
}

#[derive(Debug, Clone)]
pub struct SecurityConfig {
    pub allowed_origins: Vec<String>,
    pub admin_api_key: SecretString,
    pub session_cookie_name: String,
    pub trusted_device_cookie_name: String,
    pub trusted_device_ttl_days: i64,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub login_attempts: u32,
    pub login_window_seconds: u64,
    pub register_attempts: u32,
    pub register_window_seconds: u64,
    pub forgot_attempts: u32,
    pub forgot_window_seconds: u64,
    pub mfa_attempts: u32,
    pub mfa_window_seconds: u64,
    pub global_ip_limit: u32,
    pub global_ip_window_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    pub max_inflight_per_tenant: usize,
}

#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    pub auth_seconds: u64,
    pub smtp_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct EmailWorkerConfig {
    pub workers: usize,
    pub queue_capacity: usize,
}

impl IdpConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;

        let env_str = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string());
        let environment: Environment = env_str
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let is_prod = environment == Environment::Prod;

        let base_url = get_env("ISSUER_BASE_URL", Some("http://localhost:8080"), is_prod)?
            .trim_end_matches('/')
            .to_string();

        let config = IdpConfig {
            common: common_config,
            environment: environment.clone(),
            service_name: get_env("SERVICE_NAME", Some("hellojohn"), is_prod)?,
            service_version: get_env("SERVICE_VERSION", Some(env!("CARGO_PKG_VERSION")), is_prod)?,
            log_level: get_env("LOG_LEVEL", Some("info"), is_prod)?,
            otlp_endpoint: get_optional("OTEL_EXPORTER_OTLP_ENDPOINT"),
            issuer: IssuerConfig {
                ui_base_url: get_env("UI_BASE_URL", Some("http://localhost:3000"), is_prod)?
                    .trim_end_matches('/')
                    .to_string(),
                base_url: base_url.clone(),
            },
            storage: StorageConfig {
                database_url: get_optional("DATABASE_URL").map(SecretString::new),
                tenant_db_max_connections: get_parsed("TENANT_DB_MAX_CONNECTIONS", "10")?,
                redis_url: get_optional("REDIS_URL").map(SecretString::new),
                control_plane_dir: get_optional("CONTROL_PLANE_DIR").map(PathBuf::from),
            },
            tokens: TokenConfig {
                access_ttl_seconds: get_parsed("ACCESS_TOKEN_TTL_SECONDS", "900")?,
                id_token_ttl_seconds: get_parsed("ID_TOKEN_TTL_SECONDS", "900")?,
                refresh_ttl_seconds: get_parsed("REFRESH_TOKEN_TTL_SECONDS", "2592000")?,
                code_ttl_seconds: get_parsed("AUTH_CODE_TTL_SECONDS", "600")?,
                session_ttl_seconds: get_parsed("SESSION_TTL_SECONDS", "86400")?,
                mfa_token_ttl_seconds: get_parsed("MFA_TOKEN_TTL_SECONDS", "300")?,
                consent_token_ttl_seconds: get_parsed("CONSENT_TOKEN_TTL_SECONDS", "300")?,
                social_code_ttl_seconds: get_parsed("SOCIAL_LOGIN_CODE_TTL_SECONDS", "60")?,
                social_state_ttl_seconds: get_parsed("SOCIAL_STATE_TTL_SECONDS", "600")?,
                email_verify_ttl_seconds: get_parsed("EMAIL_VERIFY_TTL_SECONDS", "172800")?,
                password_reset_ttl_seconds: get_parsed("PASSWORD_RESET_TTL_SECONDS", "3600")?,
            },
            secrets: SecretsConfig {
                mfa_master_key: SecretString::new(get_env(
                    "MFA_MASTER_KEY",
                    Some("6d66612d6465762d6d61737465722d6b65792d30303030303030303030303031"),
                    is_prod,
                )?),
                secretbox_master_key: SecretString::new(get_env(
                    "SECRETBOX_MASTER_KEY",
                    Some("7365637265742d626f782d6465762d6d61737465722d6b65792d303030303032"),
                    is_prod,
                )?),
            },
            keys: KeyConfig {
                rotation_grace_seconds: get_parsed("KEY_ROTATION_GRACE_SECONDS", "3600")?,
            },
            password_policy: PasswordPolicyConfig {
                min_length: get_parsed("PASSWORD_MIN_LENGTH", "8")?,
                require_upper: get_parsed("PASSWORD_REQUIRE_UPPER", "true")?,
                require_lower: get_parsed("PASSWORD_REQUIRE_LOWER", "true")?,
                require_digit: get_parsed("PASSWORD_REQUIRE_DIGIT", "true")?,
                require_symbol: get_parsed("PASSWORD_REQUIRE_SYMBOL", "false")?,
                blacklist_path: get_optional("PASSWORD_BLACKLIST_PATH").map(PathBuf::from),
                argon2_memory_kib: get_parsed("ARGON2_MEMORY_KIB", "19456")?,
                argon2_iterations: get_parsed("ARGON2_ITERATIONS", "2")?,
                argon2_parallelism: get_parsed("ARGON2_PARALLELISM", "1")?,
            },
            google: GoogleConfig {
                client_id: get_optional("GOOGLE_CLIENT_ID"),
                client_secret: get_optional("GOOGLE_CLIENT_SECRET").map(SecretString::new),
                redirect_uri: get_optional("GOOGLE_REDIRECT_URI"),
            },
            smtp: SmtpConfig {
                host: get_optional("SMTP_HOST"),
                port: get_parsed("SMTP_PORT", "587")?,
                username: get_optional("SMTP_USERNAME"),
                password: get_optional("SMTP_PASSWORD").map(SecretString::new),
                from: get_env("SMTP_FROM", Some("HelloJohn <no-reply@localhost>"), is_prod)?,
                starttls: get_parsed("SMTP_STARTTLS", "true")?,
            },
            security: SecurityConfig {
                allowed_origins: get_env(
                    "ALLOWED_ORIGINS",
                    Some("http://localhost:3000"),
                    is_prod,
                )?
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
                admin_api_key: SecretString::new(get_env("ADMIN_API_KEY", None, true)?),
                session_cookie_name: get_env("SESSION_COOKIE_NAME", Some("sid"), is_prod)?,
                trusted_device_cookie_name: get_env(
                    "TRUSTED_DEVICE_COOKIE_NAME",
                    Some("mfa_td"),
                    is_prod,
                )?,
                trusted_device_ttl_days: get_parsed("TRUSTED_DEVICE_TTL_DAYS", "30")?,
            },
            rate_limit: RateLimitConfig {
                login_attempts: get_parsed("RATE_LIMIT_LOGIN_ATTEMPTS", "10")?,
                login_window_seconds: get_parsed("RATE_LIMIT_LOGIN_WINDOW_SECONDS", "60")?,
                register_attempts: get_parsed("RATE_LIMIT_REGISTER_ATTEMPTS", "5")?,
                register_window_seconds: get_parsed("RATE_LIMIT_REGISTER_WINDOW_SECONDS", "3600")?,
                forgot_attempts: get_parsed("RATE_LIMIT_FORGOT_ATTEMPTS", "3")?,
                forgot_window_seconds: get_parsed("RATE_LIMIT_FORGOT_WINDOW_SECONDS", "3600")?,
                mfa_attempts: get_parsed("RATE_LIMIT_MFA_ATTEMPTS", "10")?,
                mfa_window_seconds: get_parsed("RATE_LIMIT_MFA_WINDOW_SECONDS", "60")?,
                global_ip_limit: get_parsed("RATE_LIMIT_GLOBAL_IP_LIMIT", "300")?,
                global_ip_window_seconds: get_parsed("RATE_LIMIT_GLOBAL_IP_WINDOW_SECONDS", "60")?,
            },
            admission: AdmissionConfig {
                max_inflight_per_tenant: get_parsed("TENANT_MAX_INFLIGHT", "64")?,
            },
            timeouts: TimeoutConfig {
                auth_seconds: get_parsed("AUTH_TIMEOUT_SECONDS", "5")?,
                smtp_seconds: get_parsed("SMTP_TIMEOUT_SECONDS", "30")?,
            },
            email_workers: EmailWorkerConfig {
                workers: get_parsed("EMAIL_WORKERS", "2")?,
                queue_capacity: get_parsed("EMAIL_QUEUE_CAPACITY", "256")?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.common.port == 0 {
            return Err(config_error("PORT must be greater than 0"));
        }

        let ttls = [
            ("ACCESS_TOKEN_TTL_SECONDS", self.tokens.access_ttl_seconds),
            ("ID_TOKEN_TTL_SECONDS", self.tokens.id_token_ttl_seconds),
            ("REFRESH_TOKEN_TTL_SECONDS", self.tokens.refresh_ttl_seconds),
            ("AUTH_CODE_TTL_SECONDS", self.tokens.code_ttl_seconds),
            ("SESSION_TTL_SECONDS", self.tokens.session_ttl_seconds),
            ("MFA_TOKEN_TTL_SECONDS", self.tokens.mfa_token_ttl_seconds),
            ("CONSENT_TOKEN_TTL_SECONDS", self.tokens.consent_token_ttl_seconds),
            ("SOCIAL_LOGIN_CODE_TTL_SECONDS", self.tokens.social_code_ttl_seconds),
            ("SOCIAL_STATE_TTL_SECONDS", self.tokens.social_state_ttl_seconds),
            ("EMAIL_VERIFY_TTL_SECONDS", self.tokens.email_verify_ttl_seconds),
            ("PASSWORD_RESET_TTL_SECONDS", self.tokens.password_reset_ttl_seconds),
            ("KEY_ROTATION_GRACE_SECONDS", self.keys.rotation_grace_seconds),
            ("TRUSTED_DEVICE_TTL_DAYS", self.security.trusted_device_ttl_days),
        ];
        for (name, value) in ttls {
            if value <= 0 {
                return Err(config_error(&format!("{} must be positive", name)));
            }
        }

        if self.tokens.code_ttl_seconds > 600 {
            return Err(config_error("AUTH_CODE_TTL_SECONDS must not exceed 600"));
        }

        if self.storage.tenant_db_max_connections == 0 {
            return Err(config_error("TENANT_DB_MAX_CONNECTIONS must be positive"));
        }

        if self.admission.max_inflight_per_tenant == 0 {
            return Err(config_error("TENANT_MAX_INFLIGHT must be positive"));
        }

        if self.email_workers.workers == 0 || self.email_workers.queue_capacity == 0 {
            return Err(config_error("EMAIL_WORKERS and EMAIL_QUEUE_CAPACITY must be positive"));
        }

        if self.secrets.mfa_master_key.expose_secret().trim()
            == self.secrets.secretbox_master_key.expose_secret().trim()
        {
            return Err(config_error(
                "MFA_MASTER_KEY and SECRETBOX_MASTER_KEY must be different keys",
            ));
        }

        if url::Url::parse(&self.issuer.base_url).is_err() {
            return Err(config_error("ISSUER_BASE_URL must be an absolute URL"));
        }

        if self.environment == Environment::Prod {
            if self.security.allowed_origins.iter().any(|o| o == "*") {
                return Err(config_error("Wildcard CORS origin not allowed in production"));
            }

            if !self.issuer.base_url.starts_with("https://") {
                tracing::error!("ISSUER_BASE_URL is not https in production");
            }
        }

        Ok(())
    }

    pub fn is_prod(&self) -> bool {
        self.environment == Environment::Prod
    }
}

fn config_error(msg: &str) -> AppError {
    AppError::ConfigError(anyhow::anyhow!(msg.to_string()))
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(config_error(&format!(
                    "{} is required in production but not set",
                    key
                )))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(config_error(&format!("{} is required but not set", key)))
            }
        }
    }
}

/// Numeric and boolean settings always have a default, even in production.
fn get_parsed<T>(key: &str, default: &str) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = env::var(key).unwrap_or_else(|_| default.to_string());
    raw.trim()
        .parse()
        .map_err(|e: T::Err| config_error(&format!("{} is invalid: {}", key, e)))
}

fn get_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}
