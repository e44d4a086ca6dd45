//! Outbound email: SMTP delivery with per-tenant relays, link templates and a
//! bounded worker pool for fire-and-forget sends.

use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, MultiPart, SinglePart},
    transport::smtp::authentication::Credentials,
    Message, SmtpTransport, Transport,
};
use secrecy::{ExposeSecret, SecretString};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::crypto::SecretBox;
use super::error::{ServiceError, ServiceResult};
use crate::config::SmtpConfig;
use crate::models::{SmtpSettings, TenantRef};

#[derive(Debug, Clone)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub plain_body: String,
    pub html_body: String,
}

#[async_trait]
pub trait EmailProvider: Send + Sync {
    async fn send(&self, tenant: &TenantRef, message: &EmailMessage) -> ServiceResult<()>;
}

/// SMTP endpoint with the password already decrypted.
#[derive(Clone)]
struct SmtpRelay {
    host: String,
    port: u16,
    username: Option<String>,
    password: Option<SecretString>,
    from: String,
    starttls: bool,
}

impl SmtpRelay {
    fn from_config(config: &SmtpConfig) -> Option<Self> {
        Some(Self {
            host: config.host.clone()?,
            port: config.port,
            username: config.username.clone(),
            password: config.password.clone(),
            from: config.from.clone(),
            starttls: config.starttls,
        })
    }

    fn from_settings(settings: &SmtpSettings, secret_box: &SecretBox) -> ServiceResult<Self> {
        let password = match &settings.password_enc {
            Some(enc) => Some(SecretString::new(secret_box.open_string(enc)?)),
            None => None,
        };
        Ok(Self {
            host: settings.host.clone(),
            port: settings.port,
            username: settings.username.clone(),
            password,
            from: settings.from.clone(),
            starttls: settings.starttls,
        })
    }

    fn transport(&self, timeout: Duration) -> ServiceResult<SmtpTransport> {
        let builder = if self.starttls {
            SmtpTransport::starttls_relay(&self.host)
                .map_err(|e| ServiceError::EmailSendFailed(e.to_string()))?
        } else {
            SmtpTransport::builder_dangerous(&self.host)
        };
        let mut builder = builder.port(self.port).timeout(Some(timeout));
        if let (Some(user), Some(password)) = (&self.username, &self.password) {
            builder = builder.credentials(Credentials::new(
                user.clone(),
                password.expose_secret().clone(),
            ));
        }
        Ok(builder.build())
    }
}

/// Sends through the tenant's own relay when configured, else through the
/// deployment default.
pub struct SmtpEmailService {
    default_relay: Option<SmtpRelay>,
    secret_box: Arc<SecretBox>,
    timeout: Duration,
}

impl SmtpEmailService {
    pub fn new(config: &SmtpConfig, secret_box: Arc<SecretBox>, timeout: Duration) -> Self {
        let default_relay = SmtpRelay::from_config(config);
        match &default_relay {
            Some(relay) => tracing::info!(host = %relay.host, port = relay.port, "SMTP relay configured"),
            None => tracing::warn!("no default SMTP relay; only tenants with their own relay can send email"),
        }
        Self {
            default_relay,
            secret_box,
            timeout,
        }
    }

    fn relay_for(&self, tenant: &TenantRef) -> ServiceResult<SmtpRelay> {
        if let Some(settings) = &tenant.settings.smtp {
            return SmtpRelay::from_settings(settings, &self.secret_box);
        }
        self.default_relay
            .clone()
            .ok_or_else(|| ServiceError::EmailSendFailed("no SMTP relay configured".to_string()))
    }
}

#[async_trait]
impl EmailProvider for SmtpEmailService {
    #[tracing::instrument(skip(self, tenant, message), fields(tenant = %tenant.slug, subject = %message.subject))]
    async fn send(&self, tenant: &TenantRef, message: &EmailMessage) -> ServiceResult<()> {
        let relay = self.relay_for(tenant)?;

        let email = Message::builder()
            .from(
                relay
                    .from
                    .parse()
                    .map_err(|e: lettre::address::AddressError| ServiceError::EmailSendFailed(e.to_string()))?,
            )
            .to(message
                .to
                .parse()
                .map_err(|e: lettre::address::AddressError| ServiceError::EmailSendFailed(e.to_string()))?)
            .subject(message.subject.clone())
            .multipart(
                MultiPart::alternative()
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_PLAIN)
                            .body(message.plain_body.clone()),
                    )
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_HTML)
                            .body(message.html_body.clone()),
                    ),
            )
            .map_err(|e| ServiceError::EmailSendFailed(e.to_string()))?;

        // SmtpTransport blocks; keep it off the runtime threads.
        let mailer = relay.transport(self.timeout)?;
        let result = tokio::task::spawn_blocking(move || mailer.send(&email))
            .await
            .map_err(|e| ServiceError::Internal(e.into()))?;

        match result {
            Ok(_) => {
                tracing::info!("Email sent successfully");
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to send email");
                Err(ServiceError::EmailSendFailed(e.to_string()))
            }
        }
    }
}

/// Keeps every message instead of sending it.
#[derive(Clone, Default)]
pub struct MockEmailService {
    sent: Arc<Mutex<Vec<(String, EmailMessage)>>>,
}

impl MockEmailService {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(tenant slug, message)` pairs in send order.
    pub fn sent(&self) -> Vec<(String, EmailMessage)> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn last_to(&self, to: &str) -> Option<EmailMessage> {
        self.sent()
            .into_iter()
            .rev()
            .find(|(_, m)| m.to == to)
            .map(|(_, m)| m)
    }
}

#[async_trait]
impl EmailProvider for MockEmailService {
    async fn send(&self, tenant: &TenantRef, message: &EmailMessage) -> ServiceResult<()> {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push((tenant.slug.clone(), message.clone()));
        }
        Ok(())
    }
}

pub fn verification_email(to: &str, link: &str) -> EmailMessage {
    let html_body = format!(
        r###"<html>
    <body style="font-family: Arial, sans-serif;">
        <h2>Please verify your email</h2>
        <p>Click the link below to verify your email address:</p>
        <p>
            <a href="{link}" style="background-color: #4CAF50; color: white; padding: 14px 20px; text-decoration: none; border-radius: 4px;">
                Verify Email
            </a>
        </p>
        <p style="color: #666; font-size: 12px;">
            If you didn't request this, please ignore this email.
        </p>
    </body>
</html>
"###
    );
    let plain_body = format!(
        "Please verify your email\n\nVisit the following link to verify your email address:\n\n{}\n\nIf you didn't request this, please ignore this email.",
        link
    );
    EmailMessage {
        to: to.to_string(),
        subject: "Verify Your Email Address".to_string(),
        plain_body,
        html_body,
    }
}

pub fn password_reset_email(to: &str, link: &str) -> EmailMessage {
    let html_body = format!(
        r###"<html>
    <body style="font-family: Arial, sans-serif;">
        <h2>Password Reset Request</h2>
        <p>We received a request to reset your password. Click the link below to set a new password:</p>
        <p>
            <a href="{link}" style="background-color: #2196F3; color: white; padding: 14px 20px; text-decoration: none; border-radius: 4px;">
                Reset Password
            </a>
        </p>
        <p style="color: #666; font-size: 12px;">
            If you didn't request this, please ignore this email.
        </p>
    </body>
</html>
"###
    );
    let plain_body = format!(
        "Password Reset Request\n\nWe received a request to reset your password. Visit the following link to set a new password:\n\n{}\n\nIf you didn't request this, please ignore this email.",
        link
    );
    EmailMessage {
        to: to.to_string(),
        subject: "Reset Your Password".to_string(),
        plain_body,
        html_body,
    }
}

/// Appends `token` and `tenant` to a link base that may already carry a query.
pub fn email_link(base: &str, token: &str, tenant_slug: &str) -> String {
    let sep = if base.contains('?') { '&' } else { '?' };
    format!(
        "{}{}token={}&tenant={}",
        base,
        sep,
        urlencoding::encode(token),
        urlencoding::encode(tenant_slug)
    )
}

/// Sends with the SMTP deadline and surfaces failure to the caller.
pub async fn send_now(
    provider: &dyn EmailProvider,
    tenant: &TenantRef,
    message: &EmailMessage,
    deadline: Duration,
) -> ServiceResult<()> {
    match tokio::time::timeout(deadline, provider.send(tenant, message)).await {
        Ok(result) => result,
        Err(_) => Err(ServiceError::EmailSendFailed("SMTP deadline exceeded".to_string())),
    }
}

struct EmailJob {
    tenant: TenantRef,
    message: EmailMessage,
}

/// Bounded queue drained by a fixed set of workers. Failures are logged; the
/// token the email carries stays valid, so the user can ask again.
#[derive(Clone)]
pub struct EmailQueue {
    tx: mpsc::Sender<EmailJob>,
}

impl EmailQueue {
    pub fn start(
        provider: Arc<dyn EmailProvider>,
        workers: usize,
        capacity: usize,
        deadline: Duration,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let (tx, rx) = mpsc::channel::<EmailJob>(capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let handles = (0..workers.max(1))
            .map(|worker| {
                let rx = rx.clone();
                let provider = provider.clone();
                tokio::spawn(async move {
                    loop {
                        let job = { rx.lock().await.recv().await };
                        let Some(job) = job else { break };
                        if let Err(e) =
                            send_now(provider.as_ref(), &job.tenant, &job.message, deadline).await
                        {
                            tracing::warn!(
                                worker,
                                tenant = %job.tenant.slug,
                                subject = %job.message.subject,
                                error = %e,
                                "queued email failed"
                            );
                        }
                    }
                    tracing::debug!(worker, "email worker stopped");
                })
            })
            .collect();

        (Self { tx }, handles)
    }

    /// Never waits. A full queue drops the message with a warning.
    pub fn enqueue(&self, tenant: &TenantRef, message: EmailMessage) {
        let job = EmailJob {
            tenant: tenant.clone(),
            message,
        };
        if let Err(e) = self.tx.try_send(job) {
            tracing::warn!(tenant = %tenant.slug, error = %e, "email queue rejected message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Tenant;

    #[test]
    fn links_keep_existing_query() {
        assert_eq!(
            email_link("https://ui.example/verify", "a b", "acme"),
            "https://ui.example/verify?token=a%20b&tenant=acme"
        );
        assert_eq!(
            email_link("https://ui.example/verify?lang=en", "t", "acme"),
            "https://ui.example/verify?lang=en&token=t&tenant=acme"
        );
    }

    #[test]
    fn templates_embed_the_link() {
        let msg = password_reset_email("u@x", "https://ui.example/reset?token=t");
        assert_eq!(msg.to, "u@x");
        assert!(msg.plain_body.contains("https://ui.example/reset?token=t"));
        assert!(msg.html_body.contains("href=\"https://ui.example/reset?token=t\""));
    }

    #[tokio::test]
    async fn queue_delivers_through_workers() {
        let mock = MockEmailService::new();
        let (queue, _handles) =
            EmailQueue::start(Arc::new(mock.clone()), 2, 8, Duration::from_secs(1));
        let tenant = Tenant::new("acme", "Acme", Default::default()).to_ref();

        queue.enqueue(&tenant, verification_email("u@x", "https://l"));
        for _ in 0..50 {
            if !mock.sent().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let sent = mock.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "acme");
    }

    #[tokio::test]
    async fn missing_relay_fails_fast() {
        let config = SmtpConfig {
            host: None,
            port: 587,
            username: None,
            password: None,
            from: "HelloJohn <no-reply@localhost>".into(),
            starttls: true,
        };
        let svc = SmtpEmailService::new(
            &config,
            Arc::new(SecretBox::new(&[1u8; 32])),
            Duration::from_secs(1),
        );
        let tenant = Tenant::new("acme", "Acme", Default::default()).to_ref();
        assert!(matches!(
            svc.send(&tenant, &verification_email("u@x", "l")).await,
            Err(ServiceError::EmailSendFailed(_))
        ));
    }
}
