use crate::config::SmtpConfig;
use crate::models::{AccountType, Plan};
use async_trait::async_trait;
use lettre::{
    message::header::ContentType, transport::smtp::authentication::Credentials, Message,
    SmtpTransport, Transport,
};
use secrecy::ExposeSecret;
use service_core::error::AppError;
use std::sync::Mutex;
use std::time::Duration;

#[async_trait]
pub trait EmailProvider: Send + Sync {
    async fn send_welcome_email(
        &self,
        to_email: &str,
        account_type: AccountType,
        tier: Plan,
    ) -> Result<(), AppError>;
}

#[derive(Clone)]
pub struct EmailService {
    mailer: SmtpTransport,
    from_email: String,
}

impl EmailService {
    pub fn new(config: &SmtpConfig) -> Result<Self, AppError> {
        let creds = Credentials::new(
            config.user.clone(),
            config.password.expose_secret().to_string(),
        );

        let mailer = SmtpTransport::relay(&config.host)
            .map_err(|e| AppError::InternalError(anyhow::anyhow!(e.to_string())))?
            .credentials(creds)
            .port(config.port)
            .timeout(Some(Duration::from_secs(10)))
            .build();

        tracing::info!(host = %config.host, "Email service initialized");

        Ok(Self {
            mailer,
            from_email: config.from.clone(),
        })
    }

    async fn send_email(
        &self,
        to_email: &str,
        subject: &str,
        plain_body: &str,
        html_body: &str,
    ) -> Result<(), AppError> {
        let email = Message::builder()
            .from(self.from_email.parse().map_err(|e: lettre::address::AddressError| AppError::InternalError(e.into()))?)
            .to(to_email.parse().map_err(|e: lettre::address::AddressError| AppError::InternalError(e.into()))?)
            .subject(subject)
            .multipart(
                lettre::message::MultiPart::alternative()
                    .singlepart(
                        lettre::message::SinglePart::builder()
                            .header(ContentType::TEXT_PLAIN)
                            .body(plain_body.to_string()),
                    )
                    .singlepart(
                        lettre::message::SinglePart::builder()
                            .header(ContentType::TEXT_HTML)
                            .body(html_body.to_string()),
                    ),
            )
            .map_err(|e| AppError::InternalError(e.into()))?;

        // SMTP is blocking; keep it off the async workers.
        let mailer = self.mailer.clone();
        let result = tokio::task::spawn_blocking(move || mailer.send(&email))
            .await
            .map_err(|e| AppError::InternalError(e.into()))?;

        match result {
            Ok(_) => {
                tracing::info!(to = %to_email, subject = %subject, "Email sent successfully");
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e.to_string(), to = %to_email, "Failed to send email");
                Err(AppError::EmailError(e.to_string()))
            }
        }
    }
}

#[async_trait]
impl EmailProvider for EmailService {
    async fn send_welcome_email(
        &self,
        to_email: &str,
        account_type: AccountType,
        tier: Plan,
    ) -> Result<(), AppError> {
        let headline = match account_type {
            AccountType::Gift => "You've been gifted a subscription",
            AccountType::Development => "Your development account is ready",
        };

        let html_body = format!(
            r###"            <html>
                <body style="font-family: Arial, sans-serif;">
                    <h2>{}</h2>
                    <p>Your account now has the <strong>{}</strong> plan. No payment details are needed.</p>
                    <p style="color: #666; font-size: 12px;">
                        If you weren't expecting this, you can ignore this email.
                    </p>
                </body>
            </html>
            "###,
            headline, tier
        );

        let plain_body = format!(
            "{}\n\nYour account now has the {} plan. No payment details are needed.\n\nIf you weren't expecting this, you can ignore this email.",
            headline, tier
        );

        self.send_email(to_email, headline, &plain_body, &html_body)
            .await
    }
}

/// Records sends instead of delivering them.
#[derive(Default)]
pub struct MockEmailService {
    pub sent: Mutex<Vec<String>>,
    pub fail: bool,
}

impl MockEmailService {
    pub fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn sent_to(&self) -> Vec<String> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl EmailProvider for MockEmailService {
    async fn send_welcome_email(
        &self,
        to_email: &str,
        _account_type: AccountType,
        _tier: Plan,
    ) -> Result<(), AppError> {
        self.sent
            .lock()
            .map_err(|e| AppError::InternalError(anyhow::anyhow!("Mock email mutex poisoned: {}", e)))?
            .push(to_email.to_string());
        if self.fail {
            return Err(AppError::EmailError("SMTP relay unavailable".to_string()));
        }
        Ok(())
    }
}
