use std::future::Future;

use anyhow::Result;
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::{info, warn};

/// A verification code ready to go out.
#[derive(Debug, Clone)]
pub struct CodeEmail {
    pub to: String,
    pub username: Option<String>,
    pub code: String,
    pub expiry_minutes: i64,
}

impl CodeEmail {
    fn greeting(&self) -> String {
        match &self.username {
            Some(name) => format!("Hi {},", name),
            None => "Hi,".to_string(),
        }
    }

    fn text_body(&self) -> String {
        format!(
            "{}\n\nYour Hearth verification code is: {}\n\nThis code expires in {} minutes.\n\
             If you didn't request this code, someone may be trying to sign in to your account.\n",
            self.greeting(),
            self.code,
            self.expiry_minutes
        )
    }

    fn html_body(&self) -> String {
        format!(
            "<p>{}</p>\
             <p>Your Hearth verification code is:</p>\
             <p style=\"font-size:28px;font-weight:bold;letter-spacing:6px;font-family:monospace\">{}</p>\
             <p>This code expires in {} minutes.</p>\
             <p style=\"color:#888\">If you didn't request this code, someone may be trying to sign in to your account.</p>",
            self.greeting(),
            self.code,
            self.expiry_minutes
        )
    }
}

/// Transport for verification codes.
pub trait CodeMailer: Send + Sync {
    /// False for mailers that never leave the process.
    fn is_live(&self) -> bool;

    fn deliver(&self, email: &CodeEmail) -> impl Future<Output = Result<()>> + Send;
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub server: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from_email: String,
    pub from_name: String,
}

pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    /// STARTTLS on the configured port. No connection is made until the
    /// first send.
    pub fn new(config: &SmtpConfig) -> Result<Self> {
        let mut builder =
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.server)?.port(config.port);
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        let from = Mailbox::new(Some(config.from_name.clone()), config.from_email.parse()?);
        info!("SMTP mailer configured for {}:{}", config.server, config.port);

        Ok(Self {
            transport: builder.build(),
            from,
        })
    }
}

impl CodeMailer for SmtpMailer {
    fn is_live(&self) -> bool {
        true
    }

    async fn deliver(&self, email: &CodeEmail) -> Result<()> {
        let message = Message::builder()
            .from(self.from.clone())
            .to(email.to.parse()?)
            .subject("Your Hearth verification code")
            .multipart(MultiPart::alternative_plain_html(
                email.text_body(),
                email.html_body(),
            ))?;

        self.transport.send(message).await?;
        Ok(())
    }
}

/// Development mailer: writes the code to the log instead of sending it.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMailer;

impl CodeMailer for LogMailer {
    fn is_live(&self) -> bool {
        false
    }

    async fn deliver(&self, email: &CodeEmail) -> Result<()> {
        warn!(
            "[dev] verification code for {}: {}",
            email_hint(&email.to),
            email.code
        );
        Ok(())
    }
}

/// SMTP when a server is configured, otherwise the log.
pub enum ConfiguredMailer {
    Smtp(SmtpMailer),
    Log(LogMailer),
}

impl ConfiguredMailer {
    pub fn from_config(smtp: Option<&SmtpConfig>) -> Result<Self> {
        match smtp {
            Some(config) => Ok(Self::Smtp(SmtpMailer::new(config)?)),
            None => {
                warn!("No SMTP server configured; verification codes will be logged");
                Ok(Self::Log(LogMailer))
            }
        }
    }
}

impl CodeMailer for ConfiguredMailer {
    fn is_live(&self) -> bool {
        matches!(self, Self::Smtp(_))
    }

    async fn deliver(&self, email: &CodeEmail) -> Result<()> {
        match self {
            Self::Smtp(m) => m.deliver(email).await,
            Self::Log(m) => m.deliver(email).await,
        }
    }
}

/// `alice@example.com` becomes `ali***@example.com`.
pub fn email_hint(address: &str) -> String {
    match address.split_once('@') {
        Some((local, domain)) if !local.is_empty() => {
            let shown: String = local.chars().take(3).collect();
            format!("{}***@{}", shown, domain)
        }
        _ => "***".to_string(),
    }
}
