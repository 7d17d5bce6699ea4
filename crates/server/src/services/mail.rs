use lettre::{
    message::header::ContentType,
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};

use crate::{
    config::Config,
    error::{AppError, Result},
};

/// Outgoing mail. Fire-and-forget at the call sites: a failed send is logged
/// and never fails the surrounding request or job.
#[derive(Clone)]
pub enum Mailer {
    Smtp {
        transport: AsyncSmtpTransport<Tokio1Executor>,
        from: String,
        public_url: String,
    },
    /// No SMTP host configured; sends are logged and dropped.
    Disabled,
}

impl Mailer {
    pub fn from_config(config: &Config) -> Result<Self> {
        let Some(host) = &config.smtp_host else {
            tracing::info!("no SMTP host configured, mail delivery disabled");
            return Ok(Mailer::Disabled);
        };

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
            .map_err(|e| AppError::Internal(format!("smtp relay: {e}")))?
            .port(config.smtp_port);

        if let (Some(user), Some(pass)) = (&config.smtp_username, &config.smtp_password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        Ok(Mailer::Smtp {
            transport: builder.build(),
            from: config.mail_from.clone(),
            public_url: config.public_url.clone(),
        })
    }

    async fn send(&self, to: &str, subject: &str, body: String) -> Result<()> {
        match self {
            Mailer::Disabled => {
                tracing::debug!(to, subject, "mail delivery disabled, dropping message");
                Ok(())
            }
            Mailer::Smtp { transport, from, .. } => {
                let message = Message::builder()
                    .from(from.parse().map_err(|e| {
                        AppError::Internal(format!("invalid from address: {e}"))
                    })?)
                    .to(to.parse().map_err(|e| {
                        AppError::Internal(format!("invalid to address: {e}"))
                    })?)
                    .subject(subject)
                    .header(ContentType::TEXT_PLAIN)
                    .body(body)
                    .map_err(|e| AppError::Internal(format!("failed to build email: {e}")))?;

                transport
                    .send(message)
                    .await
                    .map_err(|e| AppError::Internal(format!("failed to send email: {e}")))?;
                Ok(())
            }
        }
    }

    fn url(&self, path: &str) -> String {
        match self {
            Mailer::Smtp { public_url, .. } => format!("{public_url}{path}"),
            Mailer::Disabled => path.to_string(),
        }
    }

    pub async fn send_verification(&self, to: &str, token: &str) -> Result<()> {
        let link = self.url(&format!("/api/auth/verify?token={token}"));
        self.send(
            to,
            "Verify your email address",
            format!("Welcome! Confirm your email address by opening this link:\n\n{link}\n"),
        )
        .await
    }

    pub async fn send_unverified_warning(&self, to: &str, days_left: i64) -> Result<()> {
        self.send(
            to,
            "Your account is about to be deleted",
            format!(
                "Your email address was never verified. The account will be deleted \
                 in {days_left} days unless you verify it.\n"
            ),
        )
        .await
    }

    pub async fn send_email_change_authorization(&self, to: &str, token: &str) -> Result<()> {
        let link = self.url(&format!("/api/auth/email/authorize?token={token}"));
        self.send(
            to,
            "Authorize your email change",
            format!("A change of your account email was requested. Authorize it here:\n\n{link}\n"),
        )
        .await
    }

    pub async fn send_email_change_verification(&self, to: &str, token: &str) -> Result<()> {
        let link = self.url(&format!("/api/auth/email/confirm?token={token}"));
        self.send(
            to,
            "Confirm your new email address",
            format!("Confirm this address as the new email of your account:\n\n{link}\n"),
        )
        .await
    }

    pub async fn send_password_change(&self, to: &str, token: &str) -> Result<()> {
        self.send(
            to,
            "Confirm your password change",
            format!("Use this code to confirm your password change: {token}\n"),
        )
        .await
    }

    pub async fn send_member_invitation(&self, to: &str, project_name: &str) -> Result<()> {
        self.send(
            to,
            "You have been invited to a project",
            format!("You were invited to join the project \"{project_name}\".\n"),
        )
        .await
    }
}
