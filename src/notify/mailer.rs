//! Voucher email rendering and the outbox mailer.

use super::{Mailer, VoucherEmail};
use crate::config::SmtpConfig;
use crate::error::{Error, Result};
use crate::model::IssueSource;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Rendered plain-text email.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmailMessage {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
}

impl EmailMessage {
    /// Render the voucher email with the sender and signature from `smtp`.
    pub fn render(email: &VoucherEmail, smtp: &SmtpConfig) -> Self {
        let (subject, intro) = match &email.source {
            IssueSource::Payment { .. } => (
                "Your Wi-Fi Voucher - Payment Confirmed",
                "Thank you for your payment! Your Wi-Fi voucher is ready.",
            ),
            IssueSource::Demo => (
                "Your FREE Wi-Fi Demo Voucher",
                "Welcome! Here's your free demo Wi-Fi voucher.",
            ),
            IssueSource::Admin => ("Your Wi-Fi Voucher", "Here's your Wi-Fi voucher."),
        };

        let body = format!(
            "Hello,\n\n\
             {intro}\n\n\
             Voucher Details:\n\
             - Code: {code}\n\
             - Package: {name} ({summary})\n\n\
             How to use:\n\
             1. Connect to the Wi-Fi network\n\
             2. You'll be redirected to the login page\n\
             3. Enter your account: {to}\n\
             4. Enter your voucher code: {code}\n\n\
             The time on your voucher starts counting when you first log in.\n\n\
             Best regards,\n\
             {signature}",
            intro = intro,
            code = email.code,
            name = email.package_name,
            summary = email.package_summary,
            to = email.to,
            signature = smtp.signature,
        );

        EmailMessage {
            from: smtp.sender_email.clone(),
            to: email.to.to_string(),
            subject: subject.to_string(),
            body,
        }
    }
}

/// Mailer that renders messages and queues them for an SMTP worker.
///
/// ```
/// use voucher_ledger::config::SmtpConfig;
/// use voucher_ledger::notify::OutboxMailer;
///
/// let (mailer, mut outbox) = OutboxMailer::channel(SmtpConfig::default());
/// // spawn a task draining `outbox` into your SMTP client
/// # drop(mailer);
/// # assert!(outbox.try_recv().is_err());
/// ```
pub struct OutboxMailer {
    smtp: SmtpConfig,
    outbox: mpsc::UnboundedSender<EmailMessage>,
}

impl OutboxMailer {
    pub fn new(smtp: SmtpConfig, outbox: mpsc::UnboundedSender<EmailMessage>) -> Self {
        OutboxMailer { smtp, outbox }
    }

    /// Create a mailer together with the receiving end of its outbox.
    pub fn channel(smtp: SmtpConfig) -> (Self, mpsc::UnboundedReceiver<EmailMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(smtp, tx), rx)
    }
}

impl Mailer for OutboxMailer {
    fn send_voucher_email(&self, email: &VoucherEmail) -> Result<()> {
        let message = EmailMessage::render(email, &self.smtp);
        self.outbox.send(message).map_err(|e| {
            Error::DeliveryError(format!("mail outbox closed, dropped mail to {}", e.0.to))
        })?;
        debug!("Queued voucher email {} for {}", email.code, email.to);
        Ok(())
    }
}

/// Mailer that only logs. Default when none is configured.
#[derive(Clone, Default)]
pub struct LogMailer;

impl Mailer for LogMailer {
    fn send_voucher_email(&self, email: &VoucherEmail) -> Result<()> {
        info!(
            "Voucher {} for {} ({}) not mailed: no mailer configured",
            email.code, email.to, email.package_summary
        );
        Ok(())
    }
}
