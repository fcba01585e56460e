use std::{fs, sync::Arc};

use anyhow::Context;
use chrono::Local;
use minijinja::{context, AutoEscape, Environment};
use tracing::{info, warn};

use crate::{
    config::{parse_address_list, EmailConfig},
    credentials::CredentialCache,
    models::{FormFields, SubmissionRecord},
    remote::{MailMessage, Mailer},
};

const DEFAULT_TEMPLATE: &str = include_str!("../templates/confirmation_email.html");

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyOutcome {
    Sent,
    Skipped(&'static str),
    Failed(String),
}

/// Confirmation mail sent once a submission has been processed.
pub struct Notifier {
    mailer: Arc<dyn Mailer>,
    credentials: Arc<CredentialCache>,
    config: EmailConfig,
    env: Environment<'static>,
    template: String,
}

impl Notifier {
    pub fn new(
        mailer: Arc<dyn Mailer>,
        credentials: Arc<CredentialCache>,
        config: &EmailConfig,
    ) -> anyhow::Result<Self> {
        let template = match &config.template_path {
            Some(path) => fs::read_to_string(path)
                .with_context(|| format!("failed to read email template {}", path.display()))?,
            None => DEFAULT_TEMPLATE.to_string(),
        };

        let mut env = Environment::new();
        env.set_auto_escape_callback(|_| AutoEscape::Html);
        env.render_str(
            &template,
            context! {
                request_id => "",
                submitted_at => "",
                fields => FormFields::new(),
                attachment_status => "",
                attachments_saved => Vec::<String>::new(),
                attachment_error => "",
            },
        )
        .context("email template does not render")?;

        Ok(Self {
            mailer,
            credentials,
            config: config.clone(),
            env,
            template,
        })
    }

    /// Builds the message, or `None` when the record names no recipient.
    pub fn compose(&self, record: &SubmissionRecord) -> Result<Option<MailMessage>, minijinja::Error> {
        let to = record
            .fields
            .get(&self.config.recipient_field)
            .map(|raw| parse_address_list(raw))
            .unwrap_or_default();
        if to.is_empty() {
            return Ok(None);
        }

        let summary = record.attachment_summary();
        let attachment_status = if !summary.uploaded.is_empty() {
            format!("Successfully saved ({} file(s))", summary.uploaded.len())
        } else if !summary.errors.is_empty() {
            format!("Upload failed: {}", summary.error_text())
        } else if summary.pending > 0 {
            "Processing".to_string()
        } else {
            "No attachments".to_string()
        };

        let html_body = self.env.render_str(
            &self.template,
            context! {
                request_id => &record.request_id,
                submitted_at => record.timestamp.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string(),
                fields => &record.fields,
                attachment_status => attachment_status,
                attachments_saved => &summary.uploaded,
                attachment_error => summary.error_text(),
            },
        )?;

        Ok(Some(MailMessage {
            to,
            cc: self.config.cc.clone(),
            subject: self
                .config
                .subject_template
                .replace("{request_id}", &record.request_id),
            html_body,
        }))
    }

    /// Best effort: every failure is logged and reported, never raised.
    pub async fn send_confirmation(&self, record: &SubmissionRecord) -> NotifyOutcome {
        let request_id = record.request_id.as_str();
        if !self.config.enabled {
            return NotifyOutcome::Skipped("email disabled");
        }
        let Some(sender) = self.config.sender.as_deref() else {
            return NotifyOutcome::Skipped("no sender configured");
        };

        let message = match self.compose(record) {
            Ok(Some(message)) => message,
            Ok(None) => {
                info!(%request_id, "no recipient address; confirmation skipped");
                return NotifyOutcome::Skipped("no recipient");
            }
            Err(err) => {
                warn!(%request_id, error = %err, "failed to render confirmation");
                return NotifyOutcome::Failed(err.to_string());
            }
        };

        let credential = match self.credentials.get_credential().await {
            Ok(credential) => credential,
            Err(err) => return NotifyOutcome::Failed(err.to_string()),
        };

        match self
            .mailer
            .send_mail(credential.token(), sender, &message)
            .await
        {
            Ok(()) => {
                info!(
                    %request_id,
                    to = %message.to.join(";"),
                    cc = %message.cc.join(";"),
                    "confirmation sent"
                );
                NotifyOutcome::Sent
            }
            Err(err) => {
                warn!(%request_id, error = %err, "failed to send confirmation");
                NotifyOutcome::Failed(err.to_string())
            }
        }
    }
}
