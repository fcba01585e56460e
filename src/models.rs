use std::{fmt, str::FromStr};

use bytes::Bytes;
use chrono::{DateTime, Local, Utc};
use indexmap::IndexMap;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::utils::json::double_option;

pub type FormFields = IndexMap<String, String>;

pub const REQUEST_ID_PREFIX: &str = "REQ";

/// `REQ-20251205-143012-3FA9C1`: local wall-clock time plus a random suffix.
pub fn generate_request_id(now: DateTime<Local>) -> String {
    let suffix: u32 = rand::thread_rng().gen_range(0..0x100_0000);
    format!(
        "{REQUEST_ID_PREFIX}-{}-{suffix:06X}",
        now.format("%Y%m%d-%H%M%S")
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    Synced,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Synced => "synced",
            SyncStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(SyncStatus::Pending),
            "synced" => Ok(SyncStatus::Synced),
            "failed" => Ok(SyncStatus::Failed),
            other => Err(format!("unknown sync status `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Pending,
    Uploaded,
    Failed,
}

/// Progress of a submission through the background pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStage {
    Created,
    BackedUp,
    SpreadsheetWritten,
    SpreadsheetWriteFailed,
    AttachmentsProcessed,
    Finalized,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentMeta {
    pub filename: String,
    /// Name under which the file is stored remotely and in the local spool.
    pub stored_name: String,
    pub size: u64,
    pub content_type: Option<String>,
    pub upload_status: UploadStatus,
    #[serde(default)]
    pub error: Option<String>,
}

/// Attachment as received from the intake layer.
#[derive(Debug, Clone)]
pub struct AttachmentPayload {
    pub filename: String,
    pub content: Bytes,
    pub content_type: Option<String>,
}

impl AttachmentPayload {
    pub fn new(
        filename: impl Into<String>,
        content: impl Into<Bytes>,
        content_type: Option<String>,
    ) -> Self {
        Self {
            filename: filename.into(),
            content: content.into(),
            content_type,
        }
    }
}

/// `attachment_{request_id}_{n}{.ext}` with a 1-based `n`.
pub fn stored_attachment_name(request_id: &str, index: usize, filename: &str) -> String {
    let extension = std::path::Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{ext}"))
        .unwrap_or_default();
    format!("attachment_{request_id}_{}{extension}", index + 1)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionRecord {
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub fields: FormFields,
    pub attachments: Vec<AttachmentMeta>,
    pub sync_status: SyncStatus,
    pub sync_attempts: u32,
    pub last_sync_attempt: Option<DateTime<Utc>>,
    pub stage: SubmissionStage,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub notified_at: Option<DateTime<Utc>>,
}

impl SubmissionRecord {
    pub fn new(
        request_id: String,
        timestamp: DateTime<Utc>,
        fields: FormFields,
        attachments: &[AttachmentPayload],
    ) -> Self {
        let attachments = attachments
            .iter()
            .enumerate()
            .map(|(index, payload)| AttachmentMeta {
                filename: payload.filename.clone(),
                stored_name: stored_attachment_name(&request_id, index, &payload.filename),
                size: payload.content.len() as u64,
                content_type: payload.content_type.clone(),
                upload_status: UploadStatus::Pending,
                error: None,
            })
            .collect();

        Self {
            request_id,
            timestamp,
            fields,
            attachments,
            sync_status: SyncStatus::Pending,
            sync_attempts: 0,
            last_sync_attempt: None,
            stage: SubmissionStage::Created,
            last_error: None,
            notified_at: None,
        }
    }

    pub fn attachment_summary(&self) -> AttachmentSummary {
        AttachmentSummary::from_attachments(&self.attachments)
    }

    pub fn has_retryable_attachments(&self) -> bool {
        self.attachments
            .iter()
            .any(|attachment| attachment.upload_status != UploadStatus::Uploaded)
    }
}

/// Aggregate attachment outcome as shown in the spreadsheet and the
/// confirmation message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttachmentSummary {
    pub total: usize,
    pub pending: usize,
    pub uploaded: Vec<String>,
    pub errors: Vec<String>,
}

impl AttachmentSummary {
    pub fn from_attachments(attachments: &[AttachmentMeta]) -> Self {
        let mut summary = AttachmentSummary {
            total: attachments.len(),
            ..Default::default()
        };
        for attachment in attachments {
            match attachment.upload_status {
                UploadStatus::Pending => summary.pending += 1,
                UploadStatus::Uploaded => summary.uploaded.push(attachment.stored_name.clone()),
                UploadStatus::Failed => summary.errors.push(
                    attachment
                        .error
                        .clone()
                        .unwrap_or_else(|| format!("upload failed for {}", attachment.filename)),
                ),
            }
        }
        summary
    }

    pub fn has_attachment_text(&self) -> &'static str {
        if self.total == 0 {
            "No"
        } else if self.pending > 0 {
            "Processing"
        } else if !self.uploaded.is_empty() {
            "Yes"
        } else {
            "No"
        }
    }

    pub fn status_text(&self) -> &'static str {
        if self.total == 0 {
            "None"
        } else if self.pending > 0 {
            "Processing"
        } else if !self.uploaded.is_empty() {
            "Saved"
        } else {
            "Failed"
        }
    }

    pub fn error_text(&self) -> String {
        self.errors.join("; ")
    }
}

/// Partial update of a [`SubmissionRecord`].
///
/// Every field carries an absolute value, so applying the same patch twice
/// leaves the record exactly as applying it once.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_status: Option<SyncStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_attempt: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<SubmissionStage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<AttachmentMeta>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "double_option"
    )]
    pub last_error: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notified_at: Option<DateTime<Utc>>,
}

impl RecordPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sync_status(mut self, status: SyncStatus) -> Self {
        self.sync_status = Some(status);
        self
    }

    /// Records a sync attempt: the attempt counter and its timestamp.
    pub fn attempt(mut self, attempts: u32, at: DateTime<Utc>) -> Self {
        self.sync_attempts = Some(attempts);
        self.last_sync_attempt = Some(at);
        self
    }

    pub fn stage(mut self, stage: SubmissionStage) -> Self {
        self.stage = Some(stage);
        self
    }

    pub fn attachments(mut self, attachments: Vec<AttachmentMeta>) -> Self {
        self.attachments = Some(attachments);
        self
    }

    pub fn last_error(mut self, error: Option<String>) -> Self {
        self.last_error = Some(error);
        self
    }

    pub fn notified_at(mut self, at: DateTime<Utc>) -> Self {
        self.notified_at = Some(at);
        self
    }

    pub fn apply(&self, record: &mut SubmissionRecord) {
        if let Some(status) = self.sync_status {
            record.sync_status = status;
        }
        if let Some(attempts) = self.sync_attempts {
            record.sync_attempts = record.sync_attempts.max(attempts);
        }
        if let Some(at) = self.last_sync_attempt {
            record.last_sync_attempt = Some(at);
        }
        if let Some(stage) = self.stage {
            record.stage = stage;
        }
        if let Some(attachments) = &self.attachments {
            record.attachments = attachments.clone();
        }
        if let Some(error) = &self.last_error {
            record.last_error = error.clone();
        }
        if let Some(at) = self.notified_at {
            record.notified_at = Some(at);
        }
    }
}
