use std::{collections::HashSet, future::Future, sync::Arc, time::Duration};

use chrono::Local;
use serde_json::Value;
use tracing::{info, warn};

use crate::{
    config::{ColumnMapping, SyncConfig, WriteStrategy},
    credentials::CredentialCache,
    error::SyncResult,
    models::{AttachmentSummary, SubmissionRecord},
    remote::{cell_text, WorkbookApi},
};

pub const REQUEST_ID_FIELD: &str = "request_id";
pub const TIMESTAMP_FIELD: &str = "timestamp";
pub const HAS_ATTACHMENT_FIELD: &str = "has_attachment";
pub const ATTACHMENT_STATUS_FIELD: &str = "attachment_status";
pub const ATTACHMENT_ERROR_FIELD: &str = "attachment_error";

const ATTACHMENT_FIELDS: [&str; 3] = [
    HAS_ATTACHMENT_FIELD,
    ATTACHMENT_STATUS_FIELD,
    ATTACHMENT_ERROR_FIELD,
];

/// Lowercase alphanumerics only, so `Delivery-Note number` and
/// `DELIVERY NOTE NUMBER` compare equal.
pub fn normalize_label(label: &str) -> String {
    label
        .chars()
        .filter(|ch| ch.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

fn locate(header: &[String], label: &str) -> Option<usize> {
    let wanted = normalize_label(label);
    header
        .iter()
        .position(|column| normalize_label(column) == wanted)
}

/// Outcome of updating an existing row; a missing row is not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowUpdate {
    Updated,
    NotFound,
    Failed(String),
}

pub struct SheetSync {
    workbook: Arc<dyn WorkbookApi>,
    credentials: Arc<CredentialCache>,
    strategy: WriteStrategy,
    mapping: ColumnMapping,
    max_attempts: u32,
    wait_multiplier: Duration,
}

impl SheetSync {
    pub fn new(
        workbook: Arc<dyn WorkbookApi>,
        credentials: Arc<CredentialCache>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            workbook,
            credentials,
            strategy: config.strategy,
            mapping: config.column_mapping.clone(),
            max_attempts: config.max_attempts.max(1),
            wait_multiplier: config.wait_multiplier,
        }
    }

    /// `(label, value)` for every mapped column, in mapping order.
    pub fn row_cells(&self, record: &SubmissionRecord) -> Vec<(String, String)> {
        let summary = record.attachment_summary();
        self.mapping
            .iter()
            .map(|(field, label)| {
                let value = match field {
                    REQUEST_ID_FIELD => record.request_id.clone(),
                    TIMESTAMP_FIELD => record
                        .timestamp
                        .with_timezone(&Local)
                        .format("%Y-%m-%d %H:%M:%S")
                        .to_string(),
                    _ => attachment_cell(field, &summary)
                        .or_else(|| record.fields.get(field).cloned())
                        .unwrap_or_default(),
                };
                (label.to_string(), value)
            })
            .collect()
    }

    /// Writes the record as a new row with the configured strategy.
    pub async fn write_row(&self, record: &SubmissionRecord) -> SyncResult<()> {
        let cells = self.row_cells(record);
        let request_id = record.request_id.as_str();
        match self.strategy {
            WriteStrategy::TableAppend => {
                self.with_lock_retry(request_id, |_| self.append_table_row(request_id, &cells))
                    .await
            }
            WriteStrategy::DownloadModifyUpload => {
                self.with_lock_retry(request_id, |_| self.append_sheet_row(request_id, &cells))
                    .await
            }
        }?;
        info!(%request_id, strategy = ?self.strategy, "spreadsheet row written");
        Ok(())
    }

    /// Rewrites the attachment columns of the row holding `request_id`.
    pub async fn update_existing_row(
        &self,
        request_id: &str,
        summary: &AttachmentSummary,
    ) -> RowUpdate {
        let updates: Vec<(&str, String)> = ATTACHMENT_FIELDS
            .iter()
            .filter_map(|field| {
                let label = self.mapping.label_for(field)?;
                Some((label, attachment_cell(field, summary).unwrap_or_default()))
            })
            .collect();

        let result = match self.strategy {
            WriteStrategy::TableAppend => {
                self.with_lock_retry(request_id, |_| self.update_table_row(request_id, &updates))
                    .await
            }
            WriteStrategy::DownloadModifyUpload => {
                self.with_lock_retry(request_id, |_| self.update_sheet_row(request_id, &updates))
                    .await
            }
        };

        match result {
            Ok(true) => RowUpdate::Updated,
            Ok(false) => {
                info!(%request_id, "row not present in spreadsheet; attachment columns not updated");
                RowUpdate::NotFound
            }
            Err(err) => {
                warn!(%request_id, error = %err, "failed to update spreadsheet row");
                RowUpdate::Failed(err.to_string())
            }
        }
    }

    /// Request ids already present in the sheet.
    pub async fn existing_request_ids(&self) -> SyncResult<HashSet<String>> {
        let label = self.request_id_label();
        let token = self.credentials.get_credential().await?;
        let (header, rows) = match self.strategy {
            WriteStrategy::TableAppend => {
                let header = self.workbook.table_header(token.token()).await?;
                let rows = self.workbook.table_rows(token.token()).await?;
                (header, rows)
            }
            WriteStrategy::DownloadModifyUpload => {
                let sheet = self.workbook.download_sheet(token.token()).await?;
                let header = sheet.header();
                (header, sheet.rows.into_iter().skip(1).collect())
            }
        };

        let Some(column) = locate(&header, label) else {
            warn!(%label, "request id column missing from spreadsheet header");
            return Ok(HashSet::new());
        };
        Ok(rows
            .iter()
            .filter_map(|row| row.get(column))
            .map(cell_text)
            .filter(|id| !id.trim().is_empty())
            .collect())
    }

    fn request_id_label(&self) -> &str {
        self.mapping
            .label_for(REQUEST_ID_FIELD)
            .unwrap_or("Request ID")
    }

    /// Runs `operation` until it succeeds, fails with anything but a lock, or
    /// runs out of attempts. Attempt `n` is followed by a wait of
    /// `n × multiplier`.
    async fn with_lock_retry<T, F, Fut>(&self, request_id: &str, mut operation: F) -> SyncResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_locked() && attempt < self.max_attempts => {
                    let wait = self.wait_multiplier * attempt;
                    warn!(
                        %request_id,
                        attempt,
                        wait_secs = wait.as_secs_f64(),
                        "spreadsheet locked; retrying"
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn append_table_row(&self, request_id: &str, cells: &[(String, String)]) -> SyncResult<()> {
        let token = self.credentials.get_credential().await?;
        let header = self.workbook.table_header(token.token()).await?;
        let values = align_to_header(request_id, &header, cells);
        self.workbook
            .append_table_row(token.token(), values)
            .await
    }

    async fn append_sheet_row(&self, request_id: &str, cells: &[(String, String)]) -> SyncResult<()> {
        let token = self.credentials.get_credential().await?;
        let mut sheet = self.workbook.download_sheet(token.token()).await?;
        if sheet.rows.is_empty() {
            sheet
                .rows
                .push(cells.iter().map(|(label, _)| Value::String(label.clone())).collect());
        }
        let header = sheet.header();
        sheet.rows.push(align_to_header(request_id, &header, cells));
        self.workbook.upload_sheet(token.token(), &sheet).await
    }

    async fn update_table_row(&self, request_id: &str, updates: &[(&str, String)]) -> SyncResult<bool> {
        let token = self.credentials.get_credential().await?;
        let header = self.workbook.table_header(token.token()).await?;
        let Some(id_column) = locate(&header, self.request_id_label()) else {
            return Ok(false);
        };
        let rows = self.workbook.table_rows(token.token()).await?;
        let Some((index, row)) = find_row(&rows, id_column, request_id) else {
            return Ok(false);
        };

        let mut row = row.clone();
        row.resize(header.len(), Value::String(String::new()));
        apply_updates(&header, &mut row, updates);
        self.workbook
            .update_table_row(token.token(), index, row)
            .await?;
        Ok(true)
    }

    async fn update_sheet_row(&self, request_id: &str, updates: &[(&str, String)]) -> SyncResult<bool> {
        let token = self.credentials.get_credential().await?;
        let mut sheet = self.workbook.download_sheet(token.token()).await?;
        let header = sheet.header();
        let Some(id_column) = locate(&header, self.request_id_label()) else {
            return Ok(false);
        };
        let Some((index, _)) = find_row(&sheet.rows[1..], id_column, request_id) else {
            return Ok(false);
        };

        let row = &mut sheet.rows[index + 1];
        row.resize(header.len().max(row.len()), Value::String(String::new()));
        apply_updates(&header, row, updates);
        self.workbook.upload_sheet(token.token(), &sheet).await?;
        Ok(true)
    }
}

fn attachment_cell(field: &str, summary: &AttachmentSummary) -> Option<String> {
    match field {
        HAS_ATTACHMENT_FIELD => Some(summary.has_attachment_text().to_string()),
        ATTACHMENT_STATUS_FIELD => Some(summary.status_text().to_string()),
        ATTACHMENT_ERROR_FIELD => Some(summary.error_text()),
        _ => None,
    }
}

/// Orders `cells` by the header; headers without a mapped value stay empty and
/// values without a matching header are dropped.
fn align_to_header(request_id: &str, header: &[String], cells: &[(String, String)]) -> Vec<Value> {
    let mut row = vec![Value::String(String::new()); header.len()];
    for (label, value) in cells {
        match locate(header, label) {
            Some(index) => row[index] = Value::String(value.clone()),
            None => warn!(%request_id, column = %label, "no matching spreadsheet column; value dropped"),
        }
    }
    row
}

fn find_row<'a>(
    rows: &'a [Vec<Value>],
    id_column: usize,
    request_id: &str,
) -> Option<(usize, &'a Vec<Value>)> {
    rows.iter()
        .enumerate()
        .find(|(_, row)| row.get(id_column).map(cell_text).as_deref() == Some(request_id))
}

fn apply_updates(header: &[String], row: &mut [Value], updates: &[(&str, String)]) {
    for (label, value) in updates {
        if let Some(index) = locate(header, label) {
            if let Some(cell) = row.get_mut(index) {
                *cell = Value::String(value.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::{
        error::SyncError,
        models::{AttachmentPayload, FormFields, UploadStatus},
        remote::SheetSnapshot,
    };

    #[derive(Default)]
    struct MemoryWorkbook {
        sheet: Mutex<SheetSnapshot>,
        locked_calls: Mutex<u32>,
        downloads: Mutex<u32>,
    }

    impl MemoryWorkbook {
        fn with_header(labels: &[&str]) -> Arc<Self> {
            let workbook = Self::default();
            workbook
                .sheet
                .lock()
                .unwrap()
                .rows
                .push(labels.iter().map(|label| json!(label)).collect());
            Arc::new(workbook)
        }

        fn check_lock(&self) -> SyncResult<()> {
            let mut locked = self.locked_calls.lock().unwrap();
            if *locked > 0 {
                *locked -= 1;
                return Err(SyncError::RemoteLocked("resource locked".into()));
            }
            Ok(())
        }

        fn rows(&self) -> Vec<Vec<Value>> {
            self.sheet.lock().unwrap().rows.clone()
        }
    }

    #[async_trait]
    impl WorkbookApi for MemoryWorkbook {
        async fn table_header(&self, _token: &str) -> SyncResult<Vec<String>> {
            self.check_lock()?;
            Ok(self.sheet.lock().unwrap().header())
        }

        async fn table_rows(&self, _token: &str) -> SyncResult<Vec<Vec<Value>>> {
            Ok(self.rows().into_iter().skip(1).collect())
        }

        async fn append_table_row(&self, _token: &str, values: Vec<Value>) -> SyncResult<()> {
            self.sheet.lock().unwrap().rows.push(values);
            Ok(())
        }

        async fn update_table_row(
            &self,
            _token: &str,
            index: usize,
            values: Vec<Value>,
        ) -> SyncResult<()> {
            self.sheet.lock().unwrap().rows[index + 1] = values;
            Ok(())
        }

        async fn download_sheet(&self, _token: &str) -> SyncResult<SheetSnapshot> {
            *self.downloads.lock().unwrap() += 1;
            self.check_lock()?;
            Ok(self.sheet.lock().unwrap().clone())
        }

        async fn upload_sheet(&self, _token: &str, sheet: &SheetSnapshot) -> SyncResult<()> {
            *self.sheet.lock().unwrap() = sheet.clone();
            Ok(())
        }
    }

    fn sync_config(strategy: WriteStrategy) -> SyncConfig {
        SyncConfig {
            strategy,
            column_mapping: ColumnMapping::new([
                ("request_id", "Request ID"),
                ("deliveryNoteNumber", "Delivery note number"),
                ("carrierCountry", "Carrier Country"),
                ("has_attachment", "Has Attachment"),
                ("attachment_status", "Attachment Status"),
                ("attachment_error", "Attachment Error"),
            ]),
            max_attempts: 3,
            wait_multiplier: Duration::from_secs(2),
            upload_pool_size: 3,
            background_concurrency: 4,
            request_timeout: Duration::from_secs(30),
            retention_days: 90,
            sync_interval: Duration::from_secs(3600),
            cleanup_interval: Duration::from_secs(86400),
            initial_sync_delay: Duration::from_secs(30),
            reconcile_min_age: Duration::from_secs(300),
        }
    }

    fn sheet_sync(workbook: Arc<MemoryWorkbook>, strategy: WriteStrategy) -> SheetSync {
        let credentials = Arc::new(CredentialCache::new(
            None,
            Some("static".into()),
            Duration::from_secs(3600),
            Duration::from_secs(300),
        ));
        SheetSync::new(workbook, credentials, &sync_config(strategy))
    }

    fn record(id: &str, attachments: usize) -> SubmissionRecord {
        let mut fields = FormFields::new();
        fields.insert("deliveryNoteNumber".into(), "DN-42".into());
        fields.insert("carrierCountry".into(), "PL".into());
        fields.insert("unmappedField".into(), "ignored".into());
        let payloads: Vec<AttachmentPayload> = (0..attachments)
            .map(|i| AttachmentPayload::new(format!("f{i}.pdf"), vec![0u8; 4], None))
            .collect();
        SubmissionRecord::new(id.into(), Utc::now(), fields, &payloads)
    }

    #[test]
    fn fuzzy_labels_match() {
        let wanted = normalize_label("Delivery note number");
        for candidate in [
            "delivery-note-number",
            "DELIVERY NOTE NUMBER",
            "Delivery Note Number",
        ] {
            assert_eq!(normalize_label(candidate), wanted, "{candidate}");
        }
        assert_ne!(normalize_label("Delivery date"), wanted);
    }

    #[tokio::test]
    async fn table_append_follows_header_order() {
        let workbook = MemoryWorkbook::with_header(&[
            "CARRIER COUNTRY",
            "Notes",
            "delivery-note-number",
            "Request ID",
            "Has Attachment",
        ]);
        let sync = sheet_sync(workbook.clone(), WriteStrategy::TableAppend);

        sync.write_row(&record("REQ-1", 0)).await.unwrap();

        let rows = workbook.rows();
        assert_eq!(
            rows[1],
            vec![json!("PL"), json!(""), json!("DN-42"), json!("REQ-1"), json!("No")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_retries_locks_with_growing_waits() {
        let workbook = MemoryWorkbook::with_header(&["Request ID", "Delivery Note Number"]);
        *workbook.locked_calls.lock().unwrap() = 2;
        let sync = sheet_sync(workbook.clone(), WriteStrategy::DownloadModifyUpload);

        let started = tokio::time::Instant::now();
        sync.write_row(&record("REQ-1", 0)).await.unwrap();
        let waited = started.elapsed();

        assert_eq!(*workbook.downloads.lock().unwrap(), 3);
        assert!(waited >= Duration::from_secs(6), "waited {waited:?}");
        assert!(waited < Duration::from_secs(7), "waited {waited:?}");
        assert_eq!(workbook.rows()[1][0], json!("REQ-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_gives_up_after_max_attempts() {
        let workbook = MemoryWorkbook::with_header(&["Request ID"]);
        *workbook.locked_calls.lock().unwrap() = 5;
        let sync = sheet_sync(workbook.clone(), WriteStrategy::DownloadModifyUpload);

        let err = sync.write_row(&record("REQ-1", 0)).await.unwrap_err();
        assert!(err.is_locked());
        assert_eq!(*workbook.downloads.lock().unwrap(), 3);
        assert_eq!(workbook.rows().len(), 1);
    }

    #[tokio::test]
    async fn fallback_creates_header_on_empty_sheet() {
        let workbook = Arc::new(MemoryWorkbook::default());
        let sync = sheet_sync(workbook.clone(), WriteStrategy::DownloadModifyUpload);
        sync.write_row(&record("REQ-1", 0)).await.unwrap();

        let rows = workbook.rows();
        assert_eq!(rows[0][0], json!("Request ID"));
        assert_eq!(rows[1][0], json!("REQ-1"));
    }

    #[tokio::test]
    async fn updates_attachment_columns_of_existing_row() {
        for strategy in [WriteStrategy::TableAppend, WriteStrategy::DownloadModifyUpload] {
            let workbook = MemoryWorkbook::with_header(&[
                "Request ID",
                "Has Attachment",
                "Attachment Status",
                "Attachment Error",
            ]);
            let sync = sheet_sync(workbook.clone(), strategy);
            let mut rec = record("REQ-7", 2);
            sync.write_row(&rec).await.unwrap();
            assert_eq!(workbook.rows()[1][2], json!("Processing"));

            rec.attachments[0].upload_status = UploadStatus::Uploaded;
            rec.attachments[1].upload_status = UploadStatus::Failed;
            rec.attachments[1].error = Some("f1.pdf: timeout".into());
            let outcome = sync
                .update_existing_row("REQ-7", &rec.attachment_summary())
                .await;

            assert_eq!(outcome, RowUpdate::Updated);
            assert_eq!(
                workbook.rows()[1],
                vec![json!("REQ-7"), json!("Yes"), json!("Saved"), json!("f1.pdf: timeout")]
            );
        }
    }

    #[tokio::test]
    async fn missing_row_is_soft_failure() {
        let workbook = MemoryWorkbook::with_header(&["Request ID", "Attachment Status"]);
        let sync = sheet_sync(workbook, WriteStrategy::TableAppend);
        let outcome = sync
            .update_existing_row("REQ-404", &AttachmentSummary::default())
            .await;
        assert_eq!(outcome, RowUpdate::NotFound);
    }

    #[tokio::test]
    async fn lists_existing_request_ids() {
        let workbook = MemoryWorkbook::with_header(&["Timestamp", "request id"]);
        {
            let mut sheet = workbook.sheet.lock().unwrap();
            sheet.rows.push(vec![json!("2025-01-01"), json!("REQ-1")]);
            sheet.rows.push(vec![json!("2025-01-02"), json!("")]);
            sheet.rows.push(vec![json!("2025-01-03"), json!("REQ-3")]);
        }
        let sync = sheet_sync(workbook, WriteStrategy::DownloadModifyUpload);
        let ids = sync.existing_request_ids().await.unwrap();
        assert_eq!(ids, HashSet::from(["REQ-1".to_string(), "REQ-3".to_string()]));
    }
}
