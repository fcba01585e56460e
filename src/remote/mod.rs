use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::error::SyncResult;

pub mod graph;

pub use graph::GraphClient;

/// Substrings in a remote error body that mean the document is held open
/// elsewhere.
pub const LOCK_INDICATORS: &[&str] = &[
    "locked",
    "resourcelocked",
    "in use",
    "being used",
    "file is open",
    "cannotaccess",
    "cannot access",
    "cobaltlockviolation",
];

pub fn is_lock_indication(status: u16, body: &str) -> bool {
    if status == 423 {
        return true;
    }
    let body = body.to_ascii_lowercase();
    LOCK_INDICATORS
        .iter()
        .any(|indicator| body.contains(indicator))
}

/// Top-left cell of a range, zero-based.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CellOrigin {
    pub column: usize,
    pub row: usize,
}

/// Cell grid of a worksheet's used range; the first row is the header.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SheetSnapshot {
    pub rows: Vec<Vec<Value>>,
    /// Where the range sits on the worksheet; writes go back to the same cell.
    pub origin: CellOrigin,
}

impl SheetSnapshot {
    pub fn header(&self) -> Vec<String> {
        self.rows
            .first()
            .map(|row| row.iter().map(cell_text).collect())
            .unwrap_or_default()
    }

    pub fn width(&self) -> usize {
        self.rows.iter().map(Vec::len).max().unwrap_or(0)
    }
}

/// Display text of a cell as the sheet shows it.
pub fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteFile {
    pub id: String,
    pub name: String,
    pub created_at: Option<DateTime<Utc>>,
    pub is_folder: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MailMessage {
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub subject: String,
    pub html_body: String,
}

/// Spreadsheet operations. Every call carries the bearer token it should use.
#[async_trait]
pub trait WorkbookApi: Send + Sync + 'static {
    async fn table_header(&self, token: &str) -> SyncResult<Vec<String>>;

    /// Data rows of the table, without the header.
    async fn table_rows(&self, token: &str) -> SyncResult<Vec<Vec<Value>>>;

    async fn append_table_row(&self, token: &str, values: Vec<Value>) -> SyncResult<()>;

    /// `index` is zero-based over the data rows.
    async fn update_table_row(&self, token: &str, index: usize, values: Vec<Value>)
        -> SyncResult<()>;

    async fn download_sheet(&self, token: &str) -> SyncResult<SheetSnapshot>;

    async fn upload_sheet(&self, token: &str, sheet: &SheetSnapshot) -> SyncResult<()>;
}

#[async_trait]
pub trait FileStorage: Send + Sync + 'static {
    async fn upload_file(
        &self,
        token: &str,
        folder: &str,
        name: &str,
        content: Bytes,
        content_type: &str,
    ) -> SyncResult<()>;

    async fn list_files(&self, token: &str, folder: &str) -> SyncResult<Vec<RemoteFile>>;

    async fn delete_file(&self, token: &str, file_id: &str) -> SyncResult<()>;
}

#[async_trait]
pub trait Mailer: Send + Sync + 'static {
    async fn send_mail(&self, token: &str, sender: &str, message: &MailMessage) -> SyncResult<()>;
}
