use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request};
use axum::Router;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http_body_util::BodyExt;
use serde::Serialize;
use serde_json::Value;
use tempfile::TempDir;
use tokio::sync::Mutex;
use tower::util::ServiceExt;
use transport_sync::backup::BackupStore;
use transport_sync::config::{
    AppConfig, ColumnMapping, EmailConfig, SharePointConfig, SyncConfig, TokenApiConfig,
    WriteStrategy, DEFAULT_GRAPH_BASE_URL, DEFAULT_SUBJECT_TEMPLATE,
};
use transport_sync::credentials::{CredentialCache, FetchedToken, TokenSource};
use transport_sync::error::{SyncError, SyncResult};
use transport_sync::remote::{
    cell_text, FileStorage, MailMessage, Mailer, RemoteFile, SheetSnapshot, WorkbookApi,
};
use transport_sync::routes;
use transport_sync::state::AppState;
use transport_sync::{Orchestrator, RemoteServices};
use uuid::Uuid;

pub const ADMIN_TOKEN: &str = "admin-secret";
/// Attachments whose bytes start with this marker are rejected by [`FakeDrive`].
pub const CORRUPT_MARKER: &[u8] = b"CORRUPT";

#[derive(Default)]
pub struct FakeTokenSource {
    fetches: AtomicUsize,
}

#[async_trait]
impl TokenSource for FakeTokenSource {
    async fn fetch(&self) -> SyncResult<FetchedToken> {
        let n = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(FetchedToken {
            token: format!("fake-access-token-{n}"),
            expires_in: Some(Duration::from_secs(3600)),
        })
    }
}

impl FakeTokenSource {
    #[allow(dead_code)]
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

/// Which appended rows the fake workbook refuses.
#[allow(dead_code)]
#[derive(Clone, Debug, Default)]
pub enum Rejection {
    #[default]
    None,
    All,
    AllExcept(HashSet<String>),
}

/// Table-backed workbook kept in memory; row 0 of the snapshot is the header.
pub struct FakeWorkbook {
    sheet: Mutex<SheetSnapshot>,
    rejection: Mutex<Rejection>,
    delay: Mutex<Duration>,
    fail_row_updates: AtomicBool,
}

impl FakeWorkbook {
    pub fn with_mapping(mapping: &ColumnMapping) -> Self {
        let header = mapping
            .iter()
            .map(|(_, label)| Value::String(label.to_string()))
            .collect();
        Self {
            sheet: Mutex::new(SheetSnapshot {
                rows: vec![header],
                ..Default::default()
            }),
            rejection: Mutex::new(Rejection::None),
            delay: Mutex::new(Duration::ZERO),
            fail_row_updates: AtomicBool::new(false),
        }
    }

    #[allow(dead_code)]
    pub async fn set_rejection(&self, rejection: Rejection) {
        *self.rejection.lock().await = rejection;
    }

    /// Makes in-place row updates fail while appends keep working.
    #[allow(dead_code)]
    pub fn set_fail_row_updates(&self, fail: bool) {
        self.fail_row_updates.store(fail, Ordering::SeqCst);
    }

    #[allow(dead_code)]
    pub async fn set_delay(&self, delay: Duration) {
        *self.delay.lock().await = delay;
    }

    /// Data rows as `label -> text` maps.
    #[allow(dead_code)]
    pub async fn rows(&self) -> Vec<HashMap<String, String>> {
        let sheet = self.sheet.lock().await;
        let header = sheet.header();
        sheet
            .rows
            .iter()
            .skip(1)
            .map(|row| {
                header
                    .iter()
                    .cloned()
                    .zip(row.iter().map(cell_text))
                    .collect()
            })
            .collect()
    }

    async fn pause(&self) {
        let delay = *self.delay.lock().await;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    async fn request_id_of(&self, values: &[Value]) -> String {
        let sheet = self.sheet.lock().await;
        sheet
            .header()
            .iter()
            .position(|label| label == "Request ID")
            .and_then(|index| values.get(index))
            .map(cell_text)
            .unwrap_or_default()
    }
}

#[async_trait]
impl WorkbookApi for FakeWorkbook {
    async fn table_header(&self, _token: &str) -> SyncResult<Vec<String>> {
        self.pause().await;
        Ok(self.sheet.lock().await.header())
    }

    async fn table_rows(&self, _token: &str) -> SyncResult<Vec<Vec<Value>>> {
        Ok(self.sheet.lock().await.rows.iter().skip(1).cloned().collect())
    }

    async fn append_table_row(&self, _token: &str, values: Vec<Value>) -> SyncResult<()> {
        let request_id = self.request_id_of(&values).await;
        let rejected = match &*self.rejection.lock().await {
            Rejection::None => false,
            Rejection::All => true,
            Rejection::AllExcept(allowed) => !allowed.contains(&request_id),
        };
        if rejected {
            return Err(SyncError::RemoteWrite(format!(
                "row for {request_id} rejected (500)"
            )));
        }
        self.sheet.lock().await.rows.push(values);
        Ok(())
    }

    async fn update_table_row(
        &self,
        _token: &str,
        index: usize,
        values: Vec<Value>,
    ) -> SyncResult<()> {
        if self.fail_row_updates.load(Ordering::SeqCst) {
            return Err(SyncError::RemoteWrite(format!(
                "row {index} update rejected (500)"
            )));
        }
        let mut sheet = self.sheet.lock().await;
        let row = sheet
            .rows
            .get_mut(index + 1)
            .ok_or_else(|| SyncError::RemoteWrite(format!("row {index} out of range")))?;
        *row = values;
        Ok(())
    }

    async fn download_sheet(&self, _token: &str) -> SyncResult<SheetSnapshot> {
        self.pause().await;
        Ok(self.sheet.lock().await.clone())
    }

    async fn upload_sheet(&self, _token: &str, sheet: &SheetSnapshot) -> SyncResult<()> {
        *self.sheet.lock().await = sheet.clone();
        Ok(())
    }
}

#[allow(dead_code)]
#[derive(Clone, Debug)]
pub struct StoredFile {
    pub id: String,
    pub folder: String,
    pub name: String,
    pub bytes: Bytes,
    pub content_type: String,
    pub created_at: Option<DateTime<Utc>>,
    pub is_folder: bool,
}

#[derive(Default)]
pub struct FakeDrive {
    files: Mutex<Vec<StoredFile>>,
}

#[async_trait]
impl FileStorage for FakeDrive {
    async fn upload_file(
        &self,
        _token: &str,
        folder: &str,
        name: &str,
        content: Bytes,
        content_type: &str,
    ) -> SyncResult<()> {
        if content.starts_with(CORRUPT_MARKER) {
            return Err(SyncError::Transfer {
                filename: name.to_string(),
                reason: "upload rejected (400)".to_string(),
            });
        }
        let mut files = self.files.lock().await;
        files.retain(|file| !(file.folder == folder && file.name == name));
        files.push(StoredFile {
            id: Uuid::new_v4().to_string(),
            folder: folder.to_string(),
            name: name.to_string(),
            bytes: content,
            content_type: content_type.to_string(),
            created_at: Some(Utc::now()),
            is_folder: false,
        });
        Ok(())
    }

    async fn list_files(&self, _token: &str, folder: &str) -> SyncResult<Vec<RemoteFile>> {
        let files = self.files.lock().await;
        Ok(files
            .iter()
            .filter(|file| file.folder == folder)
            .map(|file| RemoteFile {
                id: file.id.clone(),
                name: file.name.clone(),
                created_at: file.created_at,
                is_folder: file.is_folder,
            })
            .collect())
    }

    async fn delete_file(&self, _token: &str, file_id: &str) -> SyncResult<()> {
        let mut files = self.files.lock().await;
        let before = files.len();
        files.retain(|file| file.id != file_id);
        if files.len() == before {
            return Err(SyncError::RemoteWrite(format!("item {file_id} not found (404)")));
        }
        Ok(())
    }
}

impl FakeDrive {
    #[allow(dead_code)]
    pub async fn insert(&self, folder: &str, name: &str, created_at: Option<DateTime<Utc>>, is_folder: bool) {
        self.files.lock().await.push(StoredFile {
            id: Uuid::new_v4().to_string(),
            folder: folder.to_string(),
            name: name.to_string(),
            bytes: Bytes::new(),
            content_type: "application/octet-stream".to_string(),
            created_at,
            is_folder,
        });
    }

    #[allow(dead_code)]
    pub async fn files(&self) -> Vec<StoredFile> {
        self.files.lock().await.clone()
    }
}

#[derive(Default)]
pub struct FakeMailer {
    sent: Mutex<Vec<(String, MailMessage)>>,
}

#[async_trait]
impl Mailer for FakeMailer {
    async fn send_mail(&self, _token: &str, sender: &str, message: &MailMessage) -> SyncResult<()> {
        self.sent
            .lock()
            .await
            .push((sender.to_string(), message.clone()));
        Ok(())
    }
}

impl FakeMailer {
    #[allow(dead_code)]
    pub async fn sent(&self) -> Vec<(String, MailMessage)> {
        self.sent.lock().await.clone()
    }
}

pub struct TestApp {
    pub state: AppState,
    pub backup: BackupStore,
    pub tokens: Arc<FakeTokenSource>,
    pub workbook: Arc<FakeWorkbook>,
    pub drive: Arc<FakeDrive>,
    pub mailer: Arc<FakeMailer>,
    router: Router,
    _dir: TempDir,
}

impl TestApp {
    pub async fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("failed to create temp dir")?;
        let config = test_config(&dir);

        let backup = BackupStore::open(&config.backup_file, &config.spool_dir)?;
        let tokens = Arc::new(FakeTokenSource::default());
        let credentials = Arc::new(CredentialCache::new(
            Some(tokens.clone()),
            None,
            config.token.lifetime,
            config.token.refresh_margin,
        ));
        let workbook = Arc::new(FakeWorkbook::with_mapping(&config.sync.column_mapping));
        let drive = Arc::new(FakeDrive::default());
        let mailer = Arc::new(FakeMailer::default());
        let remotes = RemoteServices {
            workbook: workbook.clone(),
            storage: drive.clone(),
            mailer: mailer.clone(),
        };

        let orchestrator = Orchestrator::new(&config, backup.clone(), credentials, remotes)?;
        let state = AppState::new(config, orchestrator);
        let router = routes::create_router(state.clone());

        Ok(Self {
            state,
            backup,
            tokens,
            workbook,
            drive,
            mailer,
            router,
            _dir: dir,
        })
    }

    #[allow(dead_code)]
    pub fn attachments_folder(&self) -> String {
        self.state.config.sharepoint.attachments_folder()
    }

    #[allow(dead_code)]
    pub async fn wait_idle(&self) {
        self.state.orchestrator.wait_idle().await;
    }

    #[allow(dead_code)]
    pub async fn submit(
        &self,
        data: &str,
        attachments: &[(&str, &str, &[u8])],
        encoding: Option<&str>,
    ) -> Result<hyper::Response<Body>> {
        let boundary = format!("boundary-{}", Uuid::new_v4());
        let mut body = Vec::new();
        body.extend(format!("--{boundary}\r\n").as_bytes());
        body.extend(b"Content-Disposition: form-data; name=\"data\"\r\n\r\n");
        body.extend(data.as_bytes());
        body.extend(b"\r\n");

        for (filename, content_type, bytes) in attachments {
            body.extend(format!("--{boundary}\r\n").as_bytes());
            body.extend(
                format!(
                    "Content-Disposition: form-data; name=\"attachments\"; filename=\"{filename}\"\r\n"
                )
                .as_bytes(),
            );
            body.extend(format!("Content-Type: {content_type}\r\n\r\n").as_bytes());
            body.extend(*bytes);
            body.extend(b"\r\n");
        }
        body.extend(format!("--{boundary}--\r\n").as_bytes());

        let mut builder = Request::builder()
            .method(Method::POST)
            .uri("/api/submit")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={boundary}"),
            );
        if let Some(encoding) = encoding {
            builder = builder.header("x-data-encoding", encoding);
        }
        let request = builder.body(Body::from(body))?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    #[allow(dead_code)]
    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        payload: &T,
        token: Option<&str>,
    ) -> Result<hyper::Response<Body>> {
        let body = serde_json::to_vec(payload)?;
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(path)
            .header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let request = builder.body(Body::from(body))?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    #[allow(dead_code)]
    pub async fn post(&self, path: &str, token: Option<&str>) -> Result<hyper::Response<Body>> {
        let mut builder = Request::builder().method(Method::POST).uri(path);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let request = builder.body(Body::empty())?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    #[allow(dead_code)]
    pub async fn get(&self, path: &str, token: Option<&str>) -> Result<hyper::Response<Body>> {
        let mut builder = Request::builder().method(Method::GET).uri(path);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let request = builder.body(Body::empty())?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }
}

fn test_config(dir: &TempDir) -> AppConfig {
    AppConfig {
        server_host: "127.0.0.1".to_string(),
        server_port: 0,
        admin_token: Some(ADMIN_TOKEN.to_string()),
        cors_allowed_origin: None,
        backup_file: dir.path().join("transport_requests.jsonl"),
        spool_dir: dir.path().join("spool"),
        token: TokenApiConfig {
            url: Some("https://tokens.test/api/token".to_string()),
            email: "transport-app@example.com".to_string(),
            password: Some("secret".to_string()),
            application_name: "transport-sync-tests".to_string(),
            lifetime: Duration::from_secs(3600),
            refresh_margin: Duration::from_secs(300),
            static_token: None,
        },
        sharepoint: SharePointConfig {
            graph_base_url: DEFAULT_GRAPH_BASE_URL.to_string(),
            drive_path: "sites/test-site/drive".to_string(),
            folder_path: "Transport/Requests".to_string(),
            excel_file_name: "requests.xlsx".to_string(),
            worksheet_name: "Sheet1".to_string(),
            table_name: "Table1".to_string(),
        },
        sync: SyncConfig {
            strategy: WriteStrategy::TableAppend,
            column_mapping: ColumnMapping::transport_default(),
            max_attempts: 3,
            wait_multiplier: Duration::from_millis(10),
            upload_pool_size: 3,
            background_concurrency: 4,
            request_timeout: Duration::from_secs(5),
            retention_days: 90,
            sync_interval: Duration::from_secs(3600),
            cleanup_interval: Duration::from_secs(86400),
            initial_sync_delay: Duration::from_secs(30),
            reconcile_min_age: Duration::ZERO,
        },
        email: EmailConfig {
            enabled: true,
            sender: Some("transport-app@example.com".to_string()),
            cc: vec!["dispatch@example.com".to_string()],
            subject_template: DEFAULT_SUBJECT_TEMPLATE.to_string(),
            recipient_field: "email".to_string(),
            template_path: None,
        },
    }
}

/// A complete, valid submission payload.
#[allow(dead_code)]
pub fn valid_form(email: &str) -> Value {
    serde_json::json!({
        "deliveryNoteNumber": "DN-2024-0042",
        "truckLicensePlates": "B 123 ABC",
        "trailerLicensePlates": "B 456 DEF",
        "carrierCountry": "RO",
        "carrierTaxCode": "RO12345678",
        "carrierFullName": "Carrier SRL",
        "borderCrossing": "Nadlac",
        "borderCrossingDate": "2024-12-05",
        "email": email,
    })
}

pub async fn body_to_vec(body: Body) -> Result<Vec<u8>> {
    let collected = body.collect().await?;
    Ok(collected.to_bytes().to_vec())
}

#[allow(dead_code)]
pub async fn body_json(body: Body) -> Result<Value> {
    Ok(serde_json::from_slice(&body_to_vec(body).await?)?)
}
