use std::{env, fmt::Display, path::PathBuf, str::FromStr, time::Duration};

use anyhow::{anyhow, ensure, Context, Result};
use url::Url;

pub const DEFAULT_GRAPH_BASE_URL: &str = "https://graph.microsoft.com/v1.0";
pub const DEFAULT_SUBJECT_TEMPLATE: &str = "Transport Request Confirmation - {request_id}";
pub const MAX_RETENTION_DAYS: i64 = 36_500;

/// How rows reach the remote spreadsheet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteStrategy {
    /// Row insert through the workbook table API.
    TableAppend,
    /// Read the whole worksheet, change it locally, write it back.
    DownloadModifyUpload,
}

impl FromStr for WriteStrategy {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "table-append" | "table_append" | "excel-api" => Ok(WriteStrategy::TableAppend),
            "download-modify-upload" | "download_modify_upload" | "traditional" => {
                Ok(WriteStrategy::DownloadModifyUpload)
            }
            other => Err(anyhow!("unknown sheet write strategy `{other}`")),
        }
    }
}

/// Semantic field name → spreadsheet column label, in sheet order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnMapping {
    entries: Vec<(String, String)>,
}

impl ColumnMapping {
    pub fn new<I, F, L>(entries: I) -> Self
    where
        I: IntoIterator<Item = (F, L)>,
        F: Into<String>,
        L: Into<String>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|(field, label)| (field.into(), label.into()))
                .collect(),
        }
    }

    /// Mapping used by the transport registration form.
    pub fn transport_default() -> Self {
        Self::new([
            ("request_id", "Request ID"),
            ("timestamp", "Timestamp"),
            ("deliveryNoteNumber", "Delivery Note Number"),
            ("truckLicensePlates", "Truck License Plates"),
            ("trailerLicensePlates", "Trailer License Plates"),
            ("carrierCountry", "Carrier Country"),
            ("carrierTaxCode", "Carrier Tax Code"),
            ("carrierFullName", "Carrier Full Name"),
            ("borderCrossing", "Border Crossing"),
            ("borderCrossingDate", "Border Crossing Date"),
            ("email", "Email"),
            ("phoneNumber", "Phone Number"),
            ("has_attachment", "Has Attachment"),
            ("attachment_status", "Attachment Status"),
            ("attachment_error", "Attachment Error"),
        ])
    }

    /// Parses `field=Label;field=Label`.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut entries = Vec::new();
        for pair in raw.split(';').map(str::trim).filter(|pair| !pair.is_empty()) {
            let (field, label) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("column mapping entry `{pair}` must be field=Label"))?;
            let (field, label) = (field.trim(), label.trim());
            ensure!(
                !field.is_empty() && !label.is_empty(),
                "column mapping entry `{pair}` has an empty side"
            );
            entries.push((field.to_string(), label.to_string()));
        }
        ensure!(!entries.is_empty(), "column mapping must not be empty");
        Ok(Self { entries })
    }

    pub fn label_for(&self, field: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, label)| label.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(field, label)| (field.as_str(), label.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Clone, Debug)]
pub struct TokenApiConfig {
    pub url: Option<String>,
    pub email: String,
    pub password: Option<String>,
    pub application_name: String,
    pub lifetime: Duration,
    pub refresh_margin: Duration,
    pub static_token: Option<String>,
}

#[derive(Clone, Debug)]
pub struct SharePointConfig {
    pub graph_base_url: String,
    /// Drive prefix relative to the Graph base, e.g. `sites/{site-id}/drive`.
    pub drive_path: String,
    pub folder_path: String,
    pub excel_file_name: String,
    pub worksheet_name: String,
    pub table_name: String,
}

impl SharePointConfig {
    pub fn attachments_folder(&self) -> String {
        format!("{}/attachments", self.folder_path.trim_end_matches('/'))
    }
}

#[derive(Clone, Debug)]
pub struct SyncConfig {
    pub strategy: WriteStrategy,
    pub column_mapping: ColumnMapping,
    pub max_attempts: u32,
    pub wait_multiplier: Duration,
    pub upload_pool_size: usize,
    pub background_concurrency: usize,
    pub request_timeout: Duration,
    pub retention_days: i64,
    pub sync_interval: Duration,
    pub cleanup_interval: Duration,
    pub initial_sync_delay: Duration,
    pub reconcile_min_age: Duration,
}

#[derive(Clone, Debug)]
pub struct EmailConfig {
    pub enabled: bool,
    pub sender: Option<String>,
    pub cc: Vec<String>,
    pub subject_template: String,
    pub recipient_field: String,
    pub template_path: Option<PathBuf>,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub server_host: String,
    pub server_port: u16,
    pub admin_token: Option<String>,
    pub cors_allowed_origin: Option<String>,
    pub backup_file: PathBuf,
    pub spool_dir: PathBuf,
    pub token: TokenApiConfig,
    pub sharepoint: SharePointConfig,
    pub sync: SyncConfig,
    pub email: EmailConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds and validates the configuration from any key/value source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let or = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        let server_host = or("SERVER_HOST", "127.0.0.1");
        let server_port = parse_value("SERVER_PORT", &or("SERVER_PORT", "3000"))?;
        let admin_token = get("ADMIN_TOKEN");
        let cors_allowed_origin = get("CORS_ALLOWED_ORIGIN");
        let backup_file = PathBuf::from(or("BACKUP_FILE", "data/transport_requests.jsonl"));
        let spool_dir = PathBuf::from(or("SPOOL_DIR", "data/spool"));

        let token = TokenApiConfig {
            url: get("TOKEN_API_URL"),
            email: or("TOKEN_EMAIL", "transport-app@yourdomain.com"),
            password: get("TOKEN_PASSWORD"),
            application_name: or("TOKEN_APPLICATION_NAME", "transport-sync"),
            lifetime: minutes(parse_value(
                "TOKEN_LIFETIME_MINUTES",
                &or("TOKEN_LIFETIME_MINUTES", "60"),
            )?),
            refresh_margin: Duration::from_secs(parse_value(
                "TOKEN_REFRESH_MARGIN_SECONDS",
                &or("TOKEN_REFRESH_MARGIN_SECONDS", "300"),
            )?),
            static_token: get("STATIC_ACCESS_TOKEN"),
        };

        let sharepoint = SharePointConfig {
            graph_base_url: or("GRAPH_BASE_URL", DEFAULT_GRAPH_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            drive_path: get("SHAREPOINT_DRIVE_PATH").context("SHAREPOINT_DRIVE_PATH must be set")?,
            folder_path: get("SHAREPOINT_FOLDER_PATH")
                .context("SHAREPOINT_FOLDER_PATH must be set")?,
            excel_file_name: get("EXCEL_FILE_NAME").context("EXCEL_FILE_NAME must be set")?,
            worksheet_name: or("WORKSHEET_NAME", "Sheet1"),
            table_name: or("EXCEL_TABLE_NAME", "Table1"),
        };

        let column_mapping = match get("SHEET_COLUMN_MAP") {
            Some(raw) => ColumnMapping::parse(&raw).context("SHEET_COLUMN_MAP is invalid")?,
            None => ColumnMapping::transport_default(),
        };

        let sync = SyncConfig {
            strategy: or("SHEET_WRITE_STRATEGY", "table-append")
                .parse()
                .context("SHEET_WRITE_STRATEGY is invalid")?,
            column_mapping,
            max_attempts: parse_value("RETRY_MAX_ATTEMPTS", &or("RETRY_MAX_ATTEMPTS", "3"))?,
            wait_multiplier: Duration::from_secs(parse_value(
                "RETRY_WAIT_MULTIPLIER_SECONDS",
                &or("RETRY_WAIT_MULTIPLIER_SECONDS", "2"),
            )?),
            upload_pool_size: parse_value("UPLOAD_POOL_SIZE", &or("UPLOAD_POOL_SIZE", "3"))?,
            background_concurrency: parse_value(
                "BACKGROUND_CONCURRENCY",
                &or("BACKGROUND_CONCURRENCY", "8"),
            )?,
            request_timeout: Duration::from_secs(parse_value(
                "REQUEST_TIMEOUT_SECONDS",
                &or("REQUEST_TIMEOUT_SECONDS", "30"),
            )?),
            retention_days: parse_value(
                "ATTACHMENT_RETENTION_DAYS",
                &or("ATTACHMENT_RETENTION_DAYS", "90"),
            )?,
            sync_interval: minutes(parse_value(
                "SYNC_INTERVAL_MINUTES",
                &or("SYNC_INTERVAL_MINUTES", "60"),
            )?),
            cleanup_interval: minutes(parse_value(
                "CLEANUP_INTERVAL_MINUTES",
                &or("CLEANUP_INTERVAL_MINUTES", "1440"),
            )?),
            initial_sync_delay: Duration::from_secs(parse_value(
                "INITIAL_SYNC_DELAY_SECONDS",
                &or("INITIAL_SYNC_DELAY_SECONDS", "30"),
            )?),
            reconcile_min_age: Duration::from_secs(parse_value(
                "RECONCILE_MIN_AGE_SECONDS",
                &or("RECONCILE_MIN_AGE_SECONDS", "300"),
            )?),
        };

        let email = EmailConfig {
            enabled: get("EMAIL_ENABLED")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(true),
            sender: get("EMAIL_SENDER"),
            cc: parse_address_list(&or("EMAIL_CC", "")),
            subject_template: or("EMAIL_SUBJECT_TEMPLATE", DEFAULT_SUBJECT_TEMPLATE),
            recipient_field: or("EMAIL_RECIPIENT_FIELD", "email"),
            template_path: get("EMAIL_TEMPLATE_PATH").map(PathBuf::from),
        };

        let config = Self {
            server_host,
            server_port,
            admin_token,
            cors_allowed_origin,
            backup_file,
            spool_dir,
            token,
            sharepoint,
            sync,
            email,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.token.url.is_some() || self.token.static_token.is_some(),
            "either TOKEN_API_URL or STATIC_ACCESS_TOKEN must be set"
        );
        if let Some(url) = &self.token.url {
            Url::parse(url).context("TOKEN_API_URL must be a valid URL")?;
        }
        Url::parse(&self.sharepoint.graph_base_url).context("GRAPH_BASE_URL must be a valid URL")?;
        ensure!(
            self.sync.max_attempts >= 1,
            "RETRY_MAX_ATTEMPTS must be at least 1"
        );
        ensure!(
            self.sync.upload_pool_size >= 1,
            "UPLOAD_POOL_SIZE must be at least 1"
        );
        ensure!(
            self.sync.background_concurrency >= 1,
            "BACKGROUND_CONCURRENCY must be at least 1"
        );
        ensure!(
            (1..=MAX_RETENTION_DAYS).contains(&self.sync.retention_days),
            "ATTACHMENT_RETENTION_DAYS must be between 1 and {MAX_RETENTION_DAYS}"
        );
        ensure!(
            self.token.refresh_margin < self.token.lifetime,
            "TOKEN_REFRESH_MARGIN_SECONDS must be shorter than TOKEN_LIFETIME_MINUTES"
        );
        ensure!(
            !self.sync.sync_interval.is_zero() && !self.sync.cleanup_interval.is_zero(),
            "scheduler intervals must be positive"
        );
        ensure!(
            self.sync.column_mapping.label_for("request_id").is_some(),
            "column mapping must map `request_id` so rows can be located"
        );
        ensure!(
            !self.email.enabled || self.email.sender.is_some(),
            "EMAIL_SENDER must be set when EMAIL_ENABLED is true"
        );
        Ok(())
    }

    pub fn redacted_token_api_url(&self) -> Option<String> {
        self.token.url.as_deref().map(redact_url)
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    raw.trim()
        .parse()
        .map_err(|err| anyhow!("{key} has an invalid value `{raw}`: {err}"))
}

fn minutes(value: u64) -> Duration {
    Duration::from_secs(value * 60)
}

/// Splits `a@x.com; b@y.com` into trimmed, non-empty addresses.
pub fn parse_address_list(raw: &str) -> Vec<String> {
    raw.split(';')
        .map(str::trim)
        .filter(|address| !address.is_empty())
        .map(str::to_string)
        .collect()
}

fn redact_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("*****"));
            }
            parsed.set_query(None);
            parsed.to_string()
        }
        Err(_) => "***".to_string(),
    }
}
