use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::{header::CONTENT_TYPE, Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    config::SharePointConfig,
    error::{SyncError, SyncResult},
};

use super::{
    cell_text, is_lock_indication, CellOrigin, FileStorage, MailMessage, Mailer, RemoteFile,
    SheetSnapshot, WorkbookApi,
};

const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

const ERROR_EXCERPT_CHARS: usize = 300;

/// Microsoft Graph style REST backend for the workbook, the drive folder and
/// outgoing mail.
#[derive(Clone)]
pub struct GraphClient {
    client: Client,
    base_url: String,
    drive_path: String,
    workbook_path: String,
    worksheet: String,
    table: String,
}

impl GraphClient {
    pub fn new(client: Client, config: &SharePointConfig) -> Self {
        Self {
            client,
            base_url: config.graph_base_url.trim_end_matches('/').to_string(),
            drive_path: config.drive_path.trim_matches('/').to_string(),
            workbook_path: format!(
                "{}/{}",
                config.folder_path.trim_matches('/'),
                config.excel_file_name
            ),
            worksheet: config.worksheet_name.clone(),
            table: config.table_name.clone(),
        }
    }

    /// Shared HTTP client; every remote call is bounded by `timeout`.
    pub fn http_client(timeout: Duration) -> anyhow::Result<Client> {
        Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")
    }

    fn drive_url(&self) -> String {
        format!("{}/{}", self.base_url, self.drive_path)
    }

    fn item_url(&self, path: &str) -> String {
        format!("{}/root:/{}:", self.drive_url(), encode_path(path))
    }

    fn workbook_url(&self) -> String {
        format!("{}/workbook", self.item_url(&self.workbook_path))
    }

    fn table_url(&self) -> String {
        format!(
            "{}/tables/{}",
            self.workbook_url(),
            utf8_percent_encode(&self.table, PATH_SEGMENT)
        )
    }

    fn worksheet_url(&self) -> String {
        format!(
            "{}/worksheets/{}",
            self.workbook_url(),
            utf8_percent_encode(&self.worksheet, PATH_SEGMENT)
        )
    }

    async fn send(&self, request: RequestBuilder, operation: &str) -> SyncResult<Response> {
        let response = request
            .send()
            .await
            .map_err(|err| SyncError::RemoteWrite(format!("{operation}: {err}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let excerpt: String = body.chars().take(ERROR_EXCERPT_CHARS).collect();
        let message = format!("{operation} returned {status}: {excerpt}");
        if is_lock_indication(status.as_u16(), &body) {
            Err(SyncError::RemoteLocked(message))
        } else {
            Err(SyncError::RemoteWrite(message))
        }
    }

    async fn read_json<T: for<'de> Deserialize<'de>>(
        response: Response,
        operation: &str,
    ) -> SyncResult<T> {
        response
            .json()
            .await
            .map_err(|err| SyncError::RemoteWrite(format!("{operation}: invalid response: {err}")))
    }
}

#[derive(Deserialize)]
struct RangeValues {
    #[serde(default)]
    values: Vec<Vec<Value>>,
    address: Option<String>,
}

#[derive(Deserialize)]
struct TableRowList {
    #[serde(default)]
    value: Vec<RangeValues>,
}

#[derive(Deserialize)]
struct DriveItemList {
    #[serde(default)]
    value: Vec<DriveItem>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveItem {
    id: String,
    name: String,
    created_date_time: Option<DateTime<Utc>>,
    folder: Option<Value>,
}

#[async_trait]
impl WorkbookApi for GraphClient {
    async fn table_header(&self, token: &str) -> SyncResult<Vec<String>> {
        let url = format!("{}/headerRowRange", self.table_url());
        let response = self
            .send(self.client.get(url).bearer_auth(token), "read table header")
            .await?;
        let range: RangeValues = Self::read_json(response, "read table header").await?;
        Ok(range
            .values
            .into_iter()
            .next()
            .unwrap_or_default()
            .iter()
            .map(cell_text)
            .collect())
    }

    async fn table_rows(&self, token: &str) -> SyncResult<Vec<Vec<Value>>> {
        let url = format!("{}/rows", self.table_url());
        let response = self
            .send(self.client.get(url).bearer_auth(token), "read table rows")
            .await?;
        let rows: TableRowList = Self::read_json(response, "read table rows").await?;
        Ok(rows
            .value
            .into_iter()
            .map(|row| row.values.into_iter().next().unwrap_or_default())
            .collect())
    }

    async fn append_table_row(&self, token: &str, values: Vec<Value>) -> SyncResult<()> {
        let url = format!("{}/rows/add", self.table_url());
        self.send(
            self.client
                .post(url)
                .bearer_auth(token)
                .json(&json!({ "values": [values] })),
            "append table row",
        )
        .await?;
        Ok(())
    }

    async fn update_table_row(
        &self,
        token: &str,
        index: usize,
        values: Vec<Value>,
    ) -> SyncResult<()> {
        let url = format!("{}/rows/itemAt(index={index})", self.table_url());
        self.send(
            self.client
                .patch(url)
                .bearer_auth(token)
                .json(&json!({ "values": [values] })),
            "update table row",
        )
        .await?;
        Ok(())
    }

    async fn download_sheet(&self, token: &str) -> SyncResult<SheetSnapshot> {
        let url = format!("{}/usedRange(valuesOnly=true)", self.worksheet_url());
        let response = self
            .send(self.client.get(url).bearer_auth(token), "download worksheet")
            .await?;
        let range: RangeValues = Self::read_json(response, "download worksheet").await?;
        let origin = range
            .address
            .as_deref()
            .and_then(range_origin)
            .unwrap_or_default();
        Ok(SheetSnapshot {
            rows: range.values,
            origin,
        })
    }

    async fn upload_sheet(&self, token: &str, sheet: &SheetSnapshot) -> SyncResult<()> {
        let width = sheet.width();
        if sheet.rows.is_empty() || width == 0 {
            return Ok(());
        }

        let rows: Vec<Vec<Value>> = sheet
            .rows
            .iter()
            .map(|row| {
                let mut padded = row.clone();
                padded.resize(width, Value::String(String::new()));
                padded
            })
            .collect();
        let CellOrigin { column, row } = sheet.origin;
        let address = format!(
            "{}{}:{}{}",
            column_letter(column),
            row + 1,
            column_letter(column + width - 1),
            row + rows.len()
        );
        debug!(%address, "uploading worksheet range");

        let url = format!("{}/range(address='{}')", self.worksheet_url(), address);
        self.send(
            self.client
                .patch(url)
                .bearer_auth(token)
                .json(&json!({ "values": rows })),
            "upload worksheet",
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl FileStorage for GraphClient {
    async fn upload_file(
        &self,
        token: &str,
        folder: &str,
        name: &str,
        content: Bytes,
        content_type: &str,
    ) -> SyncResult<()> {
        let path = format!("{}/{}", folder.trim_matches('/'), name);
        let url = format!("{}/content", self.item_url(&path));
        self.client
            .put(url)
            .bearer_auth(token)
            .header(CONTENT_TYPE, content_type)
            .body(content)
            .send()
            .await
            .map_err(|err| SyncError::Transfer {
                filename: name.to_string(),
                reason: err.to_string(),
            })
            .and_then(|response| {
                if response.status().is_success() {
                    Ok(())
                } else {
                    Err(SyncError::Transfer {
                        filename: name.to_string(),
                        reason: format!("upload returned {}", response.status()),
                    })
                }
            })
    }

    async fn list_files(&self, token: &str, folder: &str) -> SyncResult<Vec<RemoteFile>> {
        let mut files = Vec::new();
        let mut next = Some(format!(
            "{}/children?$select=id,name,createdDateTime,folder",
            self.item_url(folder)
        ));

        while let Some(url) = next.take() {
            let response = self
                .client
                .get(&url)
                .bearer_auth(token)
                .send()
                .await
                .map_err(|err| SyncError::RemoteWrite(format!("list folder: {err}")))?;
            if response.status() == StatusCode::NOT_FOUND {
                return Ok(files);
            }
            if !response.status().is_success() {
                return Err(SyncError::RemoteWrite(format!(
                    "list folder returned {}",
                    response.status()
                )));
            }

            let page: DriveItemList = Self::read_json(response, "list folder").await?;
            files.extend(page.value.into_iter().map(|item| RemoteFile {
                id: item.id,
                name: item.name,
                created_at: item.created_date_time,
                is_folder: item.folder.is_some(),
            }));
            next = page.next_link;
        }
        Ok(files)
    }

    async fn delete_file(&self, token: &str, file_id: &str) -> SyncResult<()> {
        let url = format!(
            "{}/items/{}",
            self.drive_url(),
            utf8_percent_encode(file_id, PATH_SEGMENT)
        );
        self.send(self.client.delete(url).bearer_auth(token), "delete file")
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Mailer for GraphClient {
    async fn send_mail(&self, token: &str, sender: &str, message: &MailMessage) -> SyncResult<()> {
        let url = format!(
            "{}/users/{}/sendMail",
            self.base_url,
            utf8_percent_encode(sender, PATH_SEGMENT)
        );
        let body = json!({
            "message": {
                "subject": message.subject,
                "body": { "contentType": "HTML", "content": message.html_body },
                "toRecipients": recipients(&message.to),
                "ccRecipients": recipients(&message.cc),
            },
            "saveToSentItems": true,
        });
        self.send(
            self.client.post(url).bearer_auth(token).json(&body),
            "send mail",
        )
        .await?;
        Ok(())
    }
}

fn recipients(addresses: &[String]) -> Vec<Value> {
    addresses
        .iter()
        .map(|address| json!({ "emailAddress": { "address": address } }))
        .collect()
}

fn encode_path(path: &str) -> String {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| utf8_percent_encode(segment, PATH_SEGMENT).to_string())
        .collect::<Vec<_>>()
        .join("/")
}

/// Zero-based column index to its spreadsheet letter (`0` → `A`, `26` → `AA`).
fn column_letter(index: usize) -> String {
    let mut letters = Vec::new();
    let mut n = index + 1;
    while n > 0 {
        let rem = (n - 1) % 26;
        letters.push(b'A' + rem as u8);
        n = (n - 1) / 26;
    }
    letters.reverse();
    String::from_utf8(letters).unwrap_or_default()
}

/// Top-left cell of an address such as `Sheet1!B3:F20` or `'My Sheet'!C2`.
fn range_origin(address: &str) -> Option<CellOrigin> {
    let cells = address.rsplit_once('!').map_or(address, |(_, cells)| cells);
    let start = cells.split(':').next()?.replace('$', "");
    let split = start.find(|c: char| c.is_ascii_digit())?;
    let (letters, digits) = start.split_at(split);
    if letters.is_empty() || !letters.chars().all(|c| c.is_ascii_alphabetic()) {
        return None;
    }
    let column = letters.bytes().fold(0usize, |acc, byte| {
        acc * 26 + usize::from(byte.to_ascii_uppercase() - b'A' + 1)
    });
    let row: usize = digits.parse().ok()?;
    Some(CellOrigin {
        column: column - 1,
        row: row.checked_sub(1)?,
    })
}
