use axum::{
    extract::{Multipart, State},
    http::HeaderMap,
    Json,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use percent_encoding::percent_decode_str;
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::{
    error::{AppError, AppResult},
    models::{AttachmentPayload, FormFields},
    state::AppState,
};

pub const DATA_ENCODING_HEADER: &str = "x-data-encoding";

/// Fields the transport registration form must carry.
const REQUIRED_FIELDS: &[&str] = &[
    "deliveryNoteNumber",
    "truckLicensePlates",
    "carrierCountry",
    "carrierTaxCode",
    "carrierFullName",
    "borderCrossing",
    "email",
];

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub success: bool,
    pub request_id: String,
    pub accepted: bool,
    pub message: &'static str,
    pub attachments_count: usize,
    pub processing_status: &'static str,
}

pub async fn submit(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> AppResult<Json<SubmitResponse>> {
    let mut data: Option<String> = None;
    let mut attachments = Vec::new();

    while let Some(field) = multipart.next_field().await.map_err(|err| {
        error!(error = %err, "invalid multipart data");
        AppError::bad_request(format!("invalid multipart data: {err}"))
    })? {
        let name = field.name().map(|n| n.to_string());
        match name.as_deref() {
            Some("data") => {
                let value = field.text().await.map_err(|err| {
                    AppError::bad_request(format!("invalid data field: {err}"))
                })?;
                data = Some(value);
            }
            Some("attachments") | Some("attachments[]") => {
                let Some(filename) = field.file_name().map(|n| n.to_string()) else {
                    continue;
                };
                if filename.trim().is_empty() {
                    continue;
                }
                let content_type = field.content_type().map(|mime| mime.to_string());
                let content = field.bytes().await.map_err(|err| {
                    error!(error = %err, %filename, "failed to read attachment bytes");
                    AppError::bad_request(format!("failed to read attachment {filename}: {err}"))
                })?;
                attachments.push(AttachmentPayload::new(filename, content, content_type));
            }
            _ => {}
        }
    }

    let raw = data.ok_or_else(|| AppError::bad_request("data field is required"))?;
    let base64_encoded = headers
        .get(DATA_ENCODING_HEADER)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("base64"));
    let decoded = if base64_encoded {
        decode_base64_data(&raw)?
    } else {
        raw
    };

    let fields = parse_fields(&decoded)?;
    validate_fields(&fields)?;

    let ack = state
        .orchestrator
        .submit(fields, attachments)
        .await
        .map_err(|err| {
            error!(error = %err, "submission could not be persisted");
            AppError::from(err)
        })?;

    info!(
        request_id = %ack.request_id,
        attachments = ack.attachments_count,
        "request accepted"
    );
    Ok(Json(SubmitResponse {
        success: true,
        request_id: ack.request_id,
        accepted: ack.accepted,
        message: "Request received and is being processed",
        attachments_count: ack.attachments_count,
        processing_status: "background",
    }))
}

/// Base64, then URI-component encoded UTF-8.
fn decode_base64_data(raw: &str) -> AppResult<String> {
    let bytes = STANDARD
        .decode(raw.trim())
        .map_err(|err| AppError::bad_request(format!("base64 decode error: {err}")))?;
    let text = String::from_utf8(bytes)
        .map_err(|err| AppError::bad_request(format!("base64 payload is not UTF-8: {err}")))?;
    percent_decode_str(&text)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|err| AppError::bad_request(format!("invalid URI encoding: {err}")))
}

pub fn parse_fields(raw: &str) -> AppResult<FormFields> {
    let value: Value = serde_json::from_str(raw).map_err(|err| {
        warn!(error = %err, "submission data is not valid JSON");
        AppError::bad_request(format!("invalid JSON: {err}"))
    })?;
    let Value::Object(object) = value else {
        return Err(AppError::bad_request("data must be a JSON object"));
    };

    let mut fields = FormFields::new();
    for (key, value) in object {
        let text = match value {
            Value::String(text) => text.trim().to_string(),
            Value::Null => String::new(),
            Value::Bool(flag) => flag.to_string(),
            Value::Number(number) => number.to_string(),
            Value::Array(_) | Value::Object(_) => {
                return Err(AppError::bad_request(format!(
                    "field {key} must be a string"
                )))
            }
        };
        fields.insert(key, text);
    }
    Ok(fields)
}

pub fn validate_fields(fields: &FormFields) -> AppResult<()> {
    let missing: Vec<&str> = REQUIRED_FIELDS
        .iter()
        .copied()
        .filter(|name| fields.get(*name).map_or(true, |value| value.is_empty()))
        .collect();
    if !missing.is_empty() {
        return Err(AppError::bad_request(format!(
            "invalid data: missing {}",
            missing.join(", ")
        )));
    }

    let email = fields.get("email").map(String::as_str).unwrap_or_default();
    let domain_ok = email
        .rsplit_once('@')
        .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.'));
    if !domain_ok {
        return Err(AppError::bad_request("invalid data: invalid email format"));
    }
    Ok(())
}
