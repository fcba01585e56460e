mod common;

use std::time::{Duration, Instant};

use anyhow::Result;
use axum::http::StatusCode;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use common::{body_json, valid_form, TestApp, CORRUPT_MARKER};
use serde::Deserialize;
use transport_sync::models::{SubmissionStage, SyncStatus, UploadStatus};

#[derive(Deserialize)]
struct SubmitResponse {
    success: bool,
    request_id: String,
    message: String,
    attachments_count: usize,
    processing_status: String,
}

#[tokio::test]
async fn submission_with_attachments_flow() -> Result<()> {
    let app = TestApp::new().await?;
    let data = valid_form("driver@example.com").to_string();
    let corrupt = [CORRUPT_MARKER, &b" bytes"[..]].concat();

    let response = app
        .submit(
            &data,
            &[
                ("cmr.pdf", "application/pdf", &b"%PDF-1.4 cmr"[..]),
                ("truck.jpg", "image/jpeg", &b"\xff\xd8\xff jpeg"[..]),
                ("broken.pdf", "application/pdf", corrupt.as_slice()),
            ],
            None,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let ack: SubmitResponse = serde_json::from_value(body_json(response.into_body()).await?)?;
    assert!(ack.success);
    assert_eq!(ack.attachments_count, 3);
    assert_eq!(ack.processing_status, "background");
    assert_eq!(ack.message, "Request received and is being processed");
    assert!(ack.request_id.starts_with("REQ-"));
    assert_eq!(ack.request_id.len(), "REQ-20241205-143012-3FA9C1".len());

    app.wait_idle().await;

    let record = app
        .backup
        .get(&ack.request_id)
        .expect("record persisted before acknowledgement");
    assert_eq!(record.sync_status, SyncStatus::Synced);
    assert_eq!(record.stage, SubmissionStage::Finalized);
    assert_eq!(record.sync_attempts, 1);
    assert!(record.notified_at.is_some());

    let statuses: Vec<UploadStatus> = record
        .attachments
        .iter()
        .map(|meta| meta.upload_status)
        .collect();
    assert_eq!(
        statuses,
        vec![
            UploadStatus::Uploaded,
            UploadStatus::Uploaded,
            UploadStatus::Failed
        ]
    );
    let failure = record.attachments[2].error.clone().unwrap_or_default();
    assert!(failure.starts_with("broken.pdf:"), "{failure}");

    // Uploaded copies leave the spool; the failed one stays for a retry.
    assert!(app
        .backup
        .read_spooled(&ack.request_id, &record.attachments[0].stored_name)?
        .is_none());
    assert!(app
        .backup
        .read_spooled(&ack.request_id, &record.attachments[2].stored_name)?
        .is_some());

    let uploaded = app.drive.files().await;
    assert_eq!(uploaded.len(), 2);
    assert!(uploaded
        .iter()
        .all(|file| file.folder == app.attachments_folder()));
    assert!(uploaded
        .iter()
        .any(|file| file.content_type == "application/pdf"));

    let rows = app.workbook.rows().await;
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row["Request ID"], ack.request_id);
    assert_eq!(row["Delivery Note Number"], "DN-2024-0042");
    assert_eq!(row["Has Attachment"], "Yes");
    assert_eq!(row["Attachment Status"], "Saved");
    assert!(row["Attachment Error"].contains("broken.pdf"));
    assert_eq!(row["Phone Number"], "");

    let sent = app.mailer.sent().await;
    assert_eq!(sent.len(), 1);
    let (sender, message) = &sent[0];
    assert_eq!(sender, "transport-app@example.com");
    assert_eq!(message.to, vec!["driver@example.com".to_string()]);
    assert_eq!(message.cc, vec!["dispatch@example.com".to_string()]);
    assert!(message.subject.contains(&ack.request_id));
    assert!(message.html_body.contains("DN-2024-0042"));
    assert!(message.html_body.contains("Not provided"));
    Ok(())
}

#[tokio::test]
async fn acknowledgement_does_not_wait_for_remotes() -> Result<()> {
    let app = TestApp::new().await?;
    app.workbook.set_delay(Duration::from_millis(1500)).await;

    let started = Instant::now();
    let response = app
        .submit(&valid_form("driver@example.com").to_string(), &[], None)
        .await?;
    let elapsed = started.elapsed();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(elapsed < Duration::from_millis(1000), "took {elapsed:?}");

    let ack: SubmitResponse = serde_json::from_value(body_json(response.into_body()).await?)?;
    let pending = app.backup.get(&ack.request_id).expect("backed up");
    assert_eq!(pending.sync_status, SyncStatus::Pending);
    assert_eq!(pending.stage, SubmissionStage::BackedUp);

    app.wait_idle().await;
    let record = app.backup.get(&ack.request_id).expect("still present");
    assert_eq!(record.sync_status, SyncStatus::Synced);
    Ok(())
}

#[tokio::test]
async fn base64_encoded_payload_is_accepted() -> Result<()> {
    let app = TestApp::new().await?;
    let mut form = valid_form("șofer@example.ro");
    form["carrierFullName"] = "Transport Ștefănescu".into();
    let encoded: String = form
        .to_string()
        .bytes()
        .map(|byte| match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' => {
                (byte as char).to_string()
            }
            other => format!("%{other:02X}"),
        })
        .collect();

    let response = app
        .submit(&STANDARD.encode(encoded), &[], Some("base64"))
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let ack: SubmitResponse = serde_json::from_value(body_json(response.into_body()).await?)?;
    app.wait_idle().await;

    let record = app.backup.get(&ack.request_id).expect("record stored");
    assert_eq!(record.fields["carrierFullName"], "Transport Ștefănescu");
    assert_eq!(record.fields["email"], "șofer@example.ro");
    Ok(())
}

#[tokio::test]
async fn invalid_submissions_are_rejected_without_side_effects() -> Result<()> {
    let app = TestApp::new().await?;

    let mut missing = valid_form("driver@example.com");
    missing["carrierTaxCode"] = "".into();
    let response = app.submit(&missing.to_string(), &[], None).await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response.into_body()).await?;
    assert!(body["error"]
        .as_str()
        .unwrap_or_default()
        .contains("carrierTaxCode"));

    let response = app
        .submit(&valid_form("driver-at-example").to_string(), &[], None)
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app.submit("not json", &[], None).await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app.submit("@@@", &[], Some("base64")).await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    app.wait_idle().await;
    assert!(app
        .backup
        .list_records(&Default::default())
        .is_empty());
    assert!(app.workbook.rows().await.is_empty());
    assert!(app.mailer.sent().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn spreadsheet_failure_keeps_record_for_reconciliation() -> Result<()> {
    let app = TestApp::new().await?;
    app.workbook.set_rejection(common::Rejection::All).await;

    let response = app
        .submit(
            &valid_form("driver@example.com").to_string(),
            &[("cmr.pdf", "application/pdf", &b"%PDF-1.4"[..])],
            None,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let ack: SubmitResponse = serde_json::from_value(body_json(response.into_body()).await?)?;
    app.wait_idle().await;

    let record = app.backup.get(&ack.request_id).expect("record stored");
    assert_eq!(record.sync_status, SyncStatus::Failed);
    assert_eq!(record.sync_attempts, 1);
    assert!(record.last_error.is_some());
    assert_eq!(record.attachments[0].upload_status, UploadStatus::Uploaded);
    assert_eq!(record.stage, SubmissionStage::Finalized);
    // The confirmation still goes out.
    assert_eq!(app.mailer.sent().await.len(), 1);
    Ok(())
}
