use std::{collections::HashSet, sync::Arc, time::Duration};

use anyhow::Context;
use chrono::{DateTime, Local, TimeDelta, Utc};
use serde::Serialize;
use tokio::task;
use tracing::{info, warn};

use crate::{
    backup::{BackupError, BackupResult, BackupStore, RecordFilter},
    config::AppConfig,
    credentials::{CredentialCache, CredentialInfo},
    error::{SyncError, SyncResult},
    executor::BackgroundExecutor,
    models::{
        generate_request_id, AttachmentMeta, AttachmentPayload, FormFields, RecordPatch,
        SubmissionRecord, SubmissionStage, SyncStatus, UploadStatus,
    },
    notify::{Notifier, NotifyOutcome},
    remote::{FileStorage, GraphClient, Mailer, WorkbookApi},
    sheet::{RowUpdate, SheetSync},
    transfer::{AttachmentTransfer, UploadJob, UploadResult},
};

const MAX_ID_COLLISIONS: usize = 5;

#[derive(Debug, Clone, Serialize)]
pub struct SubmitAck {
    pub request_id: String,
    pub accepted: bool,
    pub attachments_count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub candidates: usize,
    pub synced: usize,
    pub failed: usize,
    pub attachments_uploaded: usize,
    pub attachments_failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub scanned: usize,
    pub deleted: usize,
    pub failed: usize,
}

/// Remote endpoints the pipeline talks to.
#[derive(Clone)]
pub struct RemoteServices {
    pub workbook: Arc<dyn WorkbookApi>,
    pub storage: Arc<dyn FileStorage>,
    pub mailer: Arc<dyn Mailer>,
}

impl RemoteServices {
    pub fn graph(client: GraphClient) -> Self {
        let client = Arc::new(client);
        Self {
            workbook: client.clone(),
            storage: client.clone(),
            mailer: client,
        }
    }
}

pub struct Orchestrator {
    backup: BackupStore,
    credentials: Arc<CredentialCache>,
    sheet: SheetSync,
    transfer: AttachmentTransfer,
    notifier: Notifier,
    storage: Arc<dyn FileStorage>,
    executor: BackgroundExecutor,
    attachments_folder: String,
    retention: TimeDelta,
    reconcile_min_age: Duration,
}

impl Orchestrator {
    pub fn new(
        config: &AppConfig,
        backup: BackupStore,
        credentials: Arc<CredentialCache>,
        remotes: RemoteServices,
    ) -> anyhow::Result<Arc<Self>> {
        let notifier = Notifier::new(remotes.mailer.clone(), credentials.clone(), &config.email)?;
        let retention = TimeDelta::try_days(config.sync.retention_days).with_context(|| {
            format!(
                "retention window of {} days is out of range",
                config.sync.retention_days
            )
        })?;
        Ok(Arc::new(Self {
            sheet: SheetSync::new(remotes.workbook.clone(), credentials.clone(), &config.sync),
            transfer: AttachmentTransfer::new(
                remotes.storage.clone(),
                credentials.clone(),
                config.sync.upload_pool_size,
            ),
            notifier,
            storage: remotes.storage,
            executor: BackgroundExecutor::new(config.sync.background_concurrency),
            attachments_folder: config.sharepoint.attachments_folder(),
            retention,
            reconcile_min_age: config.sync.reconcile_min_age,
            backup,
            credentials,
        }))
    }

    /// Wires the Graph backend, the HTTP token source and the backup store
    /// from configuration.
    pub fn from_config(config: &AppConfig) -> anyhow::Result<Arc<Self>> {
        let client = GraphClient::http_client(config.sync.request_timeout)?;
        let credentials = Arc::new(CredentialCache::from_config(client.clone(), &config.token));
        let backup = BackupStore::open(&config.backup_file, &config.spool_dir)
            .with_context(|| format!("failed to open backup log {}", config.backup_file.display()))?;
        let remotes = RemoteServices::graph(GraphClient::new(client, &config.sharepoint));
        Self::new(config, backup, credentials, remotes)
    }

    /// Persists the submission and returns its id; spreadsheet, attachment and
    /// mail work continues in the background.
    pub async fn submit(
        self: &Arc<Self>,
        fields: FormFields,
        attachments: Vec<AttachmentPayload>,
    ) -> SyncResult<SubmitAck> {
        let attachments = Arc::new(attachments);
        let payloads = attachments.clone();
        let record = self
            .blocking(move |store| persist_submission(&store, fields, &payloads))
            .await?;

        let ack = SubmitAck {
            request_id: record.request_id.clone(),
            accepted: true,
            attachments_count: record.attachments.len(),
        };
        info!(
            request_id = %ack.request_id,
            attachments = ack.attachments_count,
            "submission accepted"
        );

        let this = self.clone();
        self.executor.spawn(record.request_id.clone(), async move {
            this.process_submission(record, attachments).await
        });
        Ok(ack)
    }

    /// Waits for every background pipeline to finish.
    pub async fn wait_idle(&self) {
        self.executor.wait_idle().await;
    }

    pub fn in_flight(&self) -> usize {
        self.executor.in_flight()
    }

    async fn process_submission(
        &self,
        record: SubmissionRecord,
        payloads: Arc<Vec<AttachmentPayload>>,
    ) -> SyncResult<()> {
        let request_id = record.request_id.clone();
        let now = Utc::now();

        let written = self.sheet.write_row(&record).await;
        let patch = match &written {
            Ok(()) => RecordPatch::new()
                .sync_status(SyncStatus::Synced)
                .stage(SubmissionStage::SpreadsheetWritten)
                .last_error(None),
            Err(err) => {
                warn!(%request_id, error = %err, "spreadsheet write failed; left for reconciliation");
                RecordPatch::new()
                    .sync_status(SyncStatus::Failed)
                    .stage(SubmissionStage::SpreadsheetWriteFailed)
                    .last_error(Some(err.to_string()))
            }
        };
        let mut record = self.update(&request_id, patch.attempt(1, now)).await?;

        if !record.attachments.is_empty() {
            let jobs = record
                .attachments
                .iter()
                .zip(payloads.iter())
                .map(|(meta, payload)| UploadJob {
                    filename: meta.filename.clone(),
                    stored_name: meta.stored_name.clone(),
                    content: payload.content.clone(),
                    content_type: meta.content_type.clone(),
                })
                .collect();
            let results = self
                .transfer
                .upload_all(jobs, &self.attachments_folder)
                .await;
            record = self.record_uploads(record, &results).await?;
        }
        record = self
            .update(
                &request_id,
                RecordPatch::new().stage(SubmissionStage::AttachmentsProcessed),
            )
            .await?;

        if written.is_ok() && !record.attachments.is_empty() {
            if let RowUpdate::Failed(reason) = self
                .sheet
                .update_existing_row(&request_id, &record.attachment_summary())
                .await
            {
                record = self
                    .update(
                        &request_id,
                        RecordPatch::new()
                            .sync_status(SyncStatus::Failed)
                            .last_error(Some(reason)),
                    )
                    .await?;
            }
        }

        if self.notifier.send_confirmation(&record).await == NotifyOutcome::Sent {
            self.update(&request_id, RecordPatch::new().notified_at(Utc::now()))
                .await?;
        }

        let record = self
            .update(&request_id, RecordPatch::new().stage(SubmissionStage::Finalized))
            .await?;
        info!(
            %request_id,
            sync_status = %record.sync_status,
            attachment_status = record.attachment_summary().status_text(),
            "submission processed"
        );
        Ok(())
    }

    /// Retries every unsynced record and every spooled attachment that has not
    /// reached remote storage yet.
    pub async fn reconciliation_pass(&self) -> SyncResult<ReconcileReport> {
        let older_than = Utc::now()
            - chrono::Duration::from_std(self.reconcile_min_age).unwrap_or(chrono::Duration::zero());
        let mut candidates = self
            .blocking(move |store| {
                let mut records = store.list_unsynced(older_than);
                records.extend(store.list_attachment_retries(older_than));
                Ok(records)
            })
            .await?;
        let mut seen = HashSet::new();
        candidates.retain(|record| seen.insert(record.request_id.clone()));

        let mut report = ReconcileReport {
            candidates: candidates.len(),
            ..Default::default()
        };
        if candidates.is_empty() {
            info!("reconciliation: nothing to do");
            return Ok(report);
        }

        let needs_rows = candidates
            .iter()
            .any(|record| record.sync_status != SyncStatus::Synced);
        let existing = if needs_rows {
            self.sheet
                .existing_request_ids()
                .await
                .map_err(|err| err.to_string())
        } else {
            Ok(HashSet::new())
        };
        if let Err(err) = &existing {
            warn!(error = %err, "could not read existing request ids; reconciliation attempts will fail");
        }

        for record in candidates {
            self.reconcile_record(record, &existing, &mut report).await?;
        }

        info!(
            candidates = report.candidates,
            synced = report.synced,
            failed = report.failed,
            attachments_uploaded = report.attachments_uploaded,
            "reconciliation finished"
        );
        Ok(report)
    }

    async fn reconcile_record(
        &self,
        record: SubmissionRecord,
        existing: &Result<HashSet<String>, String>,
        report: &mut ReconcileReport,
    ) -> SyncResult<()> {
        let request_id = record.request_id.clone();
        let before = record.attachment_summary();
        let record = self.retry_spooled_attachments(record).await?;
        let after = record.attachment_summary();
        let newly_uploaded = after.uploaded.len().saturating_sub(before.uploaded.len());
        report.attachments_uploaded += newly_uploaded;
        report.attachments_failed += after.errors.len();

        if record.sync_status == SyncStatus::Synced {
            if newly_uploaded == 0 {
                return Ok(());
            }
            // Unsynced records get their row rewritten on the next pass.
            if let RowUpdate::Failed(reason) =
                self.sheet.update_existing_row(&request_id, &after).await
            {
                report.failed += 1;
                warn!(%request_id, error = %reason, "attachment columns not updated; left for reconciliation");
                self.update(
                    &request_id,
                    RecordPatch::new()
                        .sync_status(SyncStatus::Failed)
                        .last_error(Some(reason)),
                )
                .await?;
            }
            return Ok(());
        }

        let outcome = match existing {
            Err(reason) => Err(SyncError::RemoteWrite(format!(
                "existing rows unavailable: {reason}"
            ))),
            Ok(ids) if ids.contains(&request_id) => {
                match self.sheet.update_existing_row(&request_id, &after).await {
                    RowUpdate::Failed(reason) => Err(SyncError::RemoteWrite(reason)),
                    RowUpdate::Updated | RowUpdate::NotFound => Ok(()),
                }
            }
            Ok(_) => self.sheet.write_row(&record).await,
        };

        let attempts = record.sync_attempts + 1;
        let patch = match &outcome {
            Ok(()) => {
                report.synced += 1;
                info!(%request_id, attempts, "record reconciled");
                RecordPatch::new()
                    .sync_status(SyncStatus::Synced)
                    .stage(SubmissionStage::Finalized)
                    .last_error(None)
            }
            Err(err) => {
                report.failed += 1;
                warn!(%request_id, attempts, error = %err, "reconciliation attempt failed");
                RecordPatch::new()
                    .sync_status(SyncStatus::Failed)
                    .last_error(Some(err.to_string()))
            }
        };
        self.update(&request_id, patch.attempt(attempts, Utc::now()))
            .await?;
        Ok(())
    }

    async fn retry_spooled_attachments(
        &self,
        record: SubmissionRecord,
    ) -> SyncResult<SubmissionRecord> {
        if !record.has_retryable_attachments() {
            return Ok(record);
        }

        let request_id = record.request_id.clone();
        let pending: Vec<AttachmentMeta> = record
            .attachments
            .iter()
            .filter(|meta| meta.upload_status != UploadStatus::Uploaded)
            .cloned()
            .collect();
        let jobs = self
            .blocking(move |store| {
                let mut jobs = Vec::new();
                for meta in pending {
                    if let Some(content) = store.read_spooled(&request_id, &meta.stored_name)? {
                        jobs.push(UploadJob {
                            filename: meta.filename,
                            stored_name: meta.stored_name,
                            content,
                            content_type: meta.content_type,
                        });
                    }
                }
                Ok(jobs)
            })
            .await?;

        if jobs.is_empty() {
            return Ok(record);
        }
        let results = self
            .transfer
            .upload_all(jobs, &self.attachments_folder)
            .await;
        self.record_uploads(record, &results).await
    }

    /// Folds upload results into the record and drops spooled copies that
    /// reached remote storage.
    async fn record_uploads(
        &self,
        mut record: SubmissionRecord,
        results: &[UploadResult],
    ) -> SyncResult<SubmissionRecord> {
        for result in results {
            if let Some(meta) = record
                .attachments
                .iter_mut()
                .find(|meta| meta.stored_name == result.stored_name)
            {
                meta.upload_status = result.status;
                meta.error = result.error.clone();
            }
        }

        let request_id = record.request_id.clone();
        let uploaded: Vec<String> = results
            .iter()
            .filter(|result| result.status == UploadStatus::Uploaded)
            .map(|result| result.stored_name.clone())
            .collect();
        let patch = RecordPatch::new().attachments(record.attachments.clone());
        self.blocking(move |store| {
            let updated = store.update_record(&request_id, &patch)?;
            for stored_name in &uploaded {
                if let Err(err) = store.remove_spooled(&request_id, stored_name) {
                    warn!(%request_id, %stored_name, error = %err, "failed to remove spooled attachment");
                }
            }
            Ok(updated)
        })
        .await
    }

    /// Deletes remote attachments older than the retention window.
    pub async fn retention_cleanup(&self) -> SyncResult<CleanupReport> {
        let credential = self.credentials.get_credential().await?;
        let files = self
            .storage
            .list_files(credential.token(), &self.attachments_folder)
            .await?;
        let cutoff = Utc::now()
            .checked_sub_signed(self.retention)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut report = CleanupReport::default();
        for file in files.iter().filter(|file| !file.is_folder) {
            report.scanned += 1;
            let Some(created_at) = file.created_at else {
                continue;
            };
            if created_at >= cutoff {
                continue;
            }
            match self.storage.delete_file(credential.token(), &file.id).await {
                Ok(()) => {
                    report.deleted += 1;
                    info!(
                        name = %file.name,
                        file_id = %file.id,
                        created_at = %created_at,
                        "expired attachment deleted"
                    );
                }
                Err(err) => {
                    report.failed += 1;
                    warn!(name = %file.name, file_id = %file.id, error = %err, "failed to delete expired attachment");
                }
            }
        }

        info!(
            scanned = report.scanned,
            deleted = report.deleted,
            failed = report.failed,
            retention_days = self.retention.num_days(),
            "retention cleanup finished"
        );
        Ok(report)
    }

    pub async fn list_records(&self, filter: RecordFilter) -> SyncResult<Vec<SubmissionRecord>> {
        self.blocking(move |store| Ok(store.list_records(&filter)))
            .await
    }

    pub async fn get_record(&self, request_id: &str) -> SyncResult<Option<SubmissionRecord>> {
        let request_id = request_id.to_string();
        self.blocking(move |store| Ok(store.get(&request_id)))
            .await
    }

    pub async fn delete_records(&self, request_ids: Vec<String>) -> SyncResult<usize> {
        self.blocking(move |store| store.delete_records(&request_ids))
            .await
    }

    pub async fn credential_info(&self) -> CredentialInfo {
        self.credentials.info().await
    }

    pub async fn force_refresh(&self) -> SyncResult<CredentialInfo> {
        self.credentials.force_refresh().await?;
        Ok(self.credentials.info().await)
    }

    async fn update(&self, request_id: &str, patch: RecordPatch) -> SyncResult<SubmissionRecord> {
        let request_id = request_id.to_string();
        self.blocking(move |store| store.update_record(&request_id, &patch))
            .await
    }

    async fn blocking<T, F>(&self, operation: F) -> SyncResult<T>
    where
        F: FnOnce(BackupStore) -> BackupResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.backup.clone();
        task::spawn_blocking(move || operation(store))
            .await
            .map_err(|err| SyncError::BackupWrite(format!("backup task failed: {err}")))?
            .map_err(SyncError::from)
    }
}

/// Spools the attachment bytes, then appends the record. A colliding id is
/// regenerated.
fn persist_submission(
    store: &BackupStore,
    fields: FormFields,
    payloads: &[AttachmentPayload],
) -> BackupResult<SubmissionRecord> {
    let mut collisions = 0;
    loop {
        let request_id = generate_request_id(Local::now());
        if store.get(&request_id).is_some() {
            collisions += 1;
            if collisions > MAX_ID_COLLISIONS {
                return Err(BackupError::Duplicate(request_id));
            }
            warn!(%request_id, "request id collision; regenerating");
            continue;
        }

        let mut record = SubmissionRecord::new(request_id, Utc::now(), fields.clone(), payloads);
        for (meta, payload) in record.attachments.iter().zip(payloads) {
            if let Err(err) =
                store.spool_attachment(&record.request_id, &meta.stored_name, &payload.content)
            {
                discard_spool(store, &record);
                return Err(err);
            }
        }

        record.stage = SubmissionStage::BackedUp;
        if let Err(err) = store.append_record(&record) {
            if !matches!(err, BackupError::Duplicate(_)) {
                discard_spool(store, &record);
            }
            return Err(err);
        }
        return Ok(record);
    }
}

fn discard_spool(store: &BackupStore, record: &SubmissionRecord) {
    for meta in &record.attachments {
        let _ = store.remove_spooled(&record.request_id, &meta.stored_name);
    }
}
