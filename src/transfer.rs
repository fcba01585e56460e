use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::join_all;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::{
    credentials::CredentialCache,
    error::SyncError,
    models::UploadStatus,
    remote::FileStorage,
};

/// One attachment headed for remote storage.
#[derive(Debug, Clone)]
pub struct UploadJob {
    pub filename: String,
    pub stored_name: String,
    pub content: Bytes,
    pub content_type: Option<String>,
}

impl UploadJob {
    fn resolved_content_type(&self) -> String {
        self.content_type.clone().unwrap_or_else(|| {
            mime_guess::from_path(&self.filename)
                .first_or_octet_stream()
                .to_string()
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadResult {
    pub filename: String,
    pub stored_name: String,
    pub status: UploadStatus,
    pub error: Option<String>,
}

impl UploadResult {
    fn uploaded(job: &UploadJob) -> Self {
        Self {
            filename: job.filename.clone(),
            stored_name: job.stored_name.clone(),
            status: UploadStatus::Uploaded,
            error: None,
        }
    }

    fn failed(filename: &str, stored_name: &str, error: impl Into<String>) -> Self {
        Self {
            filename: filename.to_string(),
            stored_name: stored_name.to_string(),
            status: UploadStatus::Failed,
            error: Some(error.into()),
        }
    }
}

/// Parallel uploads through a fixed-size pool. Each file is tried once.
pub struct AttachmentTransfer {
    storage: Arc<dyn FileStorage>,
    credentials: Arc<CredentialCache>,
    pool_size: usize,
}

impl AttachmentTransfer {
    pub fn new(
        storage: Arc<dyn FileStorage>,
        credentials: Arc<CredentialCache>,
        pool_size: usize,
    ) -> Self {
        Self {
            storage,
            credentials,
            pool_size: pool_size.max(1),
        }
    }

    /// Returns exactly one result per job, in job order, once every upload has
    /// finished. A failing or panicking upload only affects its own result.
    pub async fn upload_all(&self, jobs: Vec<UploadJob>, destination: &str) -> Vec<UploadResult> {
        if jobs.is_empty() {
            return Vec::new();
        }

        let token = match self.credentials.get_credential().await {
            Ok(credential) => credential.token().to_string(),
            Err(err) => {
                warn!(error = %err, files = jobs.len(), "no credential for attachment upload");
                return jobs
                    .iter()
                    .map(|job| UploadResult::failed(&job.filename, &job.stored_name, err.to_string()))
                    .collect();
            }
        };

        let permits = Arc::new(Semaphore::new(self.pool_size));
        let names: Vec<(String, String)> = jobs
            .iter()
            .map(|job| (job.filename.clone(), job.stored_name.clone()))
            .collect();

        let handles = jobs.into_iter().map(|job| {
            let permits = permits.clone();
            let storage = self.storage.clone();
            let token = token.clone();
            let destination = destination.to_string();
            tokio::spawn(async move {
                let _permit = match permits.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(err) => {
                        return UploadResult::failed(&job.filename, &job.stored_name, err.to_string())
                    }
                };
                upload_one(storage.as_ref(), &token, &destination, job).await
            })
        });

        let results: Vec<UploadResult> = join_all(handles)
            .await
            .into_iter()
            .zip(names)
            .map(|(joined, (filename, stored_name))| match joined {
                Ok(result) => result,
                Err(err) => {
                    warn!(%filename, error = %err, "attachment upload task aborted");
                    UploadResult::failed(&filename, &stored_name, format!("upload task aborted: {err}"))
                }
            })
            .collect();

        let failed = results
            .iter()
            .filter(|result| result.status == UploadStatus::Failed)
            .count();
        info!(
            %destination,
            total = results.len(),
            failed,
            "attachment transfer finished"
        );
        results
    }
}

async fn upload_one(
    storage: &dyn FileStorage,
    token: &str,
    destination: &str,
    job: UploadJob,
) -> UploadResult {
    let content_type = job.resolved_content_type();
    match storage
        .upload_file(
            token,
            destination,
            &job.stored_name,
            job.content.clone(),
            &content_type,
        )
        .await
    {
        Ok(()) => {
            info!(filename = %job.filename, stored_name = %job.stored_name, "attachment uploaded");
            UploadResult::uploaded(&job)
        }
        Err(err) => {
            let reason = match err {
                SyncError::Transfer { reason, .. } => reason,
                other => other.to_string(),
            };
            warn!(filename = %job.filename, error = %reason, "attachment upload failed");
            UploadResult::failed(&job.filename, &job.stored_name, format!("{}: {reason}", job.filename))
        }
    }
}
