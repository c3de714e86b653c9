use std::{path::Path, sync::Arc, time::Duration, time::Instant};

use anyhow::{anyhow, Context};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tokio::time::sleep;
use tokio_retry::{strategy::ExponentialBackoff, RetryIf};

use crate::{
    auth::Authenticator,
    types::{RemoteArtifact, UploadError},
    utils::{jitter, linear_backoff},
};

const DRIVE_BASE_URL: &str = "https://www.googleapis.com";
const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";
const PNG_MIME_TYPE: &str = "image/png";

pub const MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;
// resumable chunks must be a multiple of 256 KiB
const CHUNK_SIZE: usize = 5 * 1024 * 1024;
pub(crate) const MAX_UPLOAD_ATTEMPTS: usize = 5;
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);
const METADATA_RETRIES: u32 = 3;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub web_view_link: Option<String>,
    #[serde(default)]
    pub thumbnail_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<FileMetadata>,
}

/// Drive collaborator. Uploads a local screenshot into the configured
/// folder with overwrite semantics: any same-named files already in
/// the folder are deleted first, so a logical name maps to at most one
/// artifact at any time.
pub struct DriveClient {
    http: Client,
    auth: Arc<Authenticator>,
    base_url: String,
    folder_id: String,
}

impl DriveClient {
    pub fn new(auth: Arc<Authenticator>, folder_id: &str) -> Self {
        Self::with_base_url(auth, folder_id, DRIVE_BASE_URL)
    }

    pub fn with_base_url(auth: Arc<Authenticator>, folder_id: &str, base_url: &str) -> Self {
        DriveClient {
            http: Client::new(),
            auth,
            base_url: base_url.trim_end_matches('/').to_string(),
            folder_id: clean_folder_id(folder_id),
        }
    }

    pub async fn upload(&self, local_path: &Path) -> anyhow::Result<RemoteArtifact> {
        let size = std::fs::metadata(local_path)
            .with_context(|| format!("screenshot not found at {:?}", local_path))?
            .len();
        check_size(size)?;

        let file_name = local_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow!("invalid screenshot path {:?}", local_path))?
            .to_string();

        self.verify_folder().await?;

        let existing = self.find_existing(&file_name).await?;
        if !existing.is_empty() {
            info!(
                "removing {} existing file(s) named {} before upload",
                existing.len(),
                file_name
            );
            for file in &existing {
                self.delete_file(&file.id).await?;
            }
        }

        let data = tokio::fs::read(local_path)
            .await
            .with_context(|| format!("could not read screenshot at {:?}", local_path))?;

        let this = self;
        let name = file_name.as_str();
        let bytes = data.as_slice();
        let artifact = RetryIf::start(
            upload_retry_delays(MAX_UPLOAD_ATTEMPTS),
            move || this.upload_resumable(name, bytes),
            |e: &UploadError| {
                let retry = e.is_transient();
                if retry {
                    warn!("upload attempt failed, will retry: {}", e);
                }
                retry
            },
        )
        .await?;

        info!("uploaded {} as {}", file_name, artifact.id);
        Ok(artifact)
    }

    pub async fn get_metadata(&self, file_id: &str) -> anyhow::Result<FileMetadata> {
        let url = format!(
            "{}/drive/v3/files/{}?fields=id,name,mimeType,thumbnailLink,webViewLink",
            self.base_url, file_id
        );

        for attempt in 1..=METADATA_RETRIES {
            let token = self.auth.token().await?;
            match self.http.get(&url).bearer_auth(token).send().await {
                Ok(res) if res.status().is_success() => {
                    return res.json().await.context("malformed file metadata");
                }
                Ok(res) => warn!(
                    "metadata attempt {} for {} failed with {}",
                    attempt,
                    file_id,
                    res.status()
                ),
                Err(e) => warn!("metadata attempt {} for {} failed: {}", attempt, file_id, e),
            }
            if attempt < METADATA_RETRIES {
                sleep(linear_backoff(attempt)).await;
            }
        }
        Err(anyhow!(
            "failed to fetch metadata for {} after {} attempts",
            file_id,
            METADATA_RETRIES
        ))
    }

    async fn verify_folder(&self) -> Result<(), UploadError> {
        let url = format!(
            "{}/drive/v3/files/{}?fields=id,name,mimeType&supportsAllDrives=true",
            self.base_url, self.folder_id
        );
        let res = self
            .http
            .get(&url)
            .bearer_auth(self.token().await?)
            .send()
            .await
            .map_err(|e| UploadError::Transient(e.to_string()))?;

        match res.status().as_u16() {
            404 => return Err(UploadError::FolderNotFound(self.folder_id.clone())),
            403 => {
                return Err(UploadError::PermissionDenied(format!(
                    "no access to folder {}",
                    self.folder_id
                )))
            }
            s if s >= 400 => {
                return Err(UploadError::Transient(format!(
                    "folder lookup failed with {}",
                    s
                )))
            }
            _ => {}
        }

        let folder: FileMetadata = res
            .json()
            .await
            .map_err(|e| UploadError::Transient(e.to_string()))?;
        if folder.mime_type.as_deref() != Some(FOLDER_MIME_TYPE) {
            return Err(UploadError::FolderNotFound(format!(
                "{} is not a folder",
                self.folder_id
            )));
        }
        debug!("verified access to folder {:?}", folder.name);
        Ok(())
    }

    async fn find_existing(&self, file_name: &str) -> anyhow::Result<Vec<FileMetadata>> {
        let query = format!(
            "name='{}' and '{}' in parents and trashed=false",
            file_name, self.folder_id
        );
        let url = format!("{}/drive/v3/files", self.base_url);
        let res = self
            .http
            .get(&url)
            .query(&[
                ("q", query.as_str()),
                ("spaces", "drive"),
                ("fields", "files(id,name)"),
            ])
            .bearer_auth(self.auth.token().await?)
            .send()
            .await
            .context("file existence check failed")?;

        if !res.status().is_success() {
            // the original treats a failed existence check as "no duplicates"
            warn!("existence check failed with {}", res.status());
            return Ok(vec![]);
        }
        let list: FileList = res.json().await.context("malformed file list")?;
        Ok(list.files)
    }

    async fn delete_file(&self, file_id: &str) -> anyhow::Result<()> {
        let url = format!("{}/drive/v3/files/{}", self.base_url, file_id);
        let res = self
            .http
            .delete(&url)
            .bearer_auth(self.auth.token().await?)
            .send()
            .await
            .with_context(|| format!("could not delete file {}", file_id))?;
        if !res.status().is_success() {
            return Err(anyhow!(
                "delete of {} failed with {}",
                file_id,
                res.status()
            ));
        }
        debug!("deleted existing file {}", file_id);
        Ok(())
    }

    /// One whole resumable-upload attempt: initiate a session, then
    /// stream the file in fixed chunks, logging progress per chunk.
    async fn upload_resumable(
        &self,
        file_name: &str,
        data: &[u8],
    ) -> Result<RemoteArtifact, UploadError> {
        let token = self.token().await?;
        let init_url = format!(
            "{}/upload/drive/v3/files?uploadType=resumable&fields=id,webViewLink&supportsAllDrives=true",
            self.base_url
        );
        let res = self
            .http
            .post(&init_url)
            .bearer_auth(&token)
            .header("X-Upload-Content-Type", PNG_MIME_TYPE)
            .json(&json!({ "name": file_name, "parents": [self.folder_id] }))
            .send()
            .await
            .map_err(|e| UploadError::Transient(e.to_string()))?;

        match res.status().as_u16() {
            403 => {
                return Err(UploadError::PermissionDenied(format!(
                    "cannot create files in folder {}",
                    self.folder_id
                )))
            }
            s if s >= 400 => {
                return Err(UploadError::Transient(format!(
                    "upload session init failed with {}",
                    s
                )))
            }
            _ => {}
        }

        let session_uri = res
            .headers()
            .get("Location")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| UploadError::Transient("missing upload session URI".into()))?
            .to_string();

        let total = data.len();
        let started = Instant::now();
        let mut offset = 0usize;

        loop {
            let end = (offset + CHUNK_SIZE).min(total);
            let chunk = data[offset..end].to_vec();
            let res = self
                .http
                .put(&session_uri)
                .bearer_auth(&token)
                .header("Content-Type", PNG_MIME_TYPE)
                .header(
                    "Content-Range",
                    format!("bytes {}-{}/{}", offset, end - 1, total),
                )
                .body(chunk)
                .send()
                .await
                .map_err(|e| UploadError::Transient(e.to_string()))?;

            let status = res.status().as_u16();
            log_progress(end, total, started.elapsed());

            match status {
                // 308: chunk accepted, session expects more bytes
                308 => {
                    offset = end;
                    continue;
                }
                200 | 201 => {
                    let created: FileMetadata = res
                        .json()
                        .await
                        .map_err(|e| UploadError::Transient(e.to_string()))?;
                    return Ok(RemoteArtifact {
                        web_view_link: created.web_view_link.unwrap_or_default(),
                        id: created.id,
                    });
                }
                403 => {
                    return Err(UploadError::PermissionDenied(
                        "write access to the folder was revoked mid-upload".into(),
                    ))
                }
                s => {
                    return Err(UploadError::Transient(format!(
                        "chunk upload failed with {}",
                        s
                    )))
                }
            }
        }
    }

    async fn token(&self) -> Result<String, UploadError> {
        self.auth
            .token()
            .await
            .map_err(|e| UploadError::Transient(format!("token fetch failed: {}", e)))
    }
}

pub fn check_size(size: u64) -> Result<(), UploadError> {
    if size == 0 {
        return Err(UploadError::EmptyFile);
    }
    if size > MAX_FILE_SIZE {
        return Err(UploadError::SizeLimitExceeded {
            size,
            limit: MAX_FILE_SIZE,
        });
    }
    Ok(())
}

/// Delays slept between upload attempts. The cap applies after the
/// jitter, so no single wait can exceed `MAX_RETRY_DELAY`.
pub(crate) fn upload_retry_delays(attempts: usize) -> impl Iterator<Item = Duration> {
    ExponentialBackoff::from_millis(2)
        .factor(1000)
        .map(jitter)
        .map(|d| d.min(MAX_RETRY_DELAY))
        .take(attempts.saturating_sub(1))
}

/// Folder ids copied out of the Drive UI sometimes arrive quoted or
/// with a `#fragment` suffix.
fn clean_folder_id(folder_id: &str) -> String {
    folder_id
        .trim()
        .split('#')
        .next()
        .unwrap_or("")
        .trim()
        .trim_matches('"')
        .to_string()
}

fn log_progress(uploaded: usize, total: usize, elapsed: Duration) {
    let percent = uploaded as f64 / total as f64 * 100.0;
    let secs = elapsed.as_secs_f64();
    let speed = if secs > 0.0 {
        uploaded as f64 / (1024.0 * 1024.0) / secs
    } else {
        0.0
    };
    let eta = if speed > 0.0 {
        (total - uploaded) as f64 / (1024.0 * 1024.0) / speed
    } else {
        0.0
    };
    info!(
        "upload progress: {:.0}% ({}/{} bytes, {:.2} MB/s, ETA {:.1}s)",
        percent, uploaded, total, speed, eta
    );
}
