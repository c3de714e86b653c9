use std::{
    fs,
    future::Future,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Context;
use signal_hook::consts::{SIGINT, SIGTERM};
use tokio::{task, time::sleep};

use crate::{
    browser_controller::BrowserController,
    drive::DriveClient,
    sheets::SheetsClient,
    tracker::{UrlTracker, DEFAULT_TRACKING_FILE},
    types::{RowMetadata, RunSummary, UrlRow},
    utils::{retry_backoff, screenshot_filename, DEFAULT_STAGING_DIR},
};

/// Seam between the orchestrator and the browser session, so the rest
/// of the pipeline never touches CDP directly.
pub trait PageCapturer: Send + Sync {
    /// Blocking full-page capture of `url` into `output_path`; returns
    /// the page title.
    fn capture_page(&self, url: &str, output_path: &Path) -> anyhow::Result<String>;
    /// Releases the underlying session, if any.
    fn close(&self) {}
}

impl PageCapturer for BrowserController {
    fn capture_page(&self, url: &str, output_path: &Path) -> anyhow::Result<String> {
        self.capture_full_page(url, output_path)
    }

    fn close(&self) {
        BrowserController::close(self);
    }
}

pub struct Runner {
    sheets: SheetsClient,
    drive: DriveClient,
    capturer: Arc<dyn PageCapturer>,
    tracker: UrlTracker,
    options: RunnerOptions,
    should_terminate: Arc<AtomicBool>,
}

#[derive(Builder, Debug, Clone)]
#[builder(setter(into))]
pub struct RunnerOptions {
    // retries per failed URL, on top of the initial attempt
    #[builder(default = "3")]
    max_retries: u32,
    // courtesy delay between URLs, not between retries
    #[builder(default = "3")]
    inter_url_delay_secs: u64,
    // directory where screenshots are staged before upload
    #[builder(default = "self.default_staging_dir()")]
    staging_dir: PathBuf,
    #[builder(default = "30")]
    page_load_timeout_secs: u64,
    // path to the exported cookies JSON, if any
    #[builder(default = "None")]
    cookies_path: Option<PathBuf>,
    #[builder(default = "self.default_tracking_file()")]
    tracking_file: PathBuf,
}

impl RunnerOptions {
    pub fn default_builder() -> RunnerOptionsBuilder {
        RunnerOptionsBuilder::default()
    }
}

impl RunnerOptionsBuilder {
    fn default_staging_dir(&self) -> PathBuf {
        PathBuf::from(DEFAULT_STAGING_DIR)
    }
    fn default_tracking_file(&self) -> PathBuf {
        PathBuf::from(DEFAULT_TRACKING_FILE)
    }
}

impl Runner {
    pub async fn new(
        sheets: SheetsClient,
        drive: DriveClient,
        options: RunnerOptions,
    ) -> anyhow::Result<Self> {
        let page_load_timeout = options.page_load_timeout_secs;
        let browser = task::spawn_blocking(move || BrowserController::new(page_load_timeout))
            .await
            .context("browser launch task panicked")??;
        let browser = Arc::new(browser);

        if let Some(cookies_path) = options.cookies_path.clone() {
            info!("loading cookies from {:?}", cookies_path);
            let b = browser.clone();
            task::spawn_blocking(move || b.inject_cookies(&cookies_path))
                .await
                .context("cookie task panicked")??;
        }

        let should_terminate = Arc::new(AtomicBool::new(false));
        signal_hook::flag::register(SIGTERM, Arc::clone(&should_terminate))?;
        signal_hook::flag::register(SIGINT, Arc::clone(&should_terminate))?;

        Ok(Self::with_capturer(
            sheets,
            drive,
            browser,
            options,
            should_terminate,
        ))
    }

    fn with_capturer(
        sheets: SheetsClient,
        drive: DriveClient,
        capturer: Arc<dyn PageCapturer>,
        options: RunnerOptions,
        should_terminate: Arc<AtomicBool>,
    ) -> Self {
        let tracker = UrlTracker::new(options.tracking_file.clone());
        Runner {
            sheets,
            drive,
            capturer,
            tracker,
            options,
            should_terminate,
        }
    }

    /// Processes every URL in the configured range, strictly one at a
    /// time. A failed URL never aborts the batch; the summary is
    /// returned (and logged) no matter how many rows failed.
    pub async fn run(&mut self) -> anyhow::Result<RunSummary> {
        let rows = self.sheets.read_url_rows().await?;
        if rows.is_empty() {
            warn!("no URLs found to process");
            return Ok(RunSummary::default());
        }

        fs::create_dir_all(&self.options.staging_dir).with_context(|| {
            format!(
                "could not create staging directory {:?}",
                self.options.staging_dir
            )
        })?;

        let total = rows.len();
        info!("found {} URLs to process", total);

        let mut summary = RunSummary {
            total,
            ..Default::default()
        };

        for (i, row) in rows.iter().enumerate() {
            if self.should_terminate.load(Ordering::Relaxed) {
                warn!("termination requested, stopping after {} URLs", i);
                break;
            }

            info!("[progress: {}/{}] {}", i + 1, total, row.url);
            if self.process_url(row).await {
                summary.successful += 1;
            } else {
                summary.failed += 1;
                error!("failed to process URL: {}", row.url);
            }

            if i < total - 1 {
                debug!(
                    "waiting {} seconds before next URL",
                    self.options.inter_url_delay_secs
                );
                sleep(Duration::from_secs(self.options.inter_url_delay_secs)).await;
            }
        }

        info!(
            "run completed: {} successful, {} failed, {} total",
            summary.successful, summary.failed, summary.total
        );
        Ok(summary)
    }

    pub fn shutdown(&self) {
        self.capturer.close();
    }

    /// One URL, terminal on success or retry exhaustion. Returns
    /// whether the row ended up processed (a skip of an already
    /// complete row counts as success).
    async fn process_url(&mut self, row: &UrlRow) -> bool {
        match self.sheets.is_processed(row.row_index).await {
            Ok(true) => {
                info!("skipping URL (already processed): {}", row.url);
                return true;
            }
            Ok(false) => {}
            Err(e) => warn!(
                "could not check processed state for {}, assuming unprocessed: {}",
                row.url, e
            ),
        }

        let output_path = self.options.staging_dir.join(screenshot_filename(&row.url));

        let this = &*self;
        let path = output_path.as_path();
        let result = with_retries(self.options.max_retries, move |attempt| {
            if attempt > 0 {
                info!("attempt {} for {}", attempt + 1, row.url);
            }
            this.run_job(row, path)
        })
        .await;

        match result {
            Ok(metadata) => {
                self.tracker.mark_processed(&row.url, Some(metadata));
                info!("successfully processed URL: {}", row.url);
                true
            }
            Err(e) => {
                error!(
                    "failed to process URL {} after {} retries: {:#}",
                    row.url, self.options.max_retries, e
                );
                false
            }
        }
    }

    /// One job attempt: capture -> upload -> fetch thumbnail -> write
    /// row -> delete the local file. Any failing step propagates and
    /// the orchestrator decides whether to retry.
    async fn run_job(&self, row: &UrlRow, output_path: &Path) -> anyhow::Result<RowMetadata> {
        let capturer = self.capturer.clone();
        let url = row.url.clone();
        let path = output_path.to_path_buf();
        let title = task::spawn_blocking(move || capturer.capture_page(&url, &path))
            .await
            .context("capture task panicked")??;

        let artifact = self.drive.upload(output_path).await?;
        let file_metadata = self.drive.get_metadata(&artifact.id).await?;

        let metadata = RowMetadata {
            title,
            link: artifact.web_view_link,
            thumbnail_link: file_metadata.thumbnail_link.unwrap_or_default(),
        };
        self.sheets
            .update_metadata(row.row_index, &metadata)
            .await?;

        if output_path.exists() {
            if let Err(e) = fs::remove_file(output_path) {
                warn!("could not remove local screenshot {:?}: {}", output_path, e);
            }
        }

        Ok(metadata)
    }
}

/// Initial attempt plus up to `max_retries` retries, sleeping
/// `2^count` seconds after the count-th failure (2s, 4s, 8s for the
/// default of 3).
pub async fn with_retries<T, E, F, Fut>(max_retries: u32, mut op: F) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut count = 0;
    loop {
        match op(count).await {
            Ok(v) => return Ok(v),
            Err(e) => {
                count += 1;
                if count > max_retries {
                    return Err(e);
                }
                let delay = retry_backoff(count);
                warn!(
                    "attempt {} failed ({}), retrying in {} seconds",
                    count,
                    e,
                    delay.as_secs()
                );
                sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::auth::Authenticator;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    struct StubCapturer {
        calls: AtomicU32,
    }

    impl PageCapturer for StubCapturer {
        fn capture_page(&self, _url: &str, output_path: &Path) -> anyhow::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            fs::write(output_path, b"png-bytes")?;
            Ok("Example Domain".into())
        }
    }

    #[tokio::test]
    async fn processed_rows_are_skipped_and_counted_successful() {
        let dir = crate::utils::create_random_tmp_folder().unwrap();

        let mut sheets_server = mockito::Server::new_async().await;
        let mut drive_server = mockito::Server::new_async().await;

        let _values = sheets_server
            .mock("GET", "/v4/spreadsheets/sheet-1/values/Sheet1%21A2%3AA")
            .with_body(
                json!({"values": [["https://a.example"], ["https://b.example"]]}).to_string(),
            )
            .create_async()
            .await;
        // row 0 already carries all three metadata cells
        let _done = sheets_server
            .mock("GET", "/v4/spreadsheets/sheet-1/values/Sheet1%21B2%3AD2")
            .with_body(
                json!({"values": [["Old", "https://link/old", "https://thumb/old"]]}).to_string(),
            )
            .create_async()
            .await;
        let _pending = sheets_server
            .mock("GET", "/v4/spreadsheets/sheet-1/values/Sheet1%21B3%3AD3")
            .with_body("{}")
            .create_async()
            .await;
        let update = sheets_server
            .mock(
                "PUT",
                "/v4/spreadsheets/sheet-1/values/Sheet1%21B3%3AD3?valueInputOption=USER_ENTERED",
            )
            .match_body(mockito::Matcher::PartialJson(json!({
                "values": [["Example Domain", "https://drive/new-1", "https://thumb/new-1"]]
            })))
            .with_body("{}")
            .expect(1)
            .create_async()
            .await;

        let _folder = drive_server
            .mock("GET", "/drive/v3/files/folder-1")
            .match_query(mockito::Matcher::Any)
            .with_body(
                json!({
                    "id": "folder-1",
                    "name": "shots",
                    "mimeType": "application/vnd.google-apps.folder"
                })
                .to_string(),
            )
            .create_async()
            .await;
        let _list = drive_server
            .mock("GET", "/drive/v3/files")
            .match_query(mockito::Matcher::Any)
            .with_body(json!({"files": []}).to_string())
            .create_async()
            .await;
        let _init = drive_server
            .mock("POST", "/upload/drive/v3/files")
            .match_query(mockito::Matcher::Any)
            .with_header("Location", &format!("{}/upload-session", drive_server.url()))
            .create_async()
            .await;
        let _put = drive_server
            .mock("PUT", "/upload-session")
            .with_body(json!({"id": "new-1", "webViewLink": "https://drive/new-1"}).to_string())
            .create_async()
            .await;
        let _meta = drive_server
            .mock("GET", "/drive/v3/files/new-1")
            .match_query(mockito::Matcher::Any)
            .with_body(json!({"id": "new-1", "thumbnailLink": "https://thumb/new-1"}).to_string())
            .create_async()
            .await;

        let auth = Arc::new(Authenticator::fixed("t"));
        let sheets = SheetsClient::with_base_url(
            auth.clone(),
            "sheet-1",
            "Sheet1!A2:A",
            &sheets_server.url(),
        )
        .unwrap();
        let drive = DriveClient::with_base_url(auth, "folder-1", &drive_server.url());

        let capturer = Arc::new(StubCapturer {
            calls: AtomicU32::new(0),
        });
        let options = RunnerOptions::default_builder()
            .max_retries(0u32)
            .inter_url_delay_secs(0u64)
            .staging_dir(dir.clone())
            .tracking_file(dir.join("processed.json"))
            .build()
            .unwrap();

        let mut runner = Runner::with_capturer(
            sheets,
            drive,
            capturer.clone(),
            options,
            Arc::new(AtomicBool::new(false)),
        );
        let summary = runner.run().await.unwrap();

        // row 0 skipped without touching the browser, row 1 end to end
        assert_eq!(summary.total, 2);
        assert_eq!(summary.successful, 2);
        assert_eq!(summary.failed, 0);
        assert_eq!(capturer.calls.load(Ordering::SeqCst), 1);
        update.assert_async().await;

        fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn retry_exhaustion_after_backoff() {
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();

        let result: Result<(), &str> = with_retries(3, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("boom") }
        })
        .await;

        assert!(result.is_err());
        // initial attempt + 3 retries
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        // backoff slept 2 + 4 + 8 seconds
        assert_eq!(started.elapsed(), Duration::from_secs(14));
    }

    #[tokio::test(start_paused = true)]
    async fn stops_retrying_after_first_success() {
        let calls = AtomicU32::new(0);

        let result: Result<u32, &str> = with_retries(3, |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    Err("boom")
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn options_builder_defaults() {
        let options = RunnerOptions::default_builder().build().unwrap();
        assert_eq!(options.max_retries, 3);
        assert_eq!(options.inter_url_delay_secs, 3);
        assert_eq!(options.staging_dir, PathBuf::from("screenshots"));
        assert!(options.cookies_path.is_none());
    }
}
