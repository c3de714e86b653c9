use std::sync::Arc;

use anyhow::anyhow;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tokio::time::sleep;

use crate::{
    auth::Authenticator,
    types::{PipelineError, RowMetadata, UrlRow},
    utils::{is_http_url, linear_backoff},
};

const SHEETS_BASE_URL: &str = "https://sheets.googleapis.com";
const MAX_RETRIES: u32 = 3;

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

/// Spreadsheet collaborator: reads the URL column and writes the three
/// metadata cells (title, link, thumbnail) back next to it.
///
/// Rows are addressed by their 0-based position inside the configured
/// range; the metadata cells for row `i` live at columns B:D of sheet
/// row `start_row + i`.
pub struct SheetsClient {
    http: Client,
    auth: Arc<Authenticator>,
    base_url: String,
    spreadsheet_id: String,
    url_range: String,
    sheet_name: String,
    start_row: u32,
}

impl SheetsClient {
    pub fn new(
        auth: Arc<Authenticator>,
        spreadsheet_id: &str,
        url_range: &str,
    ) -> anyhow::Result<Self> {
        Self::with_base_url(auth, spreadsheet_id, url_range, SHEETS_BASE_URL)
    }

    pub fn with_base_url(
        auth: Arc<Authenticator>,
        spreadsheet_id: &str,
        url_range: &str,
        base_url: &str,
    ) -> anyhow::Result<Self> {
        let (sheet_name, start_row) = parse_range(url_range)?;
        Ok(SheetsClient {
            http: Client::new(),
            auth,
            base_url: base_url.trim_end_matches('/').to_string(),
            spreadsheet_id: spreadsheet_id.into(),
            url_range: url_range.into(),
            sheet_name,
            start_row,
        })
    }

    /// Reads the configured range and keeps only rows holding an
    /// absolute http(s) URL. Malformed entries are dropped with a
    /// warning; their row positions are not reused, so metadata for
    /// the remaining rows still lands where it belongs.
    pub async fn read_url_rows(&self) -> anyhow::Result<Vec<UrlRow>> {
        let range = self.url_range.clone();
        let values = self.get_values_with_retry(&range).await?;
        Ok(parse_url_rows(values))
    }

    /// True iff all three metadata cells of the row are non-empty.
    pub async fn is_processed(&self, row_index: usize) -> anyhow::Result<bool> {
        let range = self.metadata_range(row_index);
        let values = self.get_values_with_retry(&range).await?;
        let row = match values.first() {
            Some(r) => r,
            None => return Ok(false),
        };
        Ok(row.len() == 3 && row.iter().all(|v| !cell_str(v).is_empty()))
    }

    pub async fn update_metadata(
        &self,
        row_index: usize,
        metadata: &RowMetadata,
    ) -> anyhow::Result<()> {
        let range = self.metadata_range(row_index);
        let url = format!(
            "{}/v4/spreadsheets/{}/values/{}?valueInputOption=USER_ENTERED",
            self.base_url,
            self.spreadsheet_id,
            urlencoding::encode(&range)
        );
        let body = json!({
            "range": range,
            "majorDimension": "ROWS",
            "values": [[metadata.title, metadata.link, metadata.thumbnail_link]],
        });

        for attempt in 1..=MAX_RETRIES {
            let token = self.auth.token().await?;
            let res = self
                .http
                .put(&url)
                .bearer_auth(token)
                .json(&body)
                .send()
                .await;

            match res {
                Ok(res) if res.status().is_success() => {
                    debug!("metadata written to {}", range);
                    return Ok(());
                }
                Ok(res) => {
                    let status = res.status();
                    let text = res.text().await.unwrap_or_default();
                    warn!(
                        "update attempt {} failed with {}: {}",
                        attempt, status, text
                    );
                }
                Err(e) => warn!("update attempt {} failed: {}", attempt, e),
            }

            if attempt < MAX_RETRIES {
                sleep(linear_backoff(attempt)).await;
            }
        }

        Err(anyhow!(PipelineError::SheetAccess(format!(
            "failed to update {} after {} attempts",
            range, MAX_RETRIES
        ))))
    }

    fn metadata_range(&self, row_index: usize) -> String {
        let row = self.start_row as usize + row_index;
        format!("{}!B{}:D{}", self.sheet_name, row, row)
    }

    async fn get_values_with_retry(
        &self,
        range: &str,
    ) -> anyhow::Result<Vec<Vec<serde_json::Value>>> {
        let url = format!(
            "{}/v4/spreadsheets/{}/values/{}",
            self.base_url,
            self.spreadsheet_id,
            urlencoding::encode(range)
        );

        for attempt in 1..=MAX_RETRIES {
            let token = self.auth.token().await?;
            let res = self.http.get(&url).bearer_auth(token).send().await;

            match res {
                Ok(res) if res.status().is_success() => {
                    let vr: ValueRange = res.json().await.map_err(|e| {
                        PipelineError::SheetAccess(format!("malformed values response: {}", e))
                    })?;
                    return Ok(vr.values);
                }
                Ok(res) => {
                    let status = res.status();
                    warn!("fetch of {} attempt {} failed with {}", range, attempt, status);
                }
                Err(e) => warn!("fetch of {} attempt {} failed: {}", range, attempt, e),
            }

            if attempt < MAX_RETRIES {
                sleep(linear_backoff(attempt)).await;
            }
        }

        Err(anyhow!(PipelineError::SheetAccess(format!(
            "failed to read {} after {} attempts",
            range, MAX_RETRIES
        ))))
    }
}

fn cell_str(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    }
}

pub fn parse_url_rows(values: Vec<Vec<serde_json::Value>>) -> Vec<UrlRow> {
    let mut rows = vec![];
    for (row_index, row) in values.into_iter().enumerate() {
        let cell = match row.first() {
            Some(c) => cell_str(c),
            None => continue,
        };
        if cell.is_empty() {
            continue;
        }
        if is_http_url(&cell) {
            rows.push(UrlRow {
                row_index,
                url: cell,
            });
        } else {
            warn!("skipping invalid URL at row {}: {}", row_index, cell);
        }
    }
    rows
}

/// A range must look like `Sheet!A2:A100`. Returns the sheet name and
/// the 1-based row the range starts at (1 when the range has no row
/// numbers, e.g. `Sheet!A:A`).
fn parse_range(range: &str) -> anyhow::Result<(String, u32)> {
    let (sheet, cells) = range.split_once('!').ok_or_else(|| {
        PipelineError::Configuration(format!("invalid range format (missing '!'): {}", range))
    })?;
    if sheet.is_empty() || cells.is_empty() {
        return Err(anyhow!(PipelineError::Configuration(format!(
            "invalid range format: {}",
            range
        ))));
    }

    let first_cell = cells.split(':').next().unwrap_or(cells);
    let digits: String = first_cell.chars().filter(|c| c.is_ascii_digit()).collect();
    let start_row = if digits.is_empty() {
        1
    } else {
        digits.parse().map_err(|_| {
            PipelineError::Configuration(format!("invalid start row in range: {}", range))
        })?
    };

    Ok((sheet.to_string(), start_row))
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    macro_rules! aw {
        ($e:expr) => {
            tokio_test::block_on($e)
        };
    }

    fn client(base_url: &str) -> SheetsClient {
        SheetsClient::with_base_url(
            Arc::new(Authenticator::fixed("t")),
            "sheet-id",
            "Sheet1!A2:A",
            base_url,
        )
        .unwrap()
    }

    #[test]
    fn range_without_separator_fails_fast() {
        let err = parse_range("Sheet1A2:A").unwrap_err();
        let err = err.downcast_ref::<PipelineError>().unwrap();
        assert!(matches!(err, PipelineError::Configuration(_)));
    }

    #[test]
    fn range_start_row_is_extracted() {
        assert_eq!(parse_range("Sheet1!A2:A100").unwrap(), ("Sheet1".into(), 2));
        assert_eq!(parse_range("Urls!A:A").unwrap(), ("Urls".into(), 1));
    }

    #[test]
    fn malformed_urls_are_dropped_but_rows_keep_their_index() {
        let rows = parse_url_rows(vec![
            vec![json!("https://a.example")],
            vec![json!("not-a-url")],
            vec![json!("https://b.example")],
            vec![json!("")],
        ]);
        assert_eq!(
            rows,
            vec![
                UrlRow {
                    row_index: 0,
                    url: "https://a.example".into()
                },
                UrlRow {
                    row_index: 2,
                    url: "https://b.example".into()
                },
            ]
        );
    }

    #[test]
    fn reads_urls_from_sheet() {
        aw!(async {
            let mut server = mockito::Server::new_async().await;
            let m = server
                .mock(
                    "GET",
                    "/v4/spreadsheets/sheet-id/values/Sheet1%21A2%3AA",
                )
                .with_body(
                    json!({"values": [["https://a.example"], ["nope"], ["https://b.example"]]})
                        .to_string(),
                )
                .create_async()
                .await;

            let rows = client(&server.url()).read_url_rows().await.unwrap();
            m.assert_async().await;
            assert_eq!(rows.len(), 2);
            assert_eq!(rows[1].row_index, 2);
        });
    }

    #[test]
    fn processed_row_needs_all_three_cells() {
        aw!(async {
            let mut server = mockito::Server::new_async().await;
            server
                .mock(
                    "GET",
                    "/v4/spreadsheets/sheet-id/values/Sheet1%21B2%3AD2",
                )
                .with_body(json!({"values": [["Title", "https://link", "https://thumb"]]}).to_string())
                .create_async()
                .await;
            server
                .mock(
                    "GET",
                    "/v4/spreadsheets/sheet-id/values/Sheet1%21B3%3AD3",
                )
                .with_body(json!({"values": [["Title", ""]]}).to_string())
                .create_async()
                .await;

            let c = client(&server.url());
            assert!(c.is_processed(0).await.unwrap());
            assert!(!c.is_processed(1).await.unwrap());
        });
    }

    #[test]
    fn update_writes_as_entered() {
        aw!(async {
            let mut server = mockito::Server::new_async().await;
            let m = server
                .mock(
                    "PUT",
                    "/v4/spreadsheets/sheet-id/values/Sheet1%21B4%3AD4?valueInputOption=USER_ENTERED",
                )
                .match_body(mockito::Matcher::PartialJson(json!({
                    "values": [["Title", "https://link", "https://thumb"]]
                })))
                .with_body("{}")
                .create_async()
                .await;

            client(&server.url())
                .update_metadata(
                    2,
                    &RowMetadata {
                        title: "Title".into(),
                        link: "https://link".into(),
                        thumbnail_link: "https://thumb".into(),
                    },
                )
                .await
                .unwrap();
            m.assert_async().await;
        });
    }
}
