use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that abort a single URL's job (or, for the first two
/// variants, the whole run before any URL is processed).
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("configuration: {0}")]
    Configuration(String),
    #[error("environment: {0}")]
    Environment(String),
    #[error("page load timed out for {url} (last title: {title:?})")]
    PageLoadTimeout { url: String, title: String },
    #[error("capture failed: {0}")]
    Capture(String),
    #[error("upload: {0}")]
    Upload(#[from] UploadError),
    #[error("sheet access: {0}")]
    SheetAccess(String),
}

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("file size {size} bytes exceeds limit of {limit} bytes")]
    SizeLimitExceeded { size: u64, limit: u64 },
    #[error("file is empty, nothing to upload")]
    EmptyFile,
    #[error("destination folder not found or not accessible: {0}")]
    FolderNotFound(String),
    #[error("transient upload error: {0}")]
    Transient(String),
}

impl UploadError {
    pub fn is_transient(&self) -> bool {
        matches!(self, UploadError::Transient(_))
    }
}

/// A validated URL together with its 0-based position inside the
/// configured source range. The row index survives filtering so that
/// metadata always lands next to the cell it was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlRow {
    pub row_index: usize,
    pub url: String,
}

/// The three cells written back into the spreadsheet row. A row is
/// considered done iff all three are present and non-empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowMetadata {
    pub title: String,
    pub link: String,
    pub thumbnail_link: String,
}

/// Reference to the uploaded artifact as Drive reports it.
#[derive(Debug, Clone)]
pub struct RemoteArtifact {
    pub id: String,
    pub web_view_link: String,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RunSummary {
    pub successful: usize,
    pub failed: usize,
    pub total: usize,
}

/// Cookie entry as exported to the local cookies JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub secure: Option<bool>,
    #[serde(rename = "httpOnly", default)]
    pub http_only: Option<bool>,
    #[serde(rename = "expirationDate", default)]
    pub expiration_date: Option<f64>,
}

impl StoredCookie {
    /// Cookie domains may carry a leading dot ("subdomain wildcard");
    /// grouping strips it so `.example.com` and `example.com` land in
    /// the same bucket.
    pub fn root_domain(&self) -> String {
        self.domain.trim_start_matches('.').to_string()
    }
}

pub fn group_cookies_by_domain(cookies: Vec<StoredCookie>) -> HashMap<String, Vec<StoredCookie>> {
    let mut groups: HashMap<String, Vec<StoredCookie>> = HashMap::new();
    for cookie in cookies {
        let domain = cookie.root_domain();
        if domain.is_empty() {
            warn!("skipping cookie {} with empty domain", cookie.name);
            continue;
        }
        groups.entry(domain).or_default().push(cookie);
    }
    groups
}

#[cfg(test)]
mod test {
    use super::*;

    fn cookie(name: &str, domain: &str) -> StoredCookie {
        StoredCookie {
            name: name.into(),
            value: "v".into(),
            domain: domain.into(),
            path: None,
            secure: None,
            http_only: None,
            expiration_date: None,
        }
    }

    #[test]
    fn groups_cookies_by_root_domain() {
        let groups = group_cookies_by_domain(vec![
            cookie("a", ".example.com"),
            cookie("b", "example.com"),
            cookie("c", "other.org"),
            cookie("d", ""),
        ]);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups.get("example.com").unwrap().len(), 2);
        assert_eq!(groups.get("other.org").unwrap().len(), 1);
    }

    #[test]
    fn parses_exported_cookie_json() {
        let raw = r#"{
            "name": "session",
            "value": "abc",
            "domain": ".example.com",
            "path": "/",
            "secure": true,
            "httpOnly": false,
            "expirationDate": 1893456000.5
        }"#;
        let c: StoredCookie = serde_json::from_str(raw).unwrap();
        assert_eq!(c.root_domain(), "example.com");
        assert_eq!(c.expiration_date, Some(1893456000.5));
    }
}
