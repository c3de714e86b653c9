use std::{collections::HashMap, fs, path::PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::types::RowMetadata;

pub const DEFAULT_TRACKING_FILE: &str = "processed_urls.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedEntry {
    pub processed_at: String,
    #[serde(default)]
    pub metadata: Option<RowMetadata>,
}

/// Auxiliary JSON-backed record of successfully processed URLs.
///
/// Write-only from the pipeline's point of view: the spreadsheet row's
/// three-cell completeness check stays the sole idempotency marker, so
/// this cache is never consulted to gate processing. It exists for
/// after-the-fact inspection of what a run did.
pub struct UrlTracker {
    tracking_file: PathBuf,
    processed: HashMap<String, ProcessedEntry>,
}

impl UrlTracker {
    pub fn new(tracking_file: PathBuf) -> Self {
        let processed = Self::load(&tracking_file);
        UrlTracker {
            tracking_file,
            processed,
        }
    }

    fn load(path: &PathBuf) -> HashMap<String, ProcessedEntry> {
        if !path.exists() {
            return HashMap::new();
        }
        match fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(map) => map,
                Err(e) => {
                    error!("error loading processed URLs: {}", e);
                    HashMap::new()
                }
            },
            Err(e) => {
                error!("error loading processed URLs: {}", e);
                HashMap::new()
            }
        }
    }

    pub fn is_processed(&self, url: &str) -> bool {
        self.processed.contains_key(url)
    }

    pub fn get_metadata(&self, url: &str) -> Option<&RowMetadata> {
        self.processed.get(url).and_then(|e| e.metadata.as_ref())
    }

    pub fn mark_processed(&mut self, url: &str, metadata: Option<RowMetadata>) {
        self.processed.insert(
            url.to_string(),
            ProcessedEntry {
                processed_at: Utc::now().to_rfc3339(),
                metadata,
            },
        );
        self.save();
    }

    fn save(&self) {
        let raw = match serde_json::to_string_pretty(&self.processed) {
            Ok(raw) => raw,
            Err(e) => {
                error!("error serializing processed URLs: {}", e);
                return;
            }
        };
        if let Err(e) = fs::write(&self.tracking_file, raw) {
            error!("error saving processed URLs: {}", e);
        }
    }
}
