use std::{
    fs,
    path::PathBuf,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use chrono::Local;
use rand::{distributions::Alphanumeric, thread_rng, Rng};
use reqwest::Url;

pub const DEFAULT_STAGING_DIR: &str = "screenshots";
pub const FILENAME_TS_FORMAT: &str = "%Y%m%d_%H%M%S";

const MAX_HOST_CHARS: usize = 50;

/// `screenshot_<timestamp>_<sanitized-host>.png`
pub fn screenshot_filename(url: &str) -> String {
    let host = Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_string()))
        .unwrap_or_default();
    let ts = Local::now().format(FILENAME_TS_FORMAT);
    format!("screenshot_{}_{}.png", ts, sanitize_host(&host))
}

pub fn sanitize_host(host: &str) -> String {
    host.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .take(MAX_HOST_CHARS)
        .collect()
}

pub fn is_http_url(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://")
}

/// Backoff before the `count`-th retry of a failed job: 2, 4, 8, ...
pub fn retry_backoff(count: u32) -> Duration {
    Duration::from_secs(2u64.pow(count))
}

/// Linear backoff used by the Sheets and Drive metadata calls.
pub fn linear_backoff(attempt: u32) -> Duration {
    Duration::from_secs(2 * attempt as u64)
}

pub fn jitter(duration: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    duration.mul_f64(rng.gen_range(1.0..1.5))
}

pub fn get_unix_timestamp() -> Duration {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap()
}

pub fn get_random_string(len: i32) -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len as usize)
        .map(char::from)
        .collect()
}

pub fn create_random_tmp_folder() -> anyhow::Result<PathBuf> {
    let rand_folder_name: String = get_random_string(11);

    let path = PathBuf::from(format!("/tmp/sheetshot-{}", rand_folder_name));
    fs::create_dir(&path)?;
    Ok(path)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn filename_has_sanitized_host() {
        let name = screenshot_filename("https://sub.example.com:8080/page?q=1");
        assert!(name.starts_with("screenshot_"));
        assert!(name.ends_with("_sub.example.com.png"));
    }

    #[test]
    fn sanitize_replaces_and_truncates() {
        assert_eq!(sanitize_host("www.ex ample.com"), "www.ex_ample.com");
        let long = "a".repeat(80);
        assert_eq!(sanitize_host(&long).len(), 50);
    }

    #[test]
    fn filename_tolerates_unparseable_url() {
        let name = screenshot_filename("not a url");
        assert!(name.starts_with("screenshot_"));
        assert!(name.ends_with("_.png"));
    }

    #[test]
    fn url_scheme_check() {
        assert!(is_http_url("https://a.example"));
        assert!(is_http_url("http://a.example"));
        assert!(!is_http_url("ftp://a.example"));
        assert!(!is_http_url("not-a-url"));
    }

    #[test]
    fn backoff_sequence_doubles() {
        let delays: Vec<u64> = (1..=3).map(|c| retry_backoff(c).as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8]);
    }

    #[test]
    fn linear_backoff_grows_by_two() {
        assert_eq!(linear_backoff(1).as_secs(), 2);
        assert_eq!(linear_backoff(2).as_secs(), 4);
        assert_eq!(linear_backoff(3).as_secs(), 6);
    }

    #[test]
    fn creates_a_random_folder() {
        let p = create_random_tmp_folder().unwrap();
        assert!(p.exists());
        fs::remove_dir(p).unwrap();
    }
}
