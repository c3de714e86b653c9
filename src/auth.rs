use std::{path::Path, time::Duration};

use anyhow::{anyhow, Context};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::{types::PipelineError, utils::get_unix_timestamp};

const SCOPES: &str =
    "https://www.googleapis.com/auth/drive https://www.googleapis.com/auth/spreadsheets";
const TOKEN_LIFETIME_SECS: u64 = 3600;
// tokens are refreshed this long before they actually expire
const EXPIRY_SLACK_SECS: u64 = 60;

#[derive(Debug, Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    token_uri: String,
}

#[derive(Debug, Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: u64,
    exp: u64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    token: String,
    expires_at: u64,
}

enum TokenSource {
    ServiceAccount {
        key: ServiceAccountKey,
        signing_key: EncodingKey,
    },
    // static token, used by tests and by callers that manage auth themselves
    Fixed(String),
}

/// Shared token source for the Sheets and Drive clients. One
/// service-account JWT grant covers both scopes; the resulting access
/// token is cached until shortly before expiry.
pub struct Authenticator {
    source: TokenSource,
    http: Client,
    cached: Mutex<Option<CachedToken>>,
}

impl Authenticator {
    pub fn from_key_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Configuration(format!(
                "could not read credentials file {:?}: {}",
                path, e
            ))
        })?;
        let key: ServiceAccountKey = serde_json::from_str(&raw).map_err(|e| {
            PipelineError::Configuration(format!("malformed service account key: {}", e))
        })?;
        let signing_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .context("service account private key is not a valid RSA PEM")?;

        Ok(Authenticator {
            source: TokenSource::ServiceAccount { key, signing_key },
            http: Client::new(),
            cached: Mutex::new(None),
        })
    }

    pub fn fixed(token: &str) -> Self {
        Authenticator {
            source: TokenSource::Fixed(token.into()),
            http: Client::new(),
            cached: Mutex::new(None),
        }
    }

    pub async fn token(&self) -> anyhow::Result<String> {
        let (key, signing_key) = match &self.source {
            TokenSource::Fixed(token) => return Ok(token.clone()),
            TokenSource::ServiceAccount { key, signing_key } => (key, signing_key),
        };

        let mut cached = self.cached.lock().await;
        let now = get_unix_timestamp().as_secs();
        if let Some(c) = cached.as_ref() {
            if now + EXPIRY_SLACK_SECS < c.expires_at {
                return Ok(c.token.clone());
            }
        }

        let claims = Claims {
            iss: &key.client_email,
            scope: SCOPES,
            aud: &key.token_uri,
            iat: now,
            exp: now + TOKEN_LIFETIME_SECS,
        };
        let assertion = encode(&Header::new(Algorithm::RS256), &claims, signing_key)
            .context("could not sign service account assertion")?;

        let res = self
            .http
            .post(&key.token_uri)
            .timeout(Duration::from_secs(20))
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await
            .context("token exchange request failed")?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("token exchange failed with {}: {}", status, body));
        }

        let token: TokenResponse = res.json().await.context("malformed token response")?;
        debug!(
            "obtained access token for {} (expires in {}s)",
            key.client_email, token.expires_in
        );

        *cached = Some(CachedToken {
            token: token.access_token.clone(),
            expires_at: now + token.expires_in,
        });
        Ok(token.access_token)
    }
}
