//! Google credentials and OAuth2 access tokens.
//!
//! Credentials come from a [`CredentialSource`]: either an explicit JSON file
//! or ambient discovery, which checks, in order,
//!
//! 1. the file named by `GOOGLE_APPLICATION_CREDENTIALS`,
//! 2. the gcloud application-default file
//!    (`$HOME/.config/gcloud/application_default_credentials.json`),
//! 3. the GCE metadata server.
//!
//! The process environment is only read, never written.
//!
//! Two file types are understood: `service_account` keys (JWT bearer grant,
//! signed RS256) and `authorized_user` files produced by
//! `gcloud auth application-default login` (refresh-token grant).

use crate::error::{LoaderError, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use parking_lot::Mutex;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// OAuth2 scope needed for BigQuery jobs and table metadata.
pub const BIGQUERY_SCOPE: &str = "https://www.googleapis.com/auth/bigquery";

/// Environment variable naming a credential file.
pub const CREDENTIALS_ENV: &str = "GOOGLE_APPLICATION_CREDENTIALS";

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

const METADATA_PROJECT_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/project/project-id";

/// How long ambient discovery waits for the metadata server.
const METADATA_PROBE_TIMEOUT_SECS: u64 = 3;

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Lifetime requested for service-account assertions, in seconds.
const ASSERTION_LIFETIME_SECS: i64 = 3600;

/// Tokens are refreshed this long before they expire.
const EXPIRY_MARGIN_SECS: i64 = 60;

/// Where credentials come from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CredentialSource {
    /// An explicit credential JSON file.
    File(PathBuf),
    /// Environment variable, gcloud well-known file, then metadata server.
    #[default]
    Ambient,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum CredentialFile {
    ServiceAccount(ServiceAccountKey),
    AuthorizedUser(AuthorizedUser),
}

#[derive(Debug, Clone, Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    #[serde(default)]
    private_key_id: Option<String>,
    #[serde(default)]
    project_id: Option<String>,
    #[serde(default)]
    token_uri: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct AuthorizedUser {
    client_id: String,
    client_secret: String,
    refresh_token: String,
    #[serde(default)]
    quota_project_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

impl ServiceAccountKey {
    fn token_uri(&self) -> &str {
        self.token_uri.as_deref().unwrap_or(DEFAULT_TOKEN_URI)
    }

    /// Signed JWT asserting this service account for [`BIGQUERY_SCOPE`].
    fn assertion(&self, now: DateTime<Utc>) -> Result<String> {
        let claims = AssertionClaims {
            iss: &self.client_email,
            scope: BIGQUERY_SCOPE,
            aud: self.token_uri(),
            iat: now.timestamp(),
            exp: now.timestamp() + ASSERTION_LIFETIME_SECS,
        };

        let mut header = Header::new(Algorithm::RS256);
        header.kid = self.private_key_id.clone();

        let key = EncodingKey::from_rsa_pem(self.private_key.as_bytes()).map_err(|e| {
            LoaderError::Credentials(format!("invalid service account private key: {}", e))
        })?;

        jsonwebtoken::encode(&header, &claims, &key)
            .map_err(|e| LoaderError::Credentials(format!("failed to sign assertion: {}", e)))
    }
}

#[derive(Debug, Clone)]
enum CredentialKind {
    ServiceAccount(ServiceAccountKey),
    AuthorizedUser(AuthorizedUser),
    Metadata { project: String },
}

/// Loaded credentials, ready to be exchanged for access tokens.
#[derive(Debug, Clone)]
pub struct Credentials {
    kind: CredentialKind,
    origin: String,
}

impl Credentials {
    /// Load credentials from a source.
    pub fn load(source: &CredentialSource) -> Result<Self> {
        match source {
            CredentialSource::File(path) => Self::from_file(path),
            CredentialSource::Ambient => Self::discover(
                std::env::var_os(CREDENTIALS_ENV).map(PathBuf::from),
                well_known_file(),
                || metadata_project(METADATA_PROJECT_URL),
            ),
        }
    }

    /// Parse a credential JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            LoaderError::Credentials(format!("cannot read '{}': {}", path.display(), e))
        })?;
        Self::from_json(&contents, path.display().to_string())
    }

    fn from_json(contents: &str, origin: String) -> Result<Self> {
        let file: CredentialFile = serde_json::from_str(contents).map_err(|e| {
            LoaderError::Credentials(format!("unsupported credential file '{}': {}", origin, e))
        })?;

        let kind = match file {
            CredentialFile::ServiceAccount(key) => CredentialKind::ServiceAccount(key),
            CredentialFile::AuthorizedUser(user) => CredentialKind::AuthorizedUser(user),
        };

        Ok(Self { kind, origin })
    }

    /// Ambient discovery with the environment lookups already done.
    ///
    /// `metadata` is only called when no credential file is found; its
    /// failure means there are no credentials at all.
    fn discover(
        env_path: Option<PathBuf>,
        well_known: Option<PathBuf>,
        metadata: impl FnOnce() -> Result<String>,
    ) -> Result<Self> {
        if let Some(path) = env_path {
            debug!("Using credentials from {}", CREDENTIALS_ENV);
            return Self::from_file(&path);
        }

        if let Some(path) = well_known.filter(|p| p.is_file()) {
            debug!("Using gcloud application-default credentials");
            return Self::from_file(&path);
        }

        debug!("No credential file found, trying the metadata server");
        let project = metadata().map_err(|e| {
            LoaderError::Credentials(format!(
                "no credentials found: set {} or pass --credentials ({})",
                CREDENTIALS_ENV, e
            ))
        })?;

        Ok(Self {
            kind: CredentialKind::Metadata { project },
            origin: "metadata server".to_string(),
        })
    }

    /// Project recorded in the credential file, if any.
    pub fn project_id(&self) -> Option<&str> {
        match &self.kind {
            CredentialKind::ServiceAccount(key) => key.project_id.as_deref(),
            CredentialKind::AuthorizedUser(user) => user.quota_project_id.as_deref(),
            CredentialKind::Metadata { project } => Some(project.as_str()),
        }
        .filter(|p| !p.is_empty())
    }

    /// Where these credentials were loaded from, for logging.
    pub fn origin(&self) -> &str {
        &self.origin
    }
}

/// Ask the metadata server at `url` for the instance's project id.
fn metadata_project(url: &str) -> Result<String> {
    let failed = |e: &dyn std::fmt::Display| {
        LoaderError::Credentials(format!("metadata server unreachable: {}", e))
    };

    let response = Client::builder()
        .timeout(Duration::from_secs(METADATA_PROBE_TIMEOUT_SECS))
        .build()
        .map_err(|e| failed(&e))?
        .get(url)
        .header("Metadata-Flavor", "Google")
        .send()
        .map_err(|e| failed(&e))?;

    let status = response.status();
    if !status.is_success() {
        return Err(LoaderError::Credentials(format!(
            "metadata server returned {}",
            status
        )));
    }

    let project = response.text().map_err(|e| failed(&e))?;
    Ok(project.trim().to_string())
}

/// `$HOME/.config/gcloud/application_default_credentials.json`, or the
/// `%APPDATA%` equivalent on Windows.
fn well_known_file() -> Option<PathBuf> {
    let base = if cfg!(windows) {
        std::env::var_os("APPDATA").map(PathBuf::from)
    } else {
        std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config"))
    };
    base.map(|dir| dir.join("gcloud").join("application_default_credentials.json"))
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: DateTime<Utc>,
}

/// Exchanges [`Credentials`] for bearer tokens and caches them for the run.
pub struct AccessTokenProvider {
    credentials: Credentials,
    http: Client,
    cached: Mutex<Option<CachedToken>>,
}

static_assertions::assert_impl_all!(AccessTokenProvider: Send, Sync);

impl AccessTokenProvider {
    pub fn new(credentials: Credentials, http: Client) -> Self {
        Self {
            credentials,
            http,
            cached: Mutex::new(None),
        }
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// A valid access token, fetched on first use and when close to expiry.
    pub fn token(&self) -> Result<String> {
        let mut cached = self.cached.lock();
        let now = Utc::now();

        if let Some(token) = cached.as_ref()
            && token.expires_at - ChronoDuration::seconds(EXPIRY_MARGIN_SECS) > now
        {
            return Ok(token.value.clone());
        }

        let response = self.fetch(now)?;
        let expires_at = now + ChronoDuration::seconds(response.expires_in.unwrap_or(3600));
        info!("Obtained access token from {}", self.credentials.origin());

        *cached = Some(CachedToken {
            value: response.access_token.clone(),
            expires_at,
        });
        Ok(response.access_token)
    }

    fn fetch(&self, now: DateTime<Utc>) -> Result<TokenResponse> {
        let request = match &self.credentials.kind {
            CredentialKind::ServiceAccount(key) => {
                let assertion = key.assertion(now)?;
                self.http.post(key.token_uri()).form(&[
                    ("grant_type", JWT_BEARER_GRANT),
                    ("assertion", assertion.as_str()),
                ])
            }
            CredentialKind::AuthorizedUser(user) => self.http.post(DEFAULT_TOKEN_URI).form(&[
                ("grant_type", "refresh_token"),
                ("client_id", user.client_id.as_str()),
                ("client_secret", user.client_secret.as_str()),
                ("refresh_token", user.refresh_token.as_str()),
            ]),
            CredentialKind::Metadata { .. } => self
                .http
                .get(METADATA_TOKEN_URL)
                .header("Metadata-Flavor", "Google"),
        };

        let response = request.send().map_err(|e| {
            LoaderError::Credentials(format!(
                "token request for {} failed: {}",
                self.credentials.origin(),
                e
            ))
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(LoaderError::Credentials(format!(
                "token endpoint returned {}: {}",
                status, body
            )));
        }

        response
            .json::<TokenResponse>()
            .map_err(|e| LoaderError::Credentials(format!("malformed token response: {}", e)))
    }
}
