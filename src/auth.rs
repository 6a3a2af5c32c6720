// src/auth.rs

//! Service account impersonation.
//!
//! Turns the caller's local gcloud application default credentials into:
//! - an impersonated access token, used in-process (Secret Manager calls)
//! - a temporary `impersonated_service_account` credentials file, handed to
//!   the child process through `GOOGLE_APPLICATION_CREDENTIALS` so Google
//!   client libraries can mint their own tokens as the service account.
//!
//! The credentials file is owned by [`Credentials`] and removed by
//! [`Credentials::release`].

use crate::endpoints::{delegate_name, Endpoints, CLOUD_PLATFORM_SCOPE};
use crate::error::{AuthError, CleanupError};
use crate::util::{install_crypto_provider, random_lower, until_cancelled};

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use yup_oauth2::authorized_user::AuthorizedUserSecret;
use yup_oauth2::{AuthorizedUserAuthenticator, ServiceAccountAuthenticator, ServiceAccountKey};

const ADC_FILE_NAME: &str = "application_default_credentials.json";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Where the caller's standing credentials live.
///
/// gcloud stores them in `~/.config/gcloud/` on all platforms unless
/// `CLOUDSDK_CONFIG` points elsewhere.
#[derive(Debug, Clone)]
pub struct CredentialSource {
    config_dir: PathBuf,
}

impl CredentialSource {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }

    /// Resolve the gcloud config directory from the process environment.
    pub fn from_env() -> Result<Self, AuthError> {
        let override_dir = std::env::var_os("CLOUDSDK_CONFIG").filter(|v| !v.is_empty());
        Self::resolve(override_dir.map(PathBuf::from), dirs::home_dir())
    }

    fn resolve(override_dir: Option<PathBuf>, home: Option<PathBuf>) -> Result<Self, AuthError> {
        if let Some(dir) = override_dir {
            return Ok(Self::new(dir));
        }

        let home = home.ok_or(AuthError::NoConfigDir)?;
        Ok(Self::new(home.join(".config").join("gcloud")))
    }

    pub fn adc_path(&self) -> PathBuf {
        self.config_dir.join(ADC_FILE_NAME)
    }

    /// Read the application default credentials document.
    fn load(&self) -> Result<StandingCredentials, AuthError> {
        let path = self.adc_path();

        let text = match std::fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AuthError::Unauthenticated(path));
            }
            Err(source) => return Err(AuthError::ReadStandingCredentials { path, source }),
        };

        let parse_err = |source| AuthError::ParseStandingCredentials {
            path: path.clone(),
            source,
        };

        let raw: Box<RawValue> = serde_json::from_str(&text).map_err(parse_err)?;
        let doc_type: DocumentType = serde_json::from_str(raw.get()).map_err(parse_err)?;

        let caller = match doc_type.kind.as_str() {
            "authorized_user" => {
                CallerCredential::AuthorizedUser(serde_json::from_str(raw.get()).map_err(parse_err)?)
            }
            "service_account" => {
                CallerCredential::ServiceAccount(serde_json::from_str(raw.get()).map_err(parse_err)?)
            }
            other => return Err(AuthError::UnsupportedCredentialType(other.to_string())),
        };

        debug!(path = %path.display(), kind = %doc_type.kind, "loaded application default credentials");

        Ok(StandingCredentials { raw, caller })
    }
}

/// The caller's own credentials: verbatim for embedding, parsed for token minting.
struct StandingCredentials {
    raw: Box<RawValue>,
    caller: CallerCredential,
}

enum CallerCredential {
    /// Written by `gcloud auth application-default login`
    AuthorizedUser(AuthorizedUserSecret),

    /// A service account key file
    ServiceAccount(ServiceAccountKey),
}

#[derive(Debug, Deserialize)]
struct DocumentType {
    #[serde(rename = "type", default)]
    kind: String,
}

#[derive(Debug, Serialize)]
struct GenerateAccessTokenRequest {
    delegates: Vec<String>,
    scope: Vec<&'static str>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateAccessTokenResponse {
    #[serde(default)]
    access_token: String,
}

/// Layout of the credentials file consumed by Google client libraries.
#[derive(Debug, Serialize)]
struct ImpersonatedCredentialsFile<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    service_account_impersonation_url: String,
    delegates: Vec<String>,
    source_credentials: &'a RawValue,
}

/// Impersonated credentials for one invocation.
///
/// Owns the temporary credentials file. Call [`Credentials::release`] once all
/// users are done; dropping without releasing still removes the file but can
/// only log failures.
#[derive(Debug)]
pub struct Credentials {
    /// Access token of the impersonated service account
    pub access_token: String,

    creds_file: Option<PathBuf>,
}

impl Credentials {
    /// Path of the credentials file, if it still exists.
    pub fn creds_file(&self) -> Option<&Path> {
        self.creds_file.as_deref()
    }

    /// Remove the credentials file.
    ///
    /// Safe to call more than once; later calls do nothing.
    pub fn release(&mut self) -> Result<(), CleanupError> {
        let Some(path) = self.creds_file.take() else {
            return Ok(());
        };

        debug!(path = %path.display(), "removing credentials file");
        std::fs::remove_file(&path).map_err(|source| CleanupError { path, source })
    }
}

impl Drop for Credentials {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("{e}: {}", e.source);
        }
    }
}

/// Obtains impersonated credentials for a target service account.
pub struct Broker {
    http: reqwest::Client,
    source: CredentialSource,
    endpoints: Endpoints,
    temp_dir: PathBuf,
}

impl Broker {
    pub fn new(source: CredentialSource, endpoints: Endpoints) -> Self {
        install_crypto_provider();

        Self {
            http: reqwest::Client::new(),
            source,
            endpoints,
            temp_dir: std::env::temp_dir(),
        }
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    /// Write credentials files somewhere other than the platform temp dir.
    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = dir.into();
        self
    }

    /// Impersonate `service_account` using the caller's standing credentials.
    pub async fn acquire(
        &self,
        cancel: &CancellationToken,
        service_account: &str,
    ) -> Result<Credentials, AuthError> {
        let StandingCredentials { raw, caller } = self.source.load()?;

        let caller_token = self.caller_token(cancel, caller).await?;
        let access_token = self
            .generate_access_token(cancel, &caller_token, service_account)
            .await?;

        if cancel.is_cancelled() {
            return Err(AuthError::Cancelled);
        }
        let creds_file = self.write_creds_file(&raw, service_account)?;

        Ok(Credentials {
            access_token,
            creds_file: Some(creds_file),
        })
    }

    /// Mint a cloud-platform access token for the caller's own identity.
    async fn caller_token(
        &self,
        cancel: &CancellationToken,
        caller: CallerCredential,
    ) -> Result<String, AuthError> {
        let scopes = [CLOUD_PLATFORM_SCOPE];

        let request = async {
            let token = match caller {
                CallerCredential::AuthorizedUser(secret) => {
                    AuthorizedUserAuthenticator::builder(secret)
                        .build()
                        .await
                        .map_err(AuthError::Authenticator)?
                        .token(&scopes)
                        .await
                }
                CallerCredential::ServiceAccount(key) => {
                    ServiceAccountAuthenticator::builder(key)
                        .build()
                        .await
                        .map_err(AuthError::Authenticator)?
                        .token(&scopes)
                        .await
                }
            };

            token.map_err(AuthError::CallerToken)
        };

        let token = until_cancelled(cancel, request)
            .await
            .ok_or(AuthError::Cancelled)??;

        match token.token() {
            Some(t) if !t.is_empty() => Ok(t.to_string()),
            _ => Err(AuthError::EmptyToken("oauth2 token endpoint")),
        }
    }

    /// Ask IAM Credentials for an access token of `service_account`.
    async fn generate_access_token(
        &self,
        cancel: &CancellationToken,
        caller_token: &str,
        service_account: &str,
    ) -> Result<String, AuthError> {
        let url = self.endpoints.impersonation_url(service_account);
        let body = GenerateAccessTokenRequest {
            delegates: vec![delegate_name(service_account)],
            scope: vec![CLOUD_PLATFORM_SCOPE],
        };

        debug!(service_account, "requesting impersonated access token");

        let request = async {
            let resp = self
                .http
                .post(&url)
                .bearer_auth(caller_token)
                .json(&body)
                .timeout(REQUEST_TIMEOUT)
                .send()
                .await
                .map_err(|source| AuthError::Http {
                    endpoint: "generateAccessToken",
                    source,
                })?;

            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(AuthError::Impersonation {
                    status: status.as_u16(),
                    body,
                });
            }

            resp.json::<GenerateAccessTokenResponse>()
                .await
                .map_err(|source| AuthError::Http {
                    endpoint: "generateAccessToken",
                    source,
                })
        };

        let token = until_cancelled(cancel, request)
            .await
            .ok_or(AuthError::Cancelled)??;

        if token.access_token.is_empty() {
            return Err(AuthError::EmptyToken("generateAccessToken"));
        }
        Ok(token.access_token)
    }

    /// Write the delegated credentials file, readable by the owner only.
    fn write_creds_file(
        &self,
        source_credentials: &RawValue,
        service_account: &str,
    ) -> Result<PathBuf, AuthError> {
        let doc = ImpersonatedCredentialsFile {
            kind: "impersonated_service_account",
            service_account_impersonation_url: self.endpoints.impersonation_url(service_account),
            delegates: vec![delegate_name(service_account)],
            source_credentials,
        };
        let bytes = serde_json::to_vec(&doc).map_err(AuthError::SerialiseArtifact)?;

        let path = self
            .temp_dir
            .join(format!("cloudrun-local-creds-{}.json", random_lower(8)));

        write_private(&path, &bytes).map_err(|source| AuthError::WriteArtifact {
            path: path.clone(),
            source,
        })?;

        debug!(path = %path.display(), "wrote impersonated credentials file");
        Ok(path)
    }
}

fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut opts = std::fs::OpenOptions::new();
    opts.write(true).create_new(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }

    let mut file = opts.open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}
