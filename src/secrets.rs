// src/secrets.rs

use crate::endpoints::Endpoints;
use crate::error::SecretError;
use crate::util::until_cancelled;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Secret Manager access using a fixed bearer token and project.
///
/// Every call is a fresh round trip. Nothing is cached, so two variables
/// pointing at the same secret version cost two requests.
pub struct Client {
    http: reqwest::Client,
    endpoints: Endpoints,
    access_token: String,
    project_id: String,
}

#[derive(Debug, Deserialize)]
struct AccessResponse {
    #[serde(default)]
    payload: Payload,
}

#[derive(Debug, Default, Deserialize)]
struct Payload {
    #[serde(default)]
    data: String,
}

impl Client {
    pub fn new(endpoints: Endpoints, access_token: &str, project_id: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoints,
            access_token: access_token.to_string(),
            project_id: project_id.to_string(),
        }
    }

    /// `projects/{project}/secrets/{name}/versions/{version}`
    pub fn secret_path(&self, secret_name: &str, version: &str) -> String {
        format!(
            "projects/{}/secrets/{}/versions/{}",
            self.project_id, secret_name, version
        )
    }

    /// Fetch and decode a secret version.
    ///
    /// The payload is returned as raw bytes; Secret Manager does not require
    /// it to be text. An empty payload is an error: Secret Manager cannot tell
    /// a zero-length secret apart from a missing one.
    pub async fn access_secret_version(
        &self,
        cancel: &CancellationToken,
        secret_name: &str,
        version: &str,
    ) -> Result<Vec<u8>, SecretError> {
        let secret_path = self.secret_path(secret_name, version);
        let url = self.endpoints.secret_access_url(&secret_path);

        debug!(secret = %secret_path, "accessing secret version");

        let request = async {
            let resp = self
                .http
                .get(&url)
                .bearer_auth(&self.access_token)
                .timeout(REQUEST_TIMEOUT)
                .send()
                .await
                .map_err(|source| SecretError::Http {
                    secret: secret_path.clone(),
                    source,
                })?;

            let status = resp.status();
            if !status.is_success() {
                return Err(SecretError::Status {
                    secret: secret_path.clone(),
                    status: status.as_u16(),
                });
            }

            resp.json::<AccessResponse>()
                .await
                .map_err(|source| SecretError::Envelope {
                    secret: secret_path.clone(),
                    source,
                })
        };

        let body = until_cancelled(cancel, request)
            .await
            .ok_or_else(|| SecretError::Cancelled(secret_path.clone()))??;

        if body.payload.data.is_empty() {
            return Err(SecretError::Empty(secret_path));
        }

        STANDARD
            .decode(body.payload.data.as_bytes())
            .map_err(|source| SecretError::Decode {
                secret: secret_path,
                source,
            })
    }
}
