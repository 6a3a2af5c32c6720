// src/resolver.rs

//! Environment resolution.
//!
//! Builds the `NAME=VALUE` list a Cloud Run container would see, in this
//! order:
//! 1. `K_SERVICE` (only when the descriptor has a name)
//! 2. `K_REVISION=local`
//! 3. `GOOGLE_CLOUD_PROJECT`
//! 4. `GOOGLE_APPLICATION_CREDENTIALS` (the impersonated credentials file)
//! 5. container env, in declaration order
//!
//! The resolver owns the impersonated credentials for its whole lifetime.
//! The caller must run [`Resolver::cleanup`] on every exit path.

use crate::auth::{Broker, Credentials};
use crate::config::Config;
use crate::endpoints::Endpoints;
use crate::error::{AuthError, CleanupError, ResolveError};
use crate::secrets;
use crate::util::os_string_from_bytes;

use std::ffi::OsString;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// One resolved variable.
///
/// Values are bytes because secret payloads need not be UTF-8.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvEntry {
    pub name: String,
    pub value: Vec<u8>,
}

impl EnvEntry {
    pub fn new(name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// `NAME=VALUE`, as printed.
    pub fn line(&self) -> Vec<u8> {
        let mut line = Vec::with_capacity(self.name.len() + 1 + self.value.len());
        line.extend_from_slice(self.name.as_bytes());
        line.push(b'=');
        line.extend_from_slice(&self.value);
        line
    }

    pub fn into_os_pair(self) -> (OsString, OsString) {
        (OsString::from(self.name), os_string_from_bytes(self.value))
    }
}

pub struct Resolver {
    config: Config,
    creds: Credentials,
    endpoints: Endpoints,
}

impl Resolver {
    /// Impersonate the descriptor's service account.
    ///
    /// This performs network calls and writes the credentials file. Secret
    /// Manager is reached through the same endpoints as the broker.
    pub async fn new(
        cancel: &CancellationToken,
        broker: &Broker,
        config: Config,
    ) -> Result<Self, AuthError> {
        let creds = broker.acquire(cancel, &config.service_account).await?;

        info!(
            service_account = %config.service_account,
            project = %config.project_id,
            "impersonating service account"
        );

        Ok(Self {
            config,
            creds,
            endpoints: broker.endpoints().clone(),
        })
    }

    /// Resolve all environment variables, in Cloud Run order.
    ///
    /// Any secret failure aborts the whole resolution; no partial list is
    /// returned.
    pub async fn resolve(&self, cancel: &CancellationToken) -> Result<Vec<EnvEntry>, ResolveError> {
        let cfg = &self.config;
        let mut result = Vec::with_capacity(cfg.env.len() + 4);

        if !cfg.service_name.is_empty() {
            result.push(EnvEntry::new("K_SERVICE", cfg.service_name.as_str()));
        }
        result.push(EnvEntry::new("K_REVISION", "local"));
        result.push(EnvEntry::new("GOOGLE_CLOUD_PROJECT", cfg.project_id.as_str()));

        let creds_file = self
            .creds
            .creds_file()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        result.push(EnvEntry::new("GOOGLE_APPLICATION_CREDENTIALS", creds_file));

        let client = secrets::Client::new(
            self.endpoints.clone(),
            &self.creds.access_token,
            &cfg.project_id,
        );

        for var in &cfg.env {
            if !var.value.is_empty() {
                result.push(EnvEntry::new(var.name.as_str(), var.value.as_str()));
                continue;
            }

            let Some(secret_ref) = &var.secret_ref else {
                debug!(name = %var.name, "skipping variable with neither value nor secret");
                continue;
            };

            let value = client
                .access_secret_version(cancel, &secret_ref.name, &secret_ref.version)
                .await
                .map_err(|source| ResolveError::Secret {
                    secret: secret_ref.name.clone(),
                    source,
                })?;

            result.push(EnvEntry::new(var.name.as_str(), value));
        }

        Ok(result)
    }

    /// Remove the temporary credentials file. Safe to call more than once.
    pub fn cleanup(&mut self) -> Result<(), CleanupError> {
        self.creds.release()
    }
}
