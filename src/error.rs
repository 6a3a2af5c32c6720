// src/error.rs

//! Error types for each stage of environment resolution.
//!
//! Every stage gets its own enum so callers can match on what went wrong
//! (bad descriptor, failed impersonation, failed secret access, failed
//! cleanup) without parsing messages. The binary layer wraps these in
//! `anyhow` for display.

use std::path::PathBuf;
use thiserror::Error;

/// The descriptor could not be read or is structurally invalid.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("read config file {path:?}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse YAML config")]
    Yaml(#[from] serde_yaml::Error),

    #[error("unsupported kind: {0} (expected Service or Job)")]
    UnsupportedKind(String),

    #[error("expected exactly 1 container, got {0}")]
    ContainerCount(usize),

    #[error("serviceAccountName not found in config")]
    MissingServiceAccount,

    #[error("invalid service account format: {0}")]
    InvalidServiceAccount(String),
}

/// Impersonated credentials could not be obtained.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error(
        "no application default credentials found at {0:?}. \
         Please authenticate using 'gcloud auth application-default login'"
    )]
    Unauthenticated(PathBuf),

    #[error("could not determine the gcloud configuration directory (no home directory)")]
    NoConfigDir,

    #[error("read application default credentials at {path:?}")]
    ReadStandingCredentials {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("application default credentials at {path:?} are not valid JSON")]
    ParseStandingCredentials {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(
        "unsupported credential type {0:?} (expected \"authorized_user\" or \"service_account\")"
    )]
    UnsupportedCredentialType(String),

    #[error("build OAuth2 authenticator")]
    Authenticator(#[source] std::io::Error),

    #[error("failed to obtain caller access token")]
    CallerToken(#[source] yup_oauth2::Error),

    #[error("failed to generate access token (status {status}): {body}")]
    Impersonation { status: u16, body: String },

    #[error("got empty access token from {0}")]
    EmptyToken(&'static str),

    #[error("request to {endpoint} failed")]
    Http {
        endpoint: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("write credentials file {path:?}")]
    WriteArtifact {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialise credentials file")]
    SerialiseArtifact(#[source] serde_json::Error),

    #[error("authentication cancelled")]
    Cancelled,
}

/// A secret version could not be accessed or decoded.
#[derive(Error, Debug)]
pub enum SecretError {
    #[error("expected 200 response status for {secret}, received {status}")]
    Status { secret: String, status: u16 },

    #[error("no value for secret {0}")]
    Empty(String),

    #[error("malformed response for secret {secret}")]
    Envelope {
        secret: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("payload of secret {secret} is not valid base64")]
    Decode {
        secret: String,
        #[source]
        source: base64::DecodeError,
    },

    #[error("request for secret {secret} failed")]
    Http {
        secret: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("access to secret {0} cancelled")]
    Cancelled(String),
}

/// Resolution failed part way through the declaration list.
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("access secret {secret}")]
    Secret {
        secret: String,
        #[source]
        source: SecretError,
    },
}

/// The temporary credentials file could not be removed.
#[derive(Error, Debug)]
#[error("remove credentials file {path:?}")]
pub struct CleanupError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}
