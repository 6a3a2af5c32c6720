// src/config.rs

use crate::error::ConfigError;

use serde::Deserialize;
use std::{fs, path::Path};

/// Normalised view of a Cloud Run deployment descriptor.
///
/// Both descriptor shapes (`kind: Service` and `kind: Job`) collapse into this
/// structure. It is immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// `metadata.name` of the descriptor (may be empty)
    pub service_name: String,

    /// Email of the service account to impersonate
    pub service_account: String,

    /// Derived from the service account domain
    pub project_id: String,

    /// Container environment, in declaration order
    pub env: Vec<EnvVar>,
}

/// A single container environment declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvVar {
    pub name: String,

    /// Literal value. Empty means "not a literal".
    pub value: String,

    /// Only set when there is no literal and both coordinates are present.
    pub secret_ref: Option<SecretRef>,
}

/// Secret Manager coordinate: secret name plus version label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretRef {
    pub name: String,

    /// Version label, e.g. `latest` or `3`. Taken from `secretKeyRef.key`.
    pub version: String,
}

/* ---------------- raw descriptor shapes ---------------- */

#[derive(Debug, Deserialize)]
struct KindHeader {
    #[serde(default)]
    kind: String,
}

#[derive(Debug, Default, Deserialize)]
struct Metadata {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodSpec {
    #[serde(default)]
    service_account_name: String,

    #[serde(default)]
    containers: Vec<Container>,
}

#[derive(Debug, Default, Deserialize)]
struct Container {
    #[serde(default)]
    env: Vec<RawEnv>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEnv {
    #[serde(default)]
    name: String,

    #[serde(default)]
    value: String,

    #[serde(default)]
    value_from: ValueFrom,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ValueFrom {
    #[serde(default)]
    secret_key_ref: SecretKeyRef,
}

#[derive(Debug, Default, Deserialize)]
struct SecretKeyRef {
    #[serde(default)]
    name: String,

    #[serde(default)]
    key: String,
}

/// Wrapper for `spec.template.spec`.
#[derive(Debug, Default, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de> + Default"))]
struct Template<T> {
    #[serde(default)]
    template: Inner<T>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de> + Default"))]
struct Inner<T> {
    #[serde(default)]
    spec: T,
}

/// kind: Service → spec.template.spec.{serviceAccountName,containers}
#[derive(Debug, Deserialize)]
struct ServiceDoc {
    #[serde(default)]
    metadata: Metadata,

    #[serde(default)]
    spec: Template<PodSpec>,
}

/// kind: Job → spec.template.spec.template.spec.{serviceAccountName,containers}
#[derive(Debug, Deserialize)]
struct JobDoc {
    #[serde(default)]
    metadata: Metadata,

    #[serde(default)]
    spec: Template<Template<PodSpec>>,
}

impl Config {
    /// Load and parse a Cloud Run Service or Job YAML descriptor from disk.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        Self::parse(&raw)
    }

    /// Parse descriptor YAML, dispatching on the `kind` field.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let header: KindHeader = serde_yaml::from_str(raw)?;

        let (metadata, pod) = match header.kind.as_str() {
            "Service" => {
                let doc: ServiceDoc = serde_yaml::from_str(raw)?;
                (doc.metadata, doc.spec.template.spec)
            }
            "Job" => {
                let doc: JobDoc = serde_yaml::from_str(raw)?;
                (doc.metadata, doc.spec.template.spec.template.spec)
            }
            other => return Err(ConfigError::UnsupportedKind(other.to_string())),
        };

        Self::from_pod(metadata, pod)
    }

    fn from_pod(metadata: Metadata, mut pod: PodSpec) -> Result<Self, ConfigError> {
        if pod.containers.len() != 1 {
            return Err(ConfigError::ContainerCount(pod.containers.len()));
        }

        if pod.service_account_name.is_empty() {
            return Err(ConfigError::MissingServiceAccount);
        }

        let project_id = extract_project_id(&pod.service_account_name)?;
        let container = pod.containers.remove(0);

        Ok(Config {
            service_name: metadata.name,
            service_account: pod.service_account_name,
            project_id,
            env: container.env.into_iter().map(EnvVar::from).collect(),
        })
    }
}

impl From<RawEnv> for EnvVar {
    fn from(raw: RawEnv) -> Self {
        let key_ref = raw.value_from.secret_key_ref;

        // A literal value always wins over a secret reference.
        let secret_ref = if raw.value.is_empty() && !key_ref.name.is_empty() && !key_ref.key.is_empty()
        {
            Some(SecretRef {
                name: key_ref.name,
                version: key_ref.key,
            })
        } else {
            None
        };

        EnvVar {
            name: raw.name,
            value: raw.value,
            secret_ref,
        }
    }
}

/// Extract the project id from a service account email.
///
/// Expected format: `name@project-id.iam.gserviceaccount.com`
pub fn extract_project_id(service_account: &str) -> Result<String, ConfigError> {
    let parts: Vec<&str> = service_account.split('@').collect();
    if parts.len() != 2 {
        return Err(ConfigError::InvalidServiceAccount(service_account.to_string()));
    }

    let project_id = parts[1].split('.').next().unwrap_or_default();
    if project_id.is_empty() {
        return Err(ConfigError::InvalidServiceAccount(service_account.to_string()));
    }

    Ok(project_id.to_string())
}
