// src/endpoints.rs

/// OAuth2 scope requested for both the caller and the impersonated token.
pub const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

/// Base URLs of the Google APIs this tool talks to.
///
/// Production code always uses [`Endpoints::default`]. Tests point these at a
/// local mock server. The caller's own token endpoint is not listed here: it
/// comes from the credentials document (`token_uri`).
#[derive(Debug, Clone)]
pub struct Endpoints {
    /// IAM Credentials API, e.g. `https://iamcredentials.googleapis.com`
    pub iam_credentials: String,

    /// Secret Manager API, e.g. `https://secretmanager.googleapis.com`
    pub secret_manager: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            iam_credentials: "https://iamcredentials.googleapis.com".to_string(),
            secret_manager: "https://secretmanager.googleapis.com".to_string(),
        }
    }
}

impl Endpoints {
    /// `generateAccessToken` URL for a service account.
    ///
    /// Also written into the credentials file as
    /// `service_account_impersonation_url`.
    pub fn impersonation_url(&self, service_account: &str) -> String {
        format!(
            "{}/v1/projects/-/serviceAccounts/{}:generateAccessToken",
            self.iam_credentials.trim_end_matches('/'),
            service_account
        )
    }

    /// `:access` URL for a secret version resource path.
    pub fn secret_access_url(&self, secret_path: &str) -> String {
        format!(
            "{}/v1/{}:access",
            self.secret_manager.trim_end_matches('/'),
            secret_path
        )
    }
}

/// Resource name of a service account inside a delegate chain.
pub fn delegate_name(service_account: &str) -> String {
    format!("projects/-/serviceAccounts/{}", service_account)
}
