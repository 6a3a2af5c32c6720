// src/cli.rs

use clap::{ArgAction, Parser};
use std::path::PathBuf;

const AFTER_HELP: &str = "\
EXAMPLES:
    # Print environment variables
    cloudrun-local --config=service.yaml

    # Run a Go service with the environment
    cloudrun-local -c service.yaml -- go run ./cmd/server

    # Run with default config file (service.yaml)
    cloudrun-local -- npm start

    # Save environment to a file
    cloudrun-local > .env

PRIORITY (highest first):
    1. Current shell environment (allows overriding config values)
    2. Cloud Run configuration YAML
    3. Automatic variables (K_SERVICE, K_REVISION, etc.)

CONFIGURATION:
    The service account is read from serviceAccountName in the pod template.
    The project ID is extracted from the service account email.
    Environment variables are read from the first (and only) container.";

/// Run Cloud Run services locally with proper service account impersonation.
///
/// Reads a Cloud Run Service or Job YAML file, impersonates the configured
/// service account using your local gcloud credentials, resolves environment
/// variables (including secrets from Secret Manager), and either prints them
/// or executes a command with that environment.
///
/// Requires:
/// - Authenticated gcloud CLI (gcloud auth application-default login)
/// - Permission to impersonate the service account
/// - Access to the secrets referenced in the configuration
#[derive(Parser, Debug)]
#[command(
    name = "cloudrun-local",
    version,
    disable_version_flag = true,
    after_long_help = AFTER_HELP
)]
pub struct Cli {
    /// Show version information
    #[arg(short = 'v', long, action = ArgAction::Version)]
    #[allow(dead_code)]
    version: Option<bool>,

    /// Path to Cloud Run service or job YAML config file
    #[arg(short, long, default_value = "service.yaml")]
    pub config: PathBuf,

    /// Log debug output to stderr
    ///
    /// CLOUDRUN_LOCAL_LOG takes precedence when set (e.g. CLOUDRUN_LOCAL_LOG=trace).
    #[arg(long)]
    pub verbose: bool,

    /// Command to run with the resolved environment
    ///
    /// If omitted, the environment is printed as KEY=value lines.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}
