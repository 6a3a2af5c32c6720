// src/runner.rs

use crate::auth::{Broker, CredentialSource};
use crate::cli::Cli;
use crate::config::Config;
use crate::endpoints::Endpoints;
use crate::resolver::{EnvEntry, Resolver};
use crate::util::merge_env;

use anyhow::{bail, Context, Result};
use std::ffi::OsString;
use std::io::{ErrorKind, Write};
use std::process::{ExitStatus, Stdio};
use tokio::process::Command as TokioCommand;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Entry point from `main.rs`.
///
/// Returns the exit code the process should terminate with.
pub async fn run(cli: Cli, cancel: CancellationToken) -> Result<i32> {
    let config = Config::load(&cli.config).context("parse config")?;

    let source = CredentialSource::from_env().context("locate gcloud credentials")?;
    let broker = Broker::new(source, Endpoints::default());

    execute(config, &cli.command, &broker, &cancel).await
}

/// Impersonate, resolve, then print or run `command`.
///
/// The credentials file is removed before this returns, whatever the outcome.
pub async fn execute(
    config: Config,
    command: &[String],
    broker: &Broker,
    cancel: &CancellationToken,
) -> Result<i32> {
    let mut resolver = Resolver::new(cancel, broker, config)
        .await
        .context("create env resolver")?;

    let outcome = resolve_and_run(&resolver, command, cancel).await;

    if let Err(e) = resolver.cleanup() {
        warn!("cleanup failed: {:#}", anyhow::Error::from(e));
    }

    outcome
}

async fn resolve_and_run(
    resolver: &Resolver,
    command: &[String],
    cancel: &CancellationToken,
) -> Result<i32> {
    let env_vars = resolver
        .resolve(cancel)
        .await
        .context("resolve environment")?;

    if command.is_empty() {
        print_env(&mut std::io::stdout().lock(), &env_vars).context("write environment")?;
        return Ok(0);
    }

    let resolved = env_vars.into_iter().map(EnvEntry::into_os_pair);
    let env = merge_env(resolved, std::env::vars_os());
    run_command(command, env, cancel).await
}

/// Write one `NAME=VALUE` line per entry.
///
/// A closed reader (`cloudrun-local | head -1`) ends output early without
/// failing the run.
fn print_env<W: Write>(out: &mut W, entries: &[EnvEntry]) -> std::io::Result<()> {
    let written = entries
        .iter()
        .try_for_each(|entry| {
            out.write_all(&entry.line())?;
            out.write_all(b"\n")
        })
        .and_then(|()| out.flush());

    match written {
        Err(e) if e.kind() == ErrorKind::BrokenPipe => {
            debug!("stdout closed early, stopping output");
            Ok(())
        }
        other => other,
    }
}

/* ---------------- child process ---------------- */

/// Spawn `command` with exactly `env` and wait for it.
///
/// stdio is inherited. The child is killed if `cancel` fires first.
pub async fn run_command(
    command: &[String],
    env: Vec<(OsString, OsString)>,
    cancel: &CancellationToken,
) -> Result<i32> {
    let Some((program, args)) = command.split_first() else {
        bail!("no command specified");
    };

    debug!(program = %program, args = args.len(), "spawning command");

    let mut child = TokioCommand::new(program)
        .args(args)
        .env_clear()
        .envs(env)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("execute command: {}", program))?;

    let status = tokio::select! {
        status = child.wait() => Some(status),
        _ = cancel.cancelled() => None,
    };

    match status {
        Some(status) => Ok(exit_code(status.context("wait for command")?)),
        None => {
            if let Err(e) = child.kill().await {
                warn!("failed to kill {}: {}", program, e);
            }
            bail!("interrupted")
        }
    }
}

/// Map a child's exit status to our own exit code.
///
/// Signal-terminated children follow the shell convention of 128 + signal.
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return 128 + sig;
        }
    }

    1
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::auth::tests::{
        gcloud_dir, mock_endpoints, mount_impersonation, service_account_adc,
    };
    use crate::error::{ConfigError, ResolveError};

    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use clap::Parser;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const DESCRIPTOR: &str = r#"
kind: Service
metadata:
  name: svc
spec:
  template:
    spec:
      serviceAccountName: sa@proj.iam.gserviceaccount.com
      containers:
        - env:
            - name: FOO
              value: bar
            - name: BAZ
              valueFrom:
                secretKeyRef:
                  name: s
                  key: latest
"#;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    fn base_env() -> Vec<(OsString, OsString)> {
        std::env::vars_os().filter(|(k, _)| k == "PATH").collect()
    }

    #[tokio::test]
    async fn propagates_child_exit_code() {
        let code = run_command(&sh("exit 7"), base_env(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(code, 7);
    }

    #[tokio::test]
    async fn child_sees_only_given_environment() {
        let mut env = base_env();
        env.push(("K_REVISION".into(), "local".into()));

        let script = r#"test "$K_REVISION" = local"#;
        let code = run_command(&sh(script), env, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(code, 0);
    }

    #[tokio::test]
    async fn missing_program_is_an_error() {
        let err = run_command(
            &["cloudrun-local-no-such-binary".to_string()],
            base_env(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(err.to_string().contains("execute command"));
    }

    #[tokio::test]
    async fn cancellation_kills_child() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let err = run_command(&sh("sleep 30"), base_env(), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "interrupted");
    }

    #[tokio::test]
    async fn non_utf8_inherited_variable_reaches_child() {
        use crate::util::os_string_from_bytes;

        let mut inherited = base_env();
        inherited.push(("LEGACY".into(), os_string_from_bytes(b"caf\xe9".to_vec())));

        let resolved = vec![EnvEntry::new("K_REVISION", "local").into_os_pair()];
        let env = merge_env(resolved, inherited);

        let script = r#"test "$K_REVISION" = local \
            && test "$(printf '%s' "$LEGACY" | od -An -tx1 | tr -d ' \n')" = 636166e9"#;
        let code = run_command(&sh(script), env, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(code, 0);
    }

    #[test]
    fn prints_one_line_per_entry_with_raw_bytes() {
        let entries = vec![
            EnvEntry::new("K_REVISION", "local"),
            EnvEntry::new("BLOB", vec![0xff, b'=', 0x01]),
        ];

        let mut out = Vec::new();
        print_env(&mut out, &entries).unwrap();

        assert_eq!(out, b"K_REVISION=local\nBLOB=\xff=\x01\n");
    }

    /// Accepts `budget` bytes, then behaves like a pipe whose reader exited.
    struct ClosedPipe {
        budget: usize,
    }

    impl Write for ClosedPipe {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if self.budget == 0 {
                return Err(std::io::Error::from(ErrorKind::BrokenPipe));
            }
            let n = buf.len().min(self.budget);
            self.budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn closed_stdout_ends_output_quietly() {
        let entries: Vec<EnvEntry> = (0..100)
            .map(|i| EnvEntry::new(format!("VAR_{i}"), "value"))
            .collect();

        print_env(&mut ClosedPipe { budget: 20 }, &entries).unwrap();
    }

    #[test]
    fn other_write_errors_are_reported() {
        struct Full;
        impl Write for Full {
            fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
                Err(std::io::Error::new(ErrorKind::Other, "disk full"))
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let err = print_env(&mut Full, &[EnvEntry::new("A", "b")]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Other);
    }

    #[test]
    fn signal_exit_maps_to_128_plus_signal() {
        use std::os::unix::process::ExitStatusExt;

        assert_eq!(exit_code(ExitStatus::from_raw(3 << 8)), 3);
        assert_eq!(exit_code(ExitStatus::from_raw(9)), 137);
    }

    #[tokio::test]
    async fn runs_command_with_resolved_environment_and_cleans_up() {
        let server = MockServer::start().await;
        mount_impersonation(&server).await;
        Mock::given(method("GET"))
            .and(path("/v1/projects/proj/secrets/s/versions/latest:access"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "payload": { "data": STANDARD.encode("qux") } })),
            )
            .mount(&server)
            .await;

        let gcloud = gcloud_dir(&service_account_adc(&server));
        let tmp = tempfile::tempdir().unwrap();
        let broker = Broker::new(CredentialSource::new(gcloud.path()), mock_endpoints(&server))
            .with_temp_dir(tmp.path());

        let script = r#"test "$K_SERVICE" = svc \
            && test "$GOOGLE_CLOUD_PROJECT" = proj \
            && test -f "$GOOGLE_APPLICATION_CREDENTIALS" \
            && test "$FOO" = bar \
            && test "$BAZ" = qux"#;

        let code = execute(
            Config::parse(DESCRIPTOR).unwrap(),
            &sh(script),
            &broker,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(code, 0);
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn secret_failure_still_removes_credentials_file() {
        let server = MockServer::start().await;
        mount_impersonation(&server).await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let gcloud = gcloud_dir(&service_account_adc(&server));
        let tmp = tempfile::tempdir().unwrap();
        let broker = Broker::new(CredentialSource::new(gcloud.path()), mock_endpoints(&server))
            .with_temp_dir(tmp.path());

        let err = execute(
            Config::parse(DESCRIPTOR).unwrap(),
            &[],
            &broker,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        let resolve_err = err.downcast_ref::<ResolveError>().unwrap();
        assert!(resolve_err.to_string().contains("access secret s"));
        assert!(format!("{:#}", err).contains("received 403"));
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn two_containers_fail_before_any_request() {
        let dir = tempfile::tempdir().unwrap();
        let descriptor = dir.path().join("service.yaml");
        std::fs::write(
            &descriptor,
            r#"
kind: Service
spec:
  template:
    spec:
      serviceAccountName: sa@proj.iam.gserviceaccount.com
      containers:
        - image: a
        - image: b
"#,
        )
        .unwrap();

        let cli = Cli::try_parse_from(["cloudrun-local", "-c", descriptor.to_str().unwrap()])
            .unwrap();

        let err = run(cli, CancellationToken::new()).await.unwrap_err();

        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::ContainerCount(2))
        ));
    }
}
