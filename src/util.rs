// src/util.rs

use rand::Rng;
use std::ffi::OsString;
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// Run `fut` to completion unless `cancel` fires first.
///
/// Returns `None` when cancelled. The future is dropped at that point, which
/// aborts any in-flight HTTP request.
pub async fn until_cancelled<F>(cancel: &CancellationToken, fut: F) -> Option<F::Output>
where
    F: Future,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        out = fut => Some(out),
    }
}

/// Random lowercase ASCII string of length `n`.
///
/// Used for temp file names to avoid clobbering concurrent invocations.
/// This is not a security boundary.
pub fn random_lower(n: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..n).map(|_| rng.gen_range(b'a'..=b'z') as char).collect()
}

/// Build a child process environment.
///
/// Resolved entries come first, the inherited environment second. Later
/// entries win, so anything already set in the shell overrides the
/// descriptor. Names and values are carried as `OsString` so inherited
/// variables that are not valid UTF-8 pass through untouched.
pub fn merge_env<R, I>(resolved: R, inherited: I) -> Vec<(OsString, OsString)>
where
    R: IntoIterator<Item = (OsString, OsString)>,
    I: IntoIterator<Item = (OsString, OsString)>,
{
    let mut merged: Vec<(OsString, OsString)> = Vec::new();

    for (key, value) in resolved.into_iter().chain(inherited) {
        if let Some(existing) = merged.iter_mut().find(|(k, _)| *k == key) {
            existing.1 = value;
        } else {
            merged.push((key, value));
        }
    }

    merged
}

/// Environment value from raw bytes.
///
/// Unix takes the bytes as they are. Elsewhere invalid UTF-8 is replaced.
pub fn os_string_from_bytes(bytes: Vec<u8>) -> OsString {
    #[cfg(unix)]
    {
        use std::os::unix::ffi::OsStringExt;
        OsString::from_vec(bytes)
    }
    #[cfg(not(unix))]
    {
        OsString::from(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Select ring as the process-wide rustls provider.
///
/// reqwest and the OAuth2 client can pull in different providers; rustls
/// refuses to pick one on its own when both are compiled in.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn random_lower_has_requested_shape() {
        let s = random_lower(8);
        assert_eq!(s.len(), 8);
        assert!(s.chars().all(|c| c.is_ascii_lowercase()));
    }

    fn os_pairs(pairs: &[(&str, &str)]) -> Vec<(OsString, OsString)> {
        pairs
            .iter()
            .map(|(k, v)| (OsString::from(*k), OsString::from(*v)))
            .collect()
    }

    #[test]
    fn shell_environment_wins() {
        let resolved = os_pairs(&[
            ("K_REVISION", "local"),
            ("FOO", "from-config"),
            ("EQUALS", "a=b"),
        ]);
        let inherited = os_pairs(&[("FOO", "from-shell"), ("PATH", "/usr/bin")]);

        let merged = merge_env(resolved, inherited);

        assert_eq!(
            merged,
            os_pairs(&[
                ("K_REVISION", "local"),
                ("FOO", "from-shell"),
                ("EQUALS", "a=b"),
                ("PATH", "/usr/bin"),
            ])
        );
    }

    #[cfg(unix)]
    #[test]
    fn non_utf8_inherited_values_pass_through() {
        let latin1 = os_string_from_bytes(b"caf\xe9".to_vec());
        let inherited = vec![(OsString::from("LEGACY"), latin1.clone())];

        let merged = merge_env(os_pairs(&[("K_REVISION", "local")]), inherited);

        assert_eq!(merged.len(), 2);
        assert_eq!(merged[1], (OsString::from("LEGACY"), latin1));
        assert!(merged[1].1.to_str().is_none());
    }

    #[test]
    fn crypto_provider_install_is_repeatable() {
        install_crypto_provider();
        install_crypto_provider();
        assert!(rustls::crypto::CryptoProvider::get_default().is_some());
    }

    #[tokio::test]
    async fn until_cancelled_returns_none_once_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let out = until_cancelled(&cancel, tokio::time::sleep(Duration::from_secs(60))).await;
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn until_cancelled_passes_through_output() {
        let cancel = CancellationToken::new();
        let out = until_cancelled(&cancel, async { 42 }).await;
        assert_eq!(out, Some(42));
    }
}
