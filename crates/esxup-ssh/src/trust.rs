use std::path::Path;

use log::{debug, info};
use ssh2::{CheckResult, KnownHostFileKind};

use esxup_session::TransportError;

/// Verify the server key offered by `session` against the known-hosts
/// file.
///
/// First contact records the key silently; identity is not pinned up
/// front, matching the tool's operational model. A key that differs from
/// the recorded one raises [`TransportError::HostKeyMismatch`] unless
/// `accept_changed_key` is set, in which case the stored identity is
/// replaced.
pub(crate) fn verify_host_key(
    session: &ssh2::Session,
    host_label: &str,
    name: &str,
    port: u16,
    known_hosts: &Path,
    accept_changed_key: bool,
) -> Result<(), TransportError> {
    let (key, key_type) = session.host_key().ok_or_else(|| {
        TransportError::failed(host_label, "trust verification", "server offered no host key")
    })?;
    check_and_record(
        session,
        host_label,
        &entry_label(name, port),
        key,
        key_type,
        known_hosts,
        accept_changed_key,
    )
}

/// OpenSSH known-hosts entry label: plain name on the default port,
/// `[name]:port` otherwise.
fn entry_label(name: &str, port: u16) -> String {
    if port == 22 {
        name.to_string()
    } else {
        format!("[{name}]:{port}")
    }
}

fn check_and_record(
    session: &ssh2::Session,
    host_label: &str,
    entry: &str,
    key: &[u8],
    key_type: ssh2::HostKeyType,
    known_hosts: &Path,
    accept_changed_key: bool,
) -> Result<(), TransportError> {
    let trust_error = |details: String| {
        TransportError::failed(host_label.to_string(), "trust verification", details)
    };

    let mut store = session.known_hosts().map_err(|e| trust_error(e.to_string()))?;
    if known_hosts.exists() {
        store
            .read_file(known_hosts, KnownHostFileKind::OpenSSH)
            .map_err(|e| trust_error(e.to_string()))?;
    }

    match store.check(entry, key) {
        CheckResult::Match => Ok(()),
        CheckResult::NotFound | CheckResult::Failure => {
            debug!("recording host key for {entry}");
            record(session, entry, key, key_type, known_hosts, false)
                .map_err(|e| trust_error(e.to_string()))
        }
        CheckResult::Mismatch => {
            if accept_changed_key {
                info!("replacing recorded host key for {entry}");
                record(session, entry, key, key_type, known_hosts, true)
                    .map_err(|e| trust_error(e.to_string()))
            } else {
                Err(TransportError::HostKeyMismatch {
                    host: host_label.to_string(),
                })
            }
        }
    }
}

/// Append (or, with `replace`, substitute) the entry in the known-hosts
/// file. Stale lines for the entry are filtered textually before the
/// store is re-read and rewritten.
fn record(
    session: &ssh2::Session,
    entry: &str,
    key: &[u8],
    key_type: ssh2::HostKeyType,
    known_hosts: &Path,
    replace: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if replace && known_hosts.exists() {
        let contents = std::fs::read_to_string(known_hosts)?;
        let kept: Vec<&str> = contents
            .lines()
            .filter(|line| line.split_whitespace().next() != Some(entry))
            .collect();
        std::fs::write(known_hosts, kept.join("\n") + "\n")?;
    }

    let mut store = session.known_hosts()?;
    if known_hosts.exists() {
        store.read_file(known_hosts, KnownHostFileKind::OpenSSH)?;
    }
    store.add(entry, key, "", key_type.into())?;

    if let Some(parent) = known_hosts.parent() {
        std::fs::create_dir_all(parent)?;
    }
    store.write_file(known_hosts, KnownHostFileKind::OpenSSH)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_A: &[u8] = b"fake-host-key-aaaaaaaaaaaaaaaa";
    const KEY_B: &[u8] = b"fake-host-key-bbbbbbbbbbbbbbbb";

    fn offline_session() -> ssh2::Session {
        ssh2::Session::new().expect("libssh2 session should initialize without a connection")
    }

    #[test]
    fn entry_label_wraps_non_default_ports() {
        assert_eq!(entry_label("esx01", 22), "esx01");
        assert_eq!(entry_label("esx01", 2222), "[esx01]:2222");
    }

    #[test]
    fn first_contact_is_recorded_silently() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("known_hosts");
        let session = offline_session();

        check_and_record(
            &session,
            "esx01",
            "esx01",
            KEY_A,
            ssh2::HostKeyType::Rsa,
            &path,
            false,
        )
        .expect("unknown host should be recorded");

        assert!(path.exists());

        // A second contact with the same key matches the recorded entry.
        check_and_record(
            &session,
            "esx01",
            "esx01",
            KEY_A,
            ssh2::HostKeyType::Rsa,
            &path,
            false,
        )
        .expect("recorded key should match");
    }

    #[test]
    fn changed_key_raises_mismatch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("known_hosts");
        let session = offline_session();

        check_and_record(&session, "esx01", "esx01", KEY_A, ssh2::HostKeyType::Rsa, &path, false)
            .expect("record first key");

        let error =
            check_and_record(&session, "esx01", "esx01", KEY_B, ssh2::HostKeyType::Rsa, &path, false)
                .expect_err("changed key must mismatch");
        assert!(matches!(error, TransportError::HostKeyMismatch { host } if host == "esx01"));
    }

    #[test]
    fn accepted_mismatch_replaces_recorded_key() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("known_hosts");
        let session = offline_session();

        check_and_record(&session, "esx01", "esx01", KEY_A, ssh2::HostKeyType::Rsa, &path, false)
            .expect("record first key");
        check_and_record(&session, "esx01", "esx01", KEY_B, ssh2::HostKeyType::Rsa, &path, true)
            .expect("accepted mismatch should replace the key");

        // New key now matches; the old one no longer does.
        check_and_record(&session, "esx01", "esx01", KEY_B, ssh2::HostKeyType::Rsa, &path, false)
            .expect("replacement key should match");
        let error =
            check_and_record(&session, "esx01", "esx01", KEY_A, ssh2::HostKeyType::Rsa, &path, false)
                .expect_err("old key must now mismatch");
        assert!(matches!(error, TransportError::HostKeyMismatch { .. }));
    }
}
