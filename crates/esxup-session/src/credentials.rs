use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::traits::Interaction;

const WILDCARD_TOKENS: [&str; 2] = ["*", "ALL"];

/// A resolved (username, password) pair for one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
struct StoreEntry {
    host: String,
    username: String,
    password: String,
}

/// Line-oriented credential store: `host-or-wildcard:username:password`
/// records, one per line. `*` and `ALL` are wildcard host tokens.
#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    entries: Vec<StoreEntry>,
}

impl CredentialStore {
    /// Parse store contents. Malformed lines are skipped with a log line
    /// rather than failing the run.
    #[must_use]
    pub fn parse(contents: &str) -> Self {
        let mut entries = Vec::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.splitn(3, ':');
            match (fields.next(), fields.next(), fields.next()) {
                (Some(host), Some(username), Some(password)) => entries.push(StoreEntry {
                    host: host.to_string(),
                    username: username.to_string(),
                    password: password.to_string(),
                }),
                _ => warn!("skipping malformed credential store line"),
            }
        }
        Self { entries }
    }

    /// Load a store from disk, tightening its permissions first. A
    /// missing file yields `None`.
    #[must_use]
    pub fn load(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }
        tighten_permissions(path);
        match std::fs::read_to_string(path) {
            Ok(contents) => Some(Self::parse(&contents)),
            Err(error) => {
                warn!("could not read credential store {}: {error}", path.display());
                None
            }
        }
    }

    /// Look up the credential for `host`.
    ///
    /// A wildcard entry is checked first and applies to every host, even
    /// when a host-scoped entry also exists. That precedence is
    /// deliberate; see DESIGN.md before reusing this store elsewhere.
    #[must_use]
    pub fn lookup(&self, host: &str) -> Option<Credential> {
        let matched = self
            .entries
            .iter()
            .find(|entry| WILDCARD_TOKENS.contains(&entry.host.as_str()))
            .or_else(|| self.entries.iter().find(|entry| entry.host == host))?;
        Some(Credential {
            username: matched.username.clone(),
            password: matched.password.clone(),
        })
    }
}

/// Default store location: `~/.esxpasswd`.
#[must_use]
pub fn default_store_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".esxpasswd"))
}

/// Best-effort permission hygiene: clamp the store file to
/// owner-read/write when it is looser. Never fails the run.
pub fn tighten_permissions(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        let Ok(metadata) = std::fs::metadata(path) else {
            return;
        };
        let mode = metadata.permissions().mode() & 0o777;
        if mode & 0o077 != 0 {
            debug!("tightening {} from {mode:o} to 600", path.display());
            let mut permissions = metadata.permissions();
            permissions.set_mode(0o600);
            if let Err(error) = std::fs::set_permissions(path, permissions) {
                warn!("could not tighten {}: {error}", path.display());
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
}

fn has_alphanumeric(value: &str) -> bool {
    value.chars().any(char::is_alphanumeric)
}

fn prompt_until_usable(interaction: &dyn Interaction, label: &str, secret: bool) -> String {
    loop {
        let value = if secret {
            interaction.prompt_secret(label)
        } else {
            interaction.prompt(label)
        };
        if has_alphanumeric(&value) {
            return value;
        }
    }
}

/// Resolve the credential for `host`.
///
/// Precedence per field, independently for username and password:
/// explicit value (used as-is when non-empty), then store lookup, then
/// interactive prompt (repeated until the entry contains an alphanumeric
/// character; password prompts do not echo).
#[must_use]
pub fn resolve(
    explicit_username: Option<&str>,
    explicit_password: Option<&str>,
    host: &str,
    store: Option<&CredentialStore>,
    interaction: &dyn Interaction,
) -> Credential {
    let stored = store.and_then(|store| store.lookup(host));

    let username = explicit_username
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .or_else(|| {
            stored
                .as_ref()
                .map(|c| c.username.clone())
                .filter(|value| has_alphanumeric(value))
        })
        .unwrap_or_else(|| prompt_until_usable(interaction, "Username", false));

    let password = explicit_password
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .or_else(|| {
            stored
                .as_ref()
                .map(|c| c.password.clone())
                .filter(|value| has_alphanumeric(value))
        })
        .unwrap_or_else(|| prompt_until_usable(interaction, "Password", true));

    Credential { username, password }
}
