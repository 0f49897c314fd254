use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("patch file does not exist: {0}")]
    MissingArtifact(PathBuf),
    #[error("no patch matching '{reference}' in {directory}")]
    NoMatch {
        reference: String,
        directory: PathBuf,
    },
    #[error("failed to read patch catalog {path}: {source}")]
    CatalogRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse patch catalog {path}: {source}")]
    CatalogParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("fetch request for {url} failed: {source}")]
    Fetch {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("fetch of {url} failed with HTTP {status}")]
    FetchStatus {
        url: String,
        status: reqwest::StatusCode,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One entry of the external patch catalog: an update identifier and the
/// locator it can be retrieved from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchCatalogEntry {
    pub id: String,
    pub url: String,
}

impl PatchCatalogEntry {
    /// Expected local filename: the final path segment of the locator,
    /// query parameters stripped.
    #[must_use]
    pub fn local_filename(&self) -> &str {
        let without_query = self.url.split('?').next().unwrap_or(&self.url);
        without_query
            .rsplit('/')
            .next()
            .unwrap_or(without_query)
    }
}

/// Load a patch catalog from a JSON object mapping identifier to locator.
///
/// Entries come back ordered by identifier so repeated runs report in a
/// stable order.
///
/// # Errors
/// Returns an error when the catalog file cannot be read or parsed.
pub fn load_catalog(path: &Path) -> Result<Vec<PatchCatalogEntry>, RepoError> {
    let contents = std::fs::read_to_string(path).map_err(|source| RepoError::CatalogRead {
        path: path.to_path_buf(),
        source,
    })?;
    let raw: BTreeMap<String, String> =
        serde_json::from_str(&contents).map_err(|source| RepoError::CatalogParse {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(raw
        .into_iter()
        .map(|(id, url)| PatchCatalogEntry { id, url })
        .collect())
}

/// Classification of a catalog entry against the local repository after a
/// sync pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncStatus {
    Present,
    Missing,
    Fetched,
    FetchFailed(String),
}

#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub entry: PatchCatalogEntry,
    pub local_path: PathBuf,
    pub status: SyncStatus,
}

/// Reconcile catalog entries against the local patch directory.
///
/// Entries already present never trigger a fetch. When `fetch_missing` is
/// set, missing entries are retrieved individually; a failed fetch is
/// recorded in that entry's outcome and the remaining entries are still
/// processed.
pub async fn sync(
    client: &reqwest::Client,
    entries: &[PatchCatalogEntry],
    local_dir: &Path,
    fetch_missing: bool,
) -> Vec<SyncOutcome> {
    let mut outcomes = Vec::with_capacity(entries.len());

    for entry in entries {
        let local_path = local_dir.join(entry.local_filename());
        debug!("catalog entry {}: expecting {}", entry.id, local_path.display());

        let status = if local_path.exists() {
            SyncStatus::Present
        } else if fetch_missing {
            info!("fetching {} from {}", entry.id, entry.url);
            match fetch_file(client, &entry.url, &local_path).await {
                Ok(()) => SyncStatus::Fetched,
                Err(error) => {
                    warn!("fetch of {} failed: {error}", entry.id);
                    SyncStatus::FetchFailed(error.to_string())
                }
            }
        } else {
            SyncStatus::Missing
        };

        outcomes.push(SyncOutcome {
            entry: entry.clone(),
            local_path,
            status,
        });
    }

    outcomes
}

async fn fetch_file(client: &reqwest::Client, url: &str, dest: &Path) -> Result<(), RepoError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|source| RepoError::Fetch {
            url: url.to_string(),
            source,
        })?;

    if !response.status().is_success() {
        return Err(RepoError::FetchStatus {
            url: url.to_string(),
            status: response.status(),
        });
    }

    // A truncated file would classify as Present on the next sync pass,
    // so it must not survive a failed stream.
    let result = stream_to_file(response, url, dest).await;
    if result.is_err() {
        let _ = tokio::fs::remove_file(dest).await;
    }
    result
}

async fn stream_to_file(
    response: reqwest::Response,
    url: &str,
    dest: &Path,
) -> Result<(), RepoError> {
    use futures_util::StreamExt;

    let mut file = tokio::fs::File::create(dest)
        .await
        .map_err(|source| RepoError::Write {
            path: dest.to_path_buf(),
            source,
        })?;

    let mut downloaded: u64 = 0;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|source| RepoError::Fetch {
            url: url.to_string(),
            source,
        })?;
        file.write_all(&chunk)
            .await
            .map_err(|source| RepoError::Write {
                path: dest.to_path_buf(),
                source,
            })?;
        downloaded += chunk.len() as u64;
    }

    file.flush().await.map_err(|source| RepoError::Write {
        path: dest.to_path_buf(),
        source,
    })?;

    info!("fetched {url}: {downloaded} bytes");
    Ok(())
}

/// Names of patch bundles (`*.zip`) in the local repository. An absent
/// directory lists as empty rather than erroring.
#[must_use]
pub fn list_local_patches(dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };

    let mut names: Vec<String> = entries
        .filter_map(Result::ok)
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| name.ends_with(".zip"))
        .collect();
    names.sort();
    names
}

/// Resolve a patch reference to a local file.
///
/// A reference containing a path separator is treated as an explicit path
/// and only checked for existence. A bare reference (typically a patch
/// number) is matched as a substring against the repository listing.
///
/// # Errors
/// Returns [`RepoError::NoMatch`] when nothing in the repository matches
/// a bare reference, or [`RepoError::MissingArtifact`] when the resolved
/// path does not exist.
pub fn find_patch(reference: &str, dir: &Path) -> Result<PathBuf, RepoError> {
    let path = if reference.contains('/') {
        PathBuf::from(reference)
    } else {
        let name = list_local_patches(dir)
            .into_iter()
            .find(|name| name.contains(reference))
            .ok_or_else(|| RepoError::NoMatch {
                reference: reference.to_string(),
                directory: dir.to_path_buf(),
            })?;
        dir.join(name)
    };

    if path.exists() {
        Ok(path)
    } else {
        Err(RepoError::MissingArtifact(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, url: &str) -> PatchCatalogEntry {
        PatchCatalogEntry {
            id: id.to_string(),
            url: url.to_string(),
        }
    }

    #[test]
    fn local_filename_strips_query_and_path() {
        let e = entry(
            "ESXi650-201707001",
            "https://example.com/patches/ESXi650-201707001.zip?md5sum=abc&ts=1",
        );
        assert_eq!(e.local_filename(), "ESXi650-201707001.zip");
    }

    #[test]
    fn local_filename_handles_bare_name() {
        let e = entry("p1", "ESXi650-201707001.zip");
        assert_eq!(e.local_filename(), "ESXi650-201707001.zip");
    }

    #[test]
    fn load_catalog_orders_by_identifier() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("catalog.json");
        std::fs::write(
            &path,
            r#"{"ESXi650-B": "https://example.com/b.zip", "ESXi650-A": "https://example.com/a.zip"}"#,
        )
        .expect("write catalog");

        let catalog = load_catalog(&path).expect("catalog should parse");
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog[0].id, "ESXi650-A");
        assert_eq!(catalog[1].id, "ESXi650-B");
    }

    #[test]
    fn load_catalog_reports_parse_failures() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("catalog.json");
        std::fs::write(&path, "not json").expect("write catalog");

        let error = load_catalog(&path).expect_err("garbage should not parse");
        assert!(matches!(error, RepoError::CatalogParse { .. }));
    }

    #[tokio::test]
    async fn present_entry_is_never_fetched() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("present.zip"), b"bundle").expect("seed patch");

        // The URL is unroutable; a fetch attempt would fail loudly.
        let entries = vec![entry("p1", "http://invalid.invalid/present.zip")];
        let client = reqwest::Client::new();
        let outcomes = sync(&client, &entries, dir.path(), true).await;

        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].status, SyncStatus::Present);
    }

    #[tokio::test]
    async fn missing_entry_without_download_is_classified_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        let entries = vec![entry("p1", "http://invalid.invalid/absent.zip")];
        let client = reqwest::Client::new();

        let outcomes = sync(&client, &entries, dir.path(), false).await;

        assert_eq!(outcomes[0].status, SyncStatus::Missing);
        assert!(!outcomes[0].local_path.exists());
    }

    #[tokio::test]
    async fn failed_fetch_does_not_abort_remaining_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("second.zip"), b"bundle").expect("seed patch");

        let entries = vec![
            entry("p1", "http://invalid.invalid/first.zip"),
            entry("p2", "http://invalid.invalid/second.zip"),
        ];
        let client = reqwest::Client::new();
        let outcomes = sync(&client, &entries, dir.path(), true).await;

        assert!(matches!(outcomes[0].status, SyncStatus::FetchFailed(_)));
        assert_eq!(outcomes[1].status, SyncStatus::Present);
    }

    #[tokio::test]
    async fn failed_fetch_leaves_no_file_behind() {
        // A leftover file would turn the failure into Present on the
        // next pass and the entry would never be re-fetched.
        let dir = tempfile::tempdir().expect("tempdir");
        let entries = vec![entry("p1", "http://invalid.invalid/broken.zip")];
        let client = reqwest::Client::new();

        let outcomes = sync(&client, &entries, dir.path(), true).await;

        assert!(matches!(outcomes[0].status, SyncStatus::FetchFailed(_)));
        assert!(!outcomes[0].local_path.exists());

        let retry = sync(&client, &entries, dir.path(), false).await;
        assert_eq!(retry[0].status, SyncStatus::Missing);
    }

    #[test]
    fn list_local_patches_filters_to_zip() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("b.zip"), b"").expect("seed");
        std::fs::write(dir.path().join("a.zip"), b"").expect("seed");
        std::fs::write(dir.path().join("notes.txt"), b"").expect("seed");

        assert_eq!(list_local_patches(dir.path()), vec!["a.zip", "b.zip"]);
    }

    #[test]
    fn list_local_patches_of_absent_directory_is_empty() {
        assert!(list_local_patches(Path::new("/nonexistent/esxup-test")).is_empty());
    }

    #[test]
    fn find_patch_matches_bare_reference_by_substring() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("ESXi650-201707001.zip"), b"").expect("seed");

        let path = find_patch("201707001", dir.path()).expect("reference should resolve");
        assert_eq!(path, dir.path().join("ESXi650-201707001.zip"));
    }

    #[test]
    fn find_patch_reports_missing_explicit_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("absent.zip");

        let error = find_patch(missing.to_str().expect("utf-8 path"), dir.path())
            .expect_err("absent file should not resolve");
        assert!(matches!(error, RepoError::MissingArtifact(_)));
    }

    #[test]
    fn find_patch_reports_unmatched_reference() {
        let dir = tempfile::tempdir().expect("tempdir");
        let error = find_patch("999999", dir.path()).expect_err("no match expected");
        assert!(matches!(error, RepoError::NoMatch { .. }));
    }
}
