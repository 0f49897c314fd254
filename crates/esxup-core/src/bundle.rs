use std::io::Read;
use std::path::{Path, PathBuf};

use log::debug;
use thiserror::Error;

const EMBEDDED_METADATA: &str = "metadata.zip";

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("patch bundle does not exist: {0}")]
    MissingArtifact(PathBuf),
    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("{context}: {source}")]
    Zip {
        context: &'static str,
        #[source]
        source: zip::result::ZipError,
    },
    #[error("bundle {0} carries no embedded metadata.zip")]
    NoMetadata(PathBuf),
    #[error("bundle {0} metadata names no standard image profile")]
    NoStandardProfile(PathBuf),
}

impl BundleError {
    fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Io { context, source }
    }

    fn zip(context: &'static str, source: zip::result::ZipError) -> Self {
        Self::Zip { context, source }
    }
}

/// Derive the available version from a local patch bundle.
///
/// The bundle embeds a `metadata.zip` whose entry listing names image
/// profiles as `profiles/<NAME>`; the standard profile's name carries the
/// version. The returned token is the profile path's second segment with
/// its final `-`-part (the `standard` suffix) dropped, for example
/// `profiles/ESXi-6.5.0-20170702001-standard` yields
/// `ESXi-6.5.0-20170702001`.
///
/// # Errors
/// Returns an error when the bundle or its metadata is missing, unreadable,
/// or names no standard profile.
pub fn bundle_version(bundle: &Path) -> Result<String, BundleError> {
    if !bundle.exists() {
        return Err(BundleError::MissingArtifact(bundle.to_path_buf()));
    }

    let file = std::fs::File::open(bundle)
        .map_err(|source| BundleError::io("failed to open patch bundle", source))?;
    let mut outer = zip::ZipArchive::new(file)
        .map_err(|source| BundleError::zip("failed to read patch bundle", source))?;

    let mut metadata_bytes = Vec::new();
    {
        let mut embedded = match outer.by_name(EMBEDDED_METADATA) {
            Ok(entry) => entry,
            Err(zip::result::ZipError::FileNotFound) => {
                return Err(BundleError::NoMetadata(bundle.to_path_buf()));
            }
            Err(source) => return Err(BundleError::zip("failed to locate metadata", source)),
        };
        embedded
            .read_to_end(&mut metadata_bytes)
            .map_err(|source| BundleError::io("failed to extract metadata", source))?;
    }

    let metadata = zip::ZipArchive::new(std::io::Cursor::new(metadata_bytes))
        .map_err(|source| BundleError::zip("failed to read embedded metadata", source))?;

    let profile = metadata
        .file_names()
        .find(|name| name.starts_with("profiles/") && name.contains("standard"))
        .ok_or_else(|| BundleError::NoStandardProfile(bundle.to_path_buf()))?;

    debug!("standard profile entry: {profile}");
    profile_version(profile).ok_or_else(|| BundleError::NoStandardProfile(bundle.to_path_buf()))
}

fn profile_version(profile_entry: &str) -> Option<String> {
    let name = profile_entry.split('/').nth(1)?;
    let parts: Vec<&str> = name.split('-').collect();
    if parts.len() < 2 {
        return None;
    }
    Some(parts[..parts.len() - 1].join("-"))
}
