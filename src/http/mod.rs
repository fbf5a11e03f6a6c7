//! HTTP transfer
//!
//! This module handles the network side of a pumping:
//! - Client construction and the retry/backoff policy
//! - Hop-by-hop redirect resolution and capability probing via HEAD
//! - Concurrent ranged section streaming into a part file
//! - Output path resolution for new pumpings

pub mod connection;
pub mod probe;
pub mod segment;

pub use connection::{build_client, RetryPolicy};
pub use probe::{probe, ProbeOutcome, ServerCapabilities};
pub use segment::{fetch_sections, prepare_part_file, SectionCursors};

use crate::error::{PumpError, Result, StorageErrorKind};
use std::path::{Component, Path, PathBuf};
use url::Url;

/// File name used when the URL path has none
const DEFAULT_FILENAME: &str = "download";

/// Parse and check a URL submitted to the queue
pub fn parse_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim()).map_err(|e| PumpError::invalid_url(raw, e.to_string()))?;
    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(PumpError::invalid_url(
                raw,
                format!("unsupported scheme '{}'", other),
            ))
        }
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(PumpError::invalid_url(raw, "missing host"));
    }
    Ok(url)
}

/// Decide where a pumping writes its output
///
/// An explicit absolute path is used as is; a relative one is joined onto
/// `download_dir`. Without one, the last URL path segment names the file.
pub fn resolve_output_path(
    url: &Url,
    explicit: Option<&Path>,
    download_dir: &Path,
) -> Result<PathBuf> {
    if let Some(path) = explicit {
        if path.is_absolute() {
            return Ok(path.to_path_buf());
        }
        check_relative(path)?;
        return Ok(download_dir.join(path));
    }

    let filename = extract_filename_from_url(url).unwrap_or_else(|| DEFAULT_FILENAME.to_string());
    check_relative(Path::new(&filename))?;
    Ok(download_dir.join(filename))
}

/// Reject paths that could escape the download directory
fn check_relative(path: &Path) -> Result<()> {
    for component in path.components() {
        match component {
            Component::ParentDir => {
                return Err(PumpError::storage(
                    StorageErrorKind::PathTraversal,
                    path,
                    "Invalid filename: contains parent directory reference (..)",
                ));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(PumpError::storage(
                    StorageErrorKind::PathTraversal,
                    path,
                    "Invalid filename: contains absolute path",
                ));
            }
            _ => {}
        }
    }
    if path.as_os_str().is_empty() {
        return Err(PumpError::storage(
            StorageErrorKind::PathTraversal,
            path,
            "Invalid filename: empty",
        ));
    }
    Ok(())
}

/// Extract filename from URL path
fn extract_filename_from_url(url: &Url) -> Option<String> {
    url.path_segments()?
        .next_back()
        .filter(|s| !s.is_empty())
        .map(|s| {
            urlencoding::decode(s)
                .map(|d| d.to_string())
                .unwrap_or_else(|_| s.to_string())
        })
        .filter(|s| !s.is_empty() && s != "." && s != "..")
}
