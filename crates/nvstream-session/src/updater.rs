//! Update-manifest parsing and entry selection.
//!
//! The manifest is a JSON array of per-platform entries. The first entry
//! matching the client's arch and platform (and satisfying the optional
//! kernel floor) wins; a version is newer only if its dotted-quad compares
//! strictly greater than the running one.

use nvstream_core::{compare_quads, parse_quad, ParseError, Result};
use serde::Deserialize;
use std::cmp::Ordering;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateEntry {
    pub platform: String,
    pub arch: String,
    pub version: String,
    pub browser_url: String,
    #[serde(default)]
    pub kernel_version_at_least: Option<String>,
}

/// The client's identity for manifest matching.
#[derive(Debug, Clone)]
pub struct ClientPlatform {
    pub platform: String,
    pub arch: String,
    pub kernel_version: String,
    pub current_version: String,
}

/// Parse a manifest document. A single object is accepted as a one-entry
/// array.
pub fn parse_manifest(json: &str) -> Result<Vec<UpdateEntry>> {
    if let Ok(entries) = serde_json::from_str::<Vec<UpdateEntry>>(json) {
        return Ok(entries);
    }
    match serde_json::from_str::<UpdateEntry>(json) {
        Ok(entry) => Ok(vec![entry]),
        Err(e) => Err(ParseError::InvalidFormat(format!("update manifest: {}", e)).into()),
    }
}

/// Pick the first applicable manifest entry for this client.
pub fn select_entry<'m>(
    manifest: &'m [UpdateEntry],
    client: &ClientPlatform,
) -> Option<&'m UpdateEntry> {
    for entry in manifest {
        if entry.arch != client.arch || entry.platform != client.platform {
            continue;
        }

        if let Some(required_kernel) = &entry.kernel_version_at_least {
            let required = parse_quad(required_kernel);
            let actual = parse_quad(&client.kernel_version);
            if compare_quads(&actual, &required) == Ordering::Less {
                debug!(
                    "Skipping manifest entry: kernel {} < required {}",
                    client.kernel_version, required_kernel
                );
                continue;
            }
        }

        return Some(entry);
    }
    warn!(
        "No update manifest entry for {}/{}",
        client.platform, client.arch
    );
    None
}

/// A candidate version is newer iff strictly greater by dotted-quad
/// compare, with missing components treated as 0.
pub fn is_newer_version(candidate: &str, current: &str) -> bool {
    compare_quads(&parse_quad(candidate), &parse_quad(current)) == Ordering::Greater
}

/// Check the selected entry against the running version.
pub fn available_update<'m>(
    manifest: &'m [UpdateEntry],
    client: &ClientPlatform,
) -> Option<&'m UpdateEntry> {
    let entry = select_entry(manifest, client)?;
    if is_newer_version(&entry.version, &client.current_version) {
        Some(entry)
    } else {
        None
    }
}

/// Manifest files on network shares hang file APIs for long timeouts when
/// the file server is down; a quick TCP probe of the SMB port fails fast
/// instead. Returns true when the server answers within the timeout.
pub async fn probe_file_server(host: &str, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, tokio::net::TcpStream::connect((host, 445))).await,
        Ok(Ok(_))
    )
}

/// The conventional fail-fast probe window.
pub const FILE_SERVER_PROBE_TIMEOUT: Duration = Duration::from_millis(200);
