//! Release catalog: the stable releases and the rolling snapshot published
//! on GitHub, reduced to one downloadable image per release.

use std::fmt;
use std::path::Path;

use anyhow::Result;
use serde::Deserialize;

use crate::config::Config;
use crate::error::ProvisionError;

/// Number of stable releases offered in the menu.
pub const MAX_STABLE: usize = 5;

/// Tag of the rolling pre-release build.
pub const SNAPSHOT_TAG: &str = "snapshots";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseKind {
    Release,
    Snapshot,
}

impl fmt::Display for ReleaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReleaseKind::Release => f.write_str("release"),
            ReleaseKind::Snapshot => f.write_str("snapshot"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseEntry {
    pub version: String,
    pub kind: ReleaseKind,
    pub download_url: String,
    /// `sha256:<hex>` as published by the API, if any.
    pub digest: Option<String>,
}

impl ReleaseEntry {
    /// Menu label, e.g. `12.1 / release`.
    pub fn label(&self) -> String {
        format!("{} / {}", self.version, self.kind)
    }
}

/// HTTP access used by the catalog and the image download.
pub trait ReleaseSource {
    /// GET `url` and return the response body, whatever the HTTP status.
    fn get_json(&self, url: &str) -> Result<String>;

    /// Stream `url` into `dest`, returning the number of bytes written.
    fn download(&self, url: &str, dest: &Path) -> Result<u64>;
}

#[derive(Debug, Deserialize)]
struct Release {
    #[serde(default)]
    prerelease: bool,
    #[serde(default)]
    tag_name: String,
    #[serde(default)]
    assets: Vec<Asset>,
}

#[derive(Debug, Deserialize)]
struct Asset {
    name: String,
    browser_download_url: String,
    #[serde(default)]
    digest: Option<String>,
}

fn releases_url(config: &Config, repo: &str) -> String {
    format!("{}/repos/{repo}/releases", config.api_base.trim_end_matches('/'))
}

fn snapshot_url(config: &Config, repo: &str) -> String {
    format!("{}/tags/{SNAPSHOT_TAG}", releases_url(config, repo))
}

/// The error object GitHub returns instead of data, e.g. on rate limiting.
fn upstream_error(value: &serde_json::Value) -> ProvisionError {
    let message = value
        .get("message")
        .and_then(|m| m.as_str())
        .unwrap_or("unexpected response from release API");
    ProvisionError::UpstreamUnavailable(message.to_string())
}

fn parse_json(body: &str) -> Result<serde_json::Value, ProvisionError> {
    serde_json::from_str(body)
        .map_err(|e| ProvisionError::UpstreamUnavailable(format!("invalid JSON: {e}")))
}

/// Derive the display version from an asset file name: drop the suffix and
/// everything up to the first hyphen.
fn display_version(name: &str, suffix: &str) -> String {
    let stem = name.strip_suffix(suffix).unwrap_or(name);
    match stem.split_once('-') {
        Some((_, version)) if !version.is_empty() => version.to_string(),
        _ => stem.to_string(),
    }
}

fn entry_for(release: &Release, kind: ReleaseKind, suffix: &str) -> Option<ReleaseEntry> {
    let asset = release.assets.iter().find(|a| a.name.ends_with(suffix))?;
    Some(ReleaseEntry {
        version: display_version(&asset.name, suffix),
        kind,
        download_url: asset.browser_download_url.clone(),
        digest: asset.digest.clone(),
    })
}

/// Parse the stable release listing.
pub fn parse_releases(body: &str, suffix: &str) -> Result<Vec<ReleaseEntry>, ProvisionError> {
    let value = parse_json(body)?;
    if !value.is_array() {
        return Err(upstream_error(&value));
    }
    let releases: Vec<Release> = serde_json::from_value(value)
        .map_err(|e| ProvisionError::UpstreamUnavailable(format!("malformed release list: {e}")))?;
    Ok(releases
        .iter()
        .filter(|r| !r.prerelease && r.tag_name != SNAPSHOT_TAG)
        .filter_map(|r| entry_for(r, ReleaseKind::Release, suffix))
        .take(MAX_STABLE)
        .collect())
}

/// Parse the single snapshot release. `Ok(None)` if it carries no image.
pub fn parse_snapshot(body: &str, suffix: &str) -> Result<Option<ReleaseEntry>, ProvisionError> {
    let value = parse_json(body)?;
    let has_assets = value.get("assets").map(|a| a.is_array()).unwrap_or(false);
    if !has_assets {
        return Err(upstream_error(&value));
    }
    let release: Release = serde_json::from_value(value)
        .map_err(|e| ProvisionError::UpstreamUnavailable(format!("malformed snapshot release: {e}")))?;
    Ok(entry_for(&release, ReleaseKind::Snapshot, suffix))
}

/// Fetch the catalog: up to [`MAX_STABLE`] stable entries followed by the
/// snapshot entry. Either query failing fails the whole fetch.
pub fn fetch(source: &dyn ReleaseSource, config: &Config) -> Result<Vec<ReleaseEntry>> {
    let repo = config.repo()?;
    let suffix = config.image_suffix.as_str();

    let url = releases_url(config, repo);
    tracing::info!("fetching releases from {url}");
    let body = source.get_json(&url)?;
    let mut entries = parse_releases(&body, suffix)?;
    tracing::debug!("found {} stable releases", entries.len());

    let url = snapshot_url(config, repo);
    tracing::info!("fetching snapshot from {url}");
    let body = source.get_json(&url)?;
    match parse_snapshot(&body, suffix)? {
        Some(entry) => entries.push(entry),
        None => tracing::warn!("snapshot release has no {suffix} asset"),
    }
    Ok(entries)
}
