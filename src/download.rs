//! Image retrieval: HTTP access to the release API, streaming download of
//! the selected image, and unpacking of the (optionally compressed) tar
//! archive it ships in.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};

use crate::catalog::ReleaseSource;
use crate::check_interrupted;
use crate::error::{self, ProvisionError};

/// Maximum download size (50 GiB) to prevent disk exhaustion from a bad URL.
const MAX_DOWNLOAD_SIZE: u64 = 50 * 1024 * 1024 * 1024;

/// Returns the first non-empty proxy setting from the environment.
///
/// Checks (in order): `https_proxy`, `HTTPS_PROXY`, `http_proxy`, `HTTP_PROXY`,
/// `all_proxy`, `ALL_PROXY`.
fn proxy_from_env() -> Option<String> {
    for var in [
        "https_proxy",
        "HTTPS_PROXY",
        "http_proxy",
        "HTTP_PROXY",
        "all_proxy",
        "ALL_PROXY",
    ] {
        if let Ok(val) = std::env::var(var) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// [`ReleaseSource`] over HTTPS.
pub struct HttpSource {
    agent: ureq::Agent,
}

impl HttpSource {
    /// Build a ureq agent, configuring proxy from environment if available.
    ///
    /// HTTP error statuses are returned as responses so the API's error
    /// object can be reported.
    pub fn new() -> Result<Self> {
        let mut config = ureq::Agent::config_builder().http_status_as_error(false);
        if let Some(proxy_uri) = proxy_from_env() {
            tracing::debug!("using proxy: {proxy_uri}");
            let proxy = ureq::Proxy::new(&proxy_uri)
                .with_context(|| format!("invalid proxy URI: {proxy_uri}"))?;
            config = config.proxy(Some(proxy));
        }
        Ok(Self {
            agent: config.build().into(),
        })
    }
}

impl ReleaseSource for HttpSource {
    fn get_json(&self, url: &str) -> Result<String> {
        let mut response = self
            .agent
            .get(url)
            .header("Accept", "application/vnd.github+json")
            .call()
            .map_err(|e| ProvisionError::UpstreamUnavailable(format!("{url}: {e}")))?;
        tracing::debug!("GET {url}: {}", response.status());
        let body = response
            .body_mut()
            .read_to_string()
            .map_err(|e| ProvisionError::UpstreamUnavailable(format!("{url}: {e}")))?;
        Ok(body)
    }

    /// Download a URL to a local file, streaming to constant memory.
    fn download(&self, url: &str, dest: &Path) -> Result<u64> {
        let response = self
            .agent
            .get(url)
            .call()
            .with_context(|| format!("failed to download {url}"))?;
        if !response.status().is_success() {
            bail!("failed to download {url}: HTTP {}", response.status());
        }
        let mut reader = response.into_body().into_reader();
        let mut file =
            File::create(dest).with_context(|| format!("failed to create {}", dest.display()))?;
        copy_limited(&mut reader, &mut file, url)
    }
}

fn copy_limited(reader: &mut dyn Read, file: &mut File, url: &str) -> Result<u64> {
    let mut buf = [0u8; 65536];
    let mut total: u64 = 0;
    loop {
        check_interrupted()?;
        let n = reader
            .read(&mut buf)
            .with_context(|| format!("failed to read from {url}"))?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n])
            .context("failed to write download")?;
        total += n as u64;
        if total > MAX_DOWNLOAD_SIZE {
            bail!("download from {url} exceeds maximum size of {MAX_DOWNLOAD_SIZE} bytes");
        }
    }
    Ok(total)
}

/// File name of the downloaded image inside the work dir.
pub fn image_file_name(url: &str) -> String {
    let name = url
        .rsplit('/')
        .next()
        .and_then(|s| s.split(['?', '#']).next())
        .unwrap_or_default();
    if name.is_empty() {
        "image.download".to_string()
    } else {
        name.to_string()
    }
}

fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 65536];
    loop {
        check_interrupted()?;
        let n = file
            .read(&mut buf)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Check a file against a `sha256:<hex>` digest. Other algorithms are
/// skipped with a warning.
pub fn verify_digest(path: &Path, digest: &str) -> Result<()> {
    let Some(expected) = digest.strip_prefix("sha256:") else {
        tracing::warn!("skipping verification of unsupported digest {digest}");
        return Ok(());
    };
    let actual = sha256_file(path)?;
    if !actual.eq_ignore_ascii_case(expected) {
        bail!("sha256 mismatch for {}: expected {expected}, got {actual}", path.display());
    }
    tracing::debug!("verified sha256 of {}", path.display());
    Ok(())
}

/// Download `url` into `work_dir`, verifying `digest` when given.
pub fn fetch_image(
    source: &dyn ReleaseSource,
    url: &str,
    digest: Option<&str>,
    work_dir: &Path,
) -> Result<PathBuf> {
    let dest = work_dir.join(image_file_name(url));
    let result = (|| -> Result<()> {
        let total = source.download(url, &dest)?;
        tracing::info!("downloaded {total} bytes to {}", dest.display());
        if let Some(digest) = digest {
            verify_digest(&dest, digest)?;
        }
        Ok(())
    })();
    result.map_err(|e| error::unless_interrupted(e, ProvisionError::DownloadFailed(url.to_string())))?;
    Ok(dest)
}

// --- Compression ---

#[derive(Debug, PartialEq)]
enum Compression {
    None,
    Gzip,
    Bzip2,
    Xz,
    Zstd,
}

/// Detect the compression format of a file by reading its magic bytes.
fn detect_compression(path: &Path) -> Result<Compression> {
    let mut file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut magic = [0u8; 6];
    let n = file
        .read(&mut magic)
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(detect_compression_magic(&magic[..n]))
}

fn detect_compression_magic(magic: &[u8]) -> Compression {
    if magic.starts_with(&[0x1f, 0x8b]) {
        Compression::Gzip
    } else if magic.starts_with(b"BZh") {
        Compression::Bzip2
    } else if magic.starts_with(&[0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00]) {
        Compression::Xz
    } else if magic.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) {
        Compression::Zstd
    } else {
        Compression::None
    }
}

fn get_decoder(file: File, compression: &Compression) -> Result<Box<dyn Read>> {
    match compression {
        Compression::Gzip => Ok(Box::new(flate2::read::GzDecoder::new(file))),
        Compression::Bzip2 => Ok(Box::new(bzip2::read::BzDecoder::new(file))),
        Compression::Xz => Ok(Box::new(xz2::read::XzDecoder::new(file))),
        Compression::Zstd => {
            let decoder = zstd::stream::read::Decoder::new(file)
                .context("failed to create zstd decoder")?;
            Ok(Box::new(decoder))
        }
        Compression::None => Ok(Box::new(file)),
    }
}

// --- Archive extraction ---

/// Unpack a tar archive from a reader into a destination directory.
fn unpack_tar<R: Read>(reader: R, dest: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(reader);
    for entry in archive
        .entries()
        .with_context(|| format!("failed to read archive into {}", dest.display()))?
    {
        check_interrupted()?;
        let mut entry =
            entry.with_context(|| format!("failed to read archive into {}", dest.display()))?;
        entry
            .unpack_in(dest)
            .with_context(|| format!("failed to extract archive to {}", dest.display()))?;
    }
    Ok(())
}

/// First `*.ovf` file directly inside `dir`, in name order.
fn find_ovf(dir: &Path) -> Result<Option<PathBuf>> {
    let mut found: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("failed to read {}", dir.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && p.extension()
                    .map(|ext| ext.eq_ignore_ascii_case("ovf"))
                    .unwrap_or(false)
        })
        .collect();
    found.sort();
    Ok(found.into_iter().next())
}

/// Unpack `archive` into `dest` and return the path of the VM description
/// (`*.ovf`) it contains.
pub fn extract_image(archive: &Path, dest: &Path) -> Result<PathBuf> {
    let fail = |msg: String| ProvisionError::ExtractFailed(msg);
    let result = (|| -> Result<Option<PathBuf>> {
        fs::create_dir_all(dest)
            .with_context(|| format!("failed to create {}", dest.display()))?;
        let compression = detect_compression(archive)?;
        tracing::info!(
            "extracting {} ({compression:?}) -> {}",
            archive.display(),
            dest.display()
        );
        let file =
            File::open(archive).with_context(|| format!("failed to open {}", archive.display()))?;
        unpack_tar(get_decoder(file, &compression)?, dest)?;
        find_ovf(dest)
    })();
    match result {
        Ok(Some(ovf)) => Ok(ovf),
        Ok(None) => Err(fail(format!("no .ovf file in {}", archive.display())).into()),
        Err(e) => Err(error::unless_interrupted(e, fail(archive.display().to_string()))),
    }
}
