//! Download, verify and install versioned release binaries
//!
//! Install locations are derived only from `(name, version, platform)`:
//!
//! ```text
//! <dir>/traefik_v2.9.8_linux_amd64.tar.gz     archive (transient)
//! <dir>/traefik_v2.9.8_linux_amd64/traefik    executable
//! <dir>/traefik_v2.9.8_linux_amd64/.install-receipt.json
//! ```
//!
//! The receipt records the archive and binary digests of the last install so a
//! later call can prove the cached binary is intact without the network.

use crate::error::{BootstrapError, Result};
use crate::manifest::ChecksumManifest;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::borrow::Cow;
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Release download root for Traefik
pub const DEFAULT_RELEASE_URL: &str = "https://github.com/traefik/traefik/releases/download";

/// Version installed when none is configured
pub const DEFAULT_VERSION: &str = "2.9.8";

const RECEIPT_FILE: &str = ".install-receipt.json";

/// Operating system and CPU architecture of a release artifact
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Platform {
    pub os: String,
    pub arch: String,
}

impl Platform {
    pub fn new(os: &str, arch: &str) -> Self {
        Self {
            os: os.to_ascii_lowercase(),
            arch: normalize_arch(&arch.to_ascii_lowercase()),
        }
    }

    /// The platform this process runs on
    pub fn current() -> Self {
        Self::new(std::env::consts::OS, std::env::consts::ARCH)
    }

    pub fn is_windows(&self) -> bool {
        self.os == "windows"
    }

    /// `<os>_<arch>` as used in release file names
    pub fn tag(&self) -> String {
        format!("{}_{}", self.os, self.arch)
    }

    pub fn archive_format(&self) -> ArchiveFormat {
        if self.is_windows() {
            ArchiveFormat::Zip
        } else {
            ArchiveFormat::TarGz
        }
    }
}

fn normalize_arch(arch: &str) -> String {
    match arch {
        "x86_64" => "amd64".to_string(),
        "aarch64" => "arm64".to_string(),
        "x86" | "i686" => "386".to_string(),
        other => other.to_string(),
    }
}

impl FromStr for Platform {
    type Err = BootstrapError;

    /// Accepts `linux-amd64` or `linux_amd64`
    fn from_str(s: &str) -> Result<Self> {
        let (os, arch) = s
            .split_once(['-', '_'])
            .filter(|(os, arch)| !os.is_empty() && !arch.is_empty())
            .ok_or_else(|| {
                BootstrapError::Config(format!(
                    "invalid platform '{}': expected <os>-<arch>, e.g. linux-amd64",
                    s
                ))
            })?;
        Ok(Self::new(os, arch))
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.os, self.arch)
    }
}

/// Archive container used by a release
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    TarGz,
    Zip,
}

impl ArchiveFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ArchiveFormat::TarGz => "tar.gz",
            ArchiveFormat::Zip => "zip",
        }
    }
}

/// What to do when the manifest has no digest for an artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnverifiedPolicy {
    /// Fail with [`BootstrapError::UntestedArtifact`] before any download
    Refuse,
    /// Install without verification and report [`Verification::Untested`]
    TrustOnFirstUse,
}

/// A fully resolved artifact: where it comes from and where it lands
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallTarget {
    pub name: String,
    pub version: String,
    pub platform: Platform,
    pub url: String,
    pub format: ArchiveFormat,
    pub archive_path: PathBuf,
    pub binary_path: PathBuf,
}

impl InstallTarget {
    /// Name of the single archive entry that is extracted
    pub fn entry_name(&self) -> String {
        if self.platform.is_windows() {
            format!("{}.exe", self.name)
        } else {
            self.name.clone()
        }
    }

    fn receipt_path(&self) -> PathBuf {
        self.binary_path.with_file_name(RECEIPT_FILE)
    }
}

/// Whether the installed archive was checked against a known digest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    Verified,
    /// No recorded digest: accepted on first use
    Untested,
}

/// Result of [`ArtifactInstaller::install`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Installation {
    pub binary: PathBuf,
    pub verification: Verification,
    /// False when an intact cached install was reused
    pub downloaded: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct Receipt {
    url: String,
    archive_sha256: String,
    binary_sha256: String,
}

/// Resolves, downloads, verifies and unpacks release binaries
pub struct ArtifactInstaller {
    name: String,
    dir: PathBuf,
    release_url: String,
    manifest: Cow<'static, ChecksumManifest>,
    policy: UnverifiedPolicy,
    client: reqwest::Client,
}

impl ArtifactInstaller {
    /// Installer for Traefik into `dir` using the embedded manifest.
    ///
    /// The unverified policy has no default: callers decide whether versions
    /// without a recorded digest may be installed.
    pub fn new(dir: impl Into<PathBuf>, policy: UnverifiedPolicy) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            name: "traefik".to_string(),
            dir: dir.into(),
            release_url: DEFAULT_RELEASE_URL.to_string(),
            manifest: Cow::Borrowed(ChecksumManifest::embedded()),
            policy,
            client,
        })
    }

    /// Download from a different release root (mirrors, tests)
    pub fn with_release_url(mut self, url: impl Into<String>) -> Self {
        self.release_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_manifest(mut self, manifest: ChecksumManifest) -> Self {
        self.manifest = Cow::Owned(manifest);
        self
    }

    pub fn manifest(&self) -> &ChecksumManifest {
        &self.manifest
    }

    pub fn policy(&self) -> UnverifiedPolicy {
        self.policy
    }

    /// Derive the install target for a version and platform
    pub fn resolve(&self, version: &str, platform: &Platform) -> InstallTarget {
        let version = version.trim_start_matches('v').to_string();
        let format = platform.archive_format();
        let stem = format!("{}_v{}_{}", self.name, version, platform.tag());
        let archive_name = format!("{}.{}", stem, format.extension());
        let binary_name = if platform.is_windows() {
            format!("{}.exe", self.name)
        } else {
            self.name.clone()
        };

        InstallTarget {
            name: self.name.clone(),
            url: format!("{}/v{}/{}", self.release_url, version, archive_name),
            archive_path: self.dir.join(&archive_name),
            binary_path: self.dir.join(&stem).join(binary_name),
            version,
            platform: platform.clone(),
            format,
        }
    }

    /// Ensure the target's executable is present and intact.
    ///
    /// Reuses a cached install when its digests still match (no network),
    /// otherwise downloads, verifies and extracts a fresh copy.
    pub async fn install(&self, target: &InstallTarget) -> Result<Installation> {
        let expected = self.manifest.digest_for(&target.url).map(str::to_string);

        if expected.is_none() {
            if self.policy == UnverifiedPolicy::Refuse {
                return Err(BootstrapError::UntestedArtifact {
                    url: target.url.clone(),
                });
            }
            warn!(
                name = %target.name,
                version = %target.version,
                url = %target.url,
                "No recorded checksum, installing untested artifact"
            );
        }

        if let Some(installation) = self.reuse_cached(target, expected.as_deref()).await? {
            info!(binary = %installation.binary.display(), "Using cached install");
            return Ok(installation);
        }

        info!(
            name = %target.name,
            version = %target.version,
            platform = %target.platform,
            url = %target.url,
            "Downloading"
        );
        self.download(target).await?;

        let archive_sha256 = sha256_file_async(&target.archive_path).await?;
        if let Some(expected) = &expected {
            if &archive_sha256 != expected {
                remove_if_exists(&target.archive_path).await;
                return Err(BootstrapError::ChecksumMismatch {
                    url: target.url.clone(),
                    expected: expected.clone(),
                    actual: archive_sha256,
                });
            }
            debug!(url = %target.url, "Archive checksum verified");
        }

        info!(archive = %target.archive_path.display(), "Extracting");
        let archive = target.archive_path.clone();
        let binary = target.binary_path.clone();
        let entry = target.entry_name();
        let format = target.format;
        let extracted =
            tokio::task::spawn_blocking(move || extract_entry(&archive, format, &entry, &binary))
                .await
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        if let Err(source) = extracted {
            remove_if_exists(&target.archive_path).await;
            return Err(BootstrapError::Extract {
                archive: target.archive_path.clone(),
                entry: target.entry_name(),
                source,
            });
        }
        set_executable(&target.binary_path)?;

        let receipt = Receipt {
            url: target.url.clone(),
            archive_sha256,
            binary_sha256: sha256_file_async(&target.binary_path).await?,
        };
        let receipt_json = serde_json::to_vec_pretty(&receipt)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tokio::fs::write(target.receipt_path(), receipt_json).await?;
        tokio::fs::remove_file(&target.archive_path).await?;

        info!(binary = %target.binary_path.display(), "Installed");
        Ok(Installation {
            binary: target.binary_path.clone(),
            verification: verification_for(expected.as_deref()),
            downloaded: true,
        })
    }

    /// Check an existing install against the manifest.
    ///
    /// Returns `None` when a fresh download is needed; stale artifacts have
    /// been deleted by then.
    async fn reuse_cached(
        &self,
        target: &InstallTarget,
        expected: Option<&str>,
    ) -> Result<Option<Installation>> {
        if !target.binary_path.exists() {
            return Ok(None);
        }

        let archive_present = target.archive_path.exists();
        let receipt = read_receipt(&target.receipt_path()).await;

        let intact = match (expected, archive_present, &receipt) {
            (_, false, None) => {
                debug!(binary = %target.binary_path.display(), "No archive or receipt for cached binary");
                false
            }
            (None, _, Some(receipt)) => {
                receipt.url == target.url
                    && sha256_file_async(&target.binary_path).await? == receipt.binary_sha256
            }
            (None, true, None) => true,
            (Some(expected), true, _) => sha256_file_async(&target.archive_path).await? == expected,
            (Some(expected), false, Some(receipt)) => {
                receipt.url == target.url
                    && receipt.archive_sha256 == expected
                    && sha256_file_async(&target.binary_path).await? == receipt.binary_sha256
            }
        };

        if !intact {
            warn!(
                binary = %target.binary_path.display(),
                "Cached install does not match the manifest, reinstalling"
            );
            remove_if_exists(&target.archive_path).await;
            remove_if_exists(&target.binary_path).await;
            remove_if_exists(&target.receipt_path()).await;
            return Ok(None);
        }

        set_executable(&target.binary_path)?;
        Ok(Some(Installation {
            binary: target.binary_path.clone(),
            verification: verification_for(expected),
            downloaded: false,
        }))
    }

    async fn download(&self, target: &InstallTarget) -> Result<()> {
        if let Some(parent) = target.binary_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let result = async {
            let mut response = self
                .client
                .get(&target.url)
                .send()
                .await?
                .error_for_status()?;

            let mut file = tokio::fs::File::create(&target.archive_path).await?;
            let mut written = 0u64;
            while let Some(chunk) = response.chunk().await? {
                file.write_all(&chunk).await?;
                written += chunk.len() as u64;
            }
            file.flush().await?;
            debug!(url = %target.url, bytes = written, "Download complete");
            Ok::<_, anyhow::Error>(())
        }
        .await;

        if let Err(source) = result {
            remove_if_exists(&target.archive_path).await;
            return Err(BootstrapError::Download {
                url: target.url.clone(),
                source,
            });
        }
        Ok(())
    }
}

fn verification_for(expected: Option<&str>) -> Verification {
    match expected {
        Some(_) => Verification::Verified,
        None => Verification::Untested,
    }
}

async fn read_receipt(path: &Path) -> Option<Receipt> {
    let bytes = tokio::fs::read(path).await.ok()?;
    serde_json::from_slice(&bytes).ok()
}

async fn remove_if_exists(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove file");
        }
    }
}

/// Hex SHA-256 of a file's contents
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

async fn sha256_file_async(path: &Path) -> Result<String> {
    let path = path.to_path_buf();
    let digest = tokio::task::spawn_blocking(move || sha256_file(&path))
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;
    Ok(digest)
}

/// Write exactly one named entry of the archive to `dest`
fn extract_entry(archive: &Path, format: ArchiveFormat, entry: &str, dest: &Path) -> anyhow::Result<()> {
    let dir = dest
        .parent()
        .context("destination has no parent directory")?;
    let mut staged = tempfile::NamedTempFile::new_in(dir)?;

    match format {
        ArchiveFormat::TarGz => {
            let file = File::open(archive)?;
            let mut tar = tar::Archive::new(flate2::read::GzDecoder::new(file));
            let mut found = false;
            for item in tar.entries()? {
                let mut item = item?;
                let path = item.path()?.into_owned();
                if is_top_level_entry(&path, entry) {
                    io::copy(&mut item, staged.as_file_mut())?;
                    found = true;
                    break;
                }
            }
            if !found {
                anyhow::bail!("archive has no entry named '{}'", entry);
            }
        }
        ArchiveFormat::Zip => {
            let file = File::open(archive)?;
            let mut zip = zip::ZipArchive::new(file)?;
            let mut item = zip
                .by_name(entry)
                .with_context(|| format!("archive has no entry named '{}'", entry))?;
            io::copy(&mut item, staged.as_file_mut())?;
        }
    }

    staged.as_file().sync_all()?;
    staged.persist(dest).map_err(|e| e.error)?;
    Ok(())
}

fn is_top_level_entry(path: &Path, entry: &str) -> bool {
    let mut normal = path
        .components()
        .filter(|c| matches!(c, std::path::Component::Normal(_)));
    matches!(
        (normal.next(), normal.next()),
        (Some(first), None) if first.as_os_str() == entry
    )
}

#[cfg(unix)]
fn set_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}
