//! Dynamic configuration in a local file watched by the proxy

use crate::dynamic::{DynamicConfig, FileFormat};
use crate::error::{BootstrapError, Result};
use crate::preload::{PreloadOp, PreloadTransaction};
use anyhow::Context;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub struct FileBackend {
    path: PathBuf,
    format: FileFormat,
    /// The file did not exist before we first wrote it
    created: bool,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let format = FileFormat::from_path(&path)?;
        Ok(Self {
            path,
            format,
            created: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> FileFormat {
        self.format
    }

    /// The directory must exist so the proxy can watch it
    pub fn probe(&self) -> anyhow::Result<bool> {
        let dir = parent_dir(&self.path);
        if !dir.is_dir() {
            anyhow::bail!("directory {} does not exist", dir.display());
        }
        Ok(true)
    }

    pub fn replace_transaction(&self, config: &DynamicConfig) -> Result<PreloadTransaction> {
        let contents = config
            .render(self.format)
            .map_err(|source| BootstrapError::PreloadTransaction {
                backend: "file",
                source,
            })?;
        Ok(PreloadTransaction::new().rewrite(contents))
    }

    /// Apply the last `Rewrite` of the transaction by renaming a complete
    /// temp file over the configuration file
    pub async fn apply(&mut self, txn: &PreloadTransaction) -> Result<()> {
        let mut contents = None;
        for op in txn.ops() {
            match op {
                PreloadOp::Rewrite { contents: c } => contents = Some(c.clone()),
                other => {
                    return Err(BootstrapError::PreloadTransaction {
                        backend: "file",
                        source: anyhow::anyhow!("file backend only accepts whole-file rewrites, got {:?}", other),
                    })
                }
            }
        }
        let Some(contents) = contents else {
            return Ok(());
        };

        let path = self.path.clone();
        let existed = path.exists();
        tokio::task::spawn_blocking(move || atomic_write(&path, contents.as_bytes()))
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?
            .map_err(|source| BootstrapError::PreloadTransaction {
                backend: "file",
                source,
            })?;

        if !existed {
            debug!(path = %self.path.display(), "Created dynamic configuration file");
            self.created = true;
        }
        Ok(())
    }

    pub fn proxy_args(&self) -> Vec<String> {
        vec![
            format!("--providers.file.filename={}", self.path.display()),
            "--providers.file.watch=true".to_string(),
        ]
    }

    pub async fn cleanup(&mut self) {
        if !self.created {
            return;
        }
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => debug!(path = %self.path.display(), "Removed dynamic configuration file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove dynamic configuration file"),
        }
        self.created = false;
    }
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    }
}

fn atomic_write(path: &Path, contents: &[u8]) -> anyhow::Result<()> {
    let dir = parent_dir(path);
    let mut staged = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("cannot create temp file in {}", dir.display()))?;
    staged.write_all(contents)?;
    if let Some(permissions) = target_permissions(path)? {
        staged.as_file().set_permissions(permissions)?;
    }
    staged.as_file().sync_all()?;
    staged
        .persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("cannot replace {}", path.display()))?;
    Ok(())
}

/// Keep the mode of the file being replaced; new files are world-readable
/// so a proxy running as another user can watch them
fn target_permissions(path: &Path) -> anyhow::Result<Option<std::fs::Permissions>> {
    match std::fs::metadata(path) {
        Ok(meta) => Ok(Some(meta.permissions())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(new_file_permissions()),
        Err(e) => Err(e).with_context(|| format!("cannot stat {}", path.display())),
    }
}

#[cfg(unix)]
fn new_file_permissions() -> Option<std::fs::Permissions> {
    use std::os::unix::fs::PermissionsExt;
    Some(std::fs::Permissions::from_mode(0o644))
}

#[cfg(not(unix))]
fn new_file_permissions() -> Option<std::fs::Permissions> {
    None
}
