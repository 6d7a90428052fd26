//! Standalone executables that don't come from a package repository, e.g. `helm`.

use std::fs;
use std::io::{self, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use ki_paths::{BinDir, BinFile};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tar::Archive;
use walkdir::WalkDir;

use crate::fetch::{Fetch, FetchError};

/// A downloadable release of a single executable.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryArtifact {
    /// Executable name; both the file searched for in the archive and the installed file name.
    pub name: String,
    pub url: String,
    /// Hex-encoded SHA-256 of the downloaded file.
    pub sha256: String,
}

impl BinaryArtifact {
    fn is_tarball(&self) -> bool {
        let path = self.url.split(['?', '#']).next().unwrap_or_default();
        path.ends_with(".tar.gz") || path.ends_with(".tgz")
    }

    fn file_name(&self) -> &str {
        let path = self.url.split(['?', '#']).next().unwrap_or_default();
        match path.rsplit('/').next() {
            Some(name) if !name.is_empty() => name,
            _ => &self.name,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstallOutcome {
    Installed,
    /// The target path already existed. Its contents were not checked.
    AlreadyPresent,
}

#[derive(thiserror::Error, Debug)]
pub enum InstallError {
    #[error("failed to download {url}")]
    Download {
        url: String,
        #[source]
        source: FetchError,
    },
    #[error("failed to extract {}", .archive.display())]
    Extract {
        archive: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("checksum mismatch for {name}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        name: String,
        expected: String,
        actual: String,
    },
    #[error("{name} not found in the downloaded archive")]
    BinaryNotFound { name: String },
    #[error("failed to install {}", .path.display())]
    Install {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub struct BinaryInstaller<'a, F> {
    fetch: &'a F,
    bin_dir: &'a BinDir,
}

impl<'a, F: Fetch> BinaryInstaller<'a, F> {
    pub fn new(fetch: &'a F, bin_dir: &'a BinDir) -> Self {
        Self { fetch, bin_dir }
    }

    pub fn target(&self, artifact: &BinaryArtifact) -> BinFile {
        self.bin_dir.binary(&artifact.name)
    }

    /// Download, verify and install `artifact` unless its target path already exists.
    ///
    /// The download is checked against `sha256` before anything is extracted. All intermediate
    /// files live in a temporary directory that is removed on every return path, and the
    /// target only appears once it is complete.
    pub async fn install(&self, artifact: &BinaryArtifact) -> Result<InstallOutcome, InstallError> {
        let target = self.target(artifact);
        if target.exists() {
            tracing::info!("{} is already installed", target.display());
            return Ok(InstallOutcome::AlreadyPresent);
        }
        tracing::info!("Installing {}", artifact.name);

        let temp_dir = tempfile::tempdir().map_err(|source| InstallError::Install {
            path: target.0.clone(),
            source,
        })?;
        let download = temp_dir.path().join(artifact.file_name());
        self.fetch
            .fetch_to(&artifact.url, &download)
            .await
            .map_err(|source| InstallError::Download {
                url: artifact.url.clone(),
                source,
            })?;

        verify_sha256(&artifact.name, &download, &artifact.sha256)?;

        let extracted = if artifact.is_tarball() {
            let out = temp_dir.path().join("extracted");
            unpack_tar_gz(&download, &out)?;
            find_file(&out, &artifact.name)
                .map_err(|source| InstallError::Extract {
                    archive: download.clone(),
                    source: source.into(),
                })?
                .ok_or_else(|| InstallError::BinaryNotFound {
                    name: artifact.name.clone(),
                })?
        } else {
            download
        };

        install_executable(&extracted, &target)?;
        tracing::info!("Installed {}", target.display());
        Ok(InstallOutcome::Installed)
    }
}

fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn verify_sha256(name: &str, path: &Path, expected: &str) -> Result<(), InstallError> {
    let actual = sha256_file(path).map_err(|source| InstallError::Extract {
        archive: path.to_path_buf(),
        source,
    })?;
    if !actual.eq_ignore_ascii_case(expected.trim()) {
        return Err(InstallError::ChecksumMismatch {
            name: name.to_owned(),
            expected: expected.trim().to_owned(),
            actual,
        });
    }
    Ok(())
}

fn unpack_tar_gz(archive: &Path, out: &Path) -> Result<(), InstallError> {
    let extract_err = |source| InstallError::Extract {
        archive: archive.to_path_buf(),
        source,
    };
    let tar_gz = fs::File::open(archive).map_err(extract_err)?;
    let mut archive = Archive::new(GzDecoder::new(tar_gz));
    archive.unpack(out).map_err(extract_err)
}

/// First regular file named exactly `name`, in sorted traversal order.
fn find_file(root: &Path, name: &str) -> Result<Option<PathBuf>, walkdir::Error> {
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry?;
        if entry.file_type().is_file() && entry.file_name() == name {
            return Ok(Some(entry.into_path()));
        }
    }
    Ok(None)
}

fn install_executable(source: &Path, target: &BinFile) -> Result<(), InstallError> {
    let install_err = |source| InstallError::Install {
        path: target.0.clone(),
        source,
    };
    target.create_parent().map_err(install_err)?;
    let dir = target.0.parent().unwrap_or(Path::new("."));
    let mut staged = tempfile::NamedTempFile::with_prefix_in(".ki-", dir).map_err(install_err)?;
    io::copy(&mut fs::File::open(source).map_err(install_err)?, &mut staged).map_err(install_err)?;
    staged
        .as_file()
        .set_permissions(fs::Permissions::from_mode(0o755))
        .map_err(install_err)?;
    staged.as_file().sync_all().map_err(install_err)?;
    staged.persist(&target.0).map_err(|e| install_err(e.error))?;
    Ok(())
}
