//! apt keys, sources and packages.
//!
//! Existence is the only idempotence check: a keyring file that is already present is trusted
//! as-is, and a source list is rewritten only when its rendered contents differ.

use std::io;
use std::path::PathBuf;

use ki_paths::{HostPaths, KeyringFile};

use crate::Change;
use crate::exec::{ExecError, Invocation, SystemExecutor};
use crate::fetch::{Fetch, FetchError};

#[derive(thiserror::Error, Debug)]
pub enum PackageError {
    #[error("failed to update the package index")]
    Update(#[source] ExecError),
    #[error("failed to install {}", .packages.join(" "))]
    Install {
        packages: Vec<String>,
        #[source]
        source: ExecError,
    },
    #[error("failed to hold {}", .packages.join(" "))]
    Hold {
        packages: Vec<String>,
        #[source]
        source: ExecError,
    },
    #[error("failed to download signing key {name}")]
    DownloadKey {
        name: String,
        #[source]
        source: FetchError,
    },
    #[error("failed to import signing key {name}")]
    ImportKey {
        name: String,
        #[source]
        source: ExecError,
    },
    #[error("failed to write {}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// One `deb` line in its own file under `sources.list.d`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Repository {
    /// File stem of the source list.
    pub name: String,
    pub url: String,
    pub suite: String,
    pub components: Vec<String>,
    /// Keyring the repository is signed with, as returned by [`PackageRepositoryManager::keyring`].
    pub keyring: KeyringFile,
}

impl Repository {
    pub fn render(&self) -> String {
        let mut line = format!("deb [signed-by={}] {} {}", self.keyring.display(), self.url, self.suite);
        for component in &self.components {
            line.push(' ');
            line.push_str(component);
        }
        line.push('\n');
        line
    }
}

pub struct PackageRepositoryManager<'a, E, F> {
    exec: &'a E,
    fetch: &'a F,
    paths: &'a HostPaths,
}

impl<'a, E: SystemExecutor, F: Fetch> PackageRepositoryManager<'a, E, F> {
    pub fn new(exec: &'a E, fetch: &'a F, paths: &'a HostPaths) -> Self {
        Self { exec, fetch, paths }
    }

    fn apt(args: &[&str]) -> Invocation {
        Invocation::new("apt-get")
            .args(args.iter().copied())
            .env("DEBIAN_FRONTEND", "noninteractive")
    }

    pub fn update(&self) -> Result<(), PackageError> {
        tracing::info!("Updating the package index");
        self.exec.run(&Self::apt(&["update"])).map_err(PackageError::Update)
    }

    /// Install `packages` in one transaction. Any failure reported by apt fails the whole call.
    pub fn install(&self, packages: &[&str]) -> Result<(), PackageError> {
        tracing::info!("Installing {}", packages.join(" "));
        let invocation = Self::apt(&["install", "-y"]).args(packages.iter().copied());
        self.exec.run(&invocation).map_err(|source| PackageError::Install {
            packages: to_owned(packages),
            source,
        })
    }

    /// Pin `packages` at their installed version.
    pub fn hold(&self, packages: &[&str]) -> Result<(), PackageError> {
        tracing::info!("Holding {}", packages.join(" "));
        let invocation = Invocation::new("apt-mark")
            .arg("hold")
            .args(packages.iter().copied())
            .env("DEBIAN_FRONTEND", "noninteractive");
        self.exec.run(&invocation).map_err(|source| PackageError::Hold {
            packages: to_owned(packages),
            source,
        })
    }

    pub fn keyring(&self, name: &str) -> KeyringFile {
        self.paths.keyring_dir.keyring(name)
    }

    /// Download an ASCII-armored key and store it dearmored as `<keyring dir>/<name>.gpg`.
    ///
    /// A keyring file that already exists short-circuits, even if `url` now serves a different key.
    pub async fn add_key(&self, name: &str, url: &str) -> Result<Change, PackageError> {
        tracing::info!("Adding signing key {name}");
        let file = self.keyring(name);
        if file.exists() {
            tracing::info!("Signing key {} already exists", file.display());
            return Ok(Change::Unchanged);
        }
        let key = self.fetch.fetch(url).await.map_err(|source| PackageError::DownloadKey {
            name: name.to_owned(),
            source,
        })?;
        let write_err = |source| PackageError::Write {
            path: file.0.clone(),
            source,
        };
        file.create_parent().map_err(write_err)?;
        // gpg leaves partial output behind on failure, and an existing keyring is never
        // revisited, so it only ever writes into a scratch directory.
        let staging = tempfile::Builder::new()
            .prefix(".ki-")
            .tempdir_in(&self.paths.keyring_dir.0)
            .map_err(write_err)?;
        let staged = staging.path().join(format!("{name}.gpg"));
        let dearmor = Invocation::new("gpg")
            .args(["--dearmor", "-o"])
            .arg(staged.display().to_string())
            .stdin(key.to_vec());
        self.exec.run(&dearmor).map_err(|source| PackageError::ImportKey {
            name: name.to_owned(),
            source,
        })?;
        tracing::info!("Writing {}", file.display());
        std::fs::rename(&staged, &file.0).map_err(write_err)?;
        Ok(Change::Applied)
    }

    /// Write the source list for `repo`, replacing any previous definition under the same name.
    ///
    /// Definitions stored under other names are left alone.
    pub fn add_repository(&self, repo: &Repository) -> Result<Change, PackageError> {
        let file = self.paths.sources_dir.source_list(&repo.name);
        let contents = repo.render();
        if file.read_to_string().is_ok_and(|existing| existing == contents) {
            tracing::info!("Repository {} is already configured", repo.name);
            return Ok(Change::Unchanged);
        }
        tracing::info!("Writing {}", file.display());
        file.write_atomic(contents, 0o644).map_err(|source| PackageError::Write {
            path: file.0.clone(),
            source,
        })?;
        Ok(Change::Applied)
    }
}

fn to_owned(packages: &[&str]) -> Vec<String> {
    packages.iter().map(|p| (*p).to_owned()).collect()
}
