//! containerd configuration.

use std::io;
use std::path::PathBuf;

use ki_paths::HostPaths;

use crate::Change;
use crate::exec::{ExecError, Invocation, SystemExecutor};
use crate::service::{ServiceError, Systemctl};

const CGROUP_OPTION: &str = "SystemdCgroup";

#[derive(thiserror::Error, Debug)]
pub enum RuntimeError {
    #[error("failed to generate the default containerd configuration")]
    DefaultConfig(#[source] ExecError),
    #[error("default containerd configuration has no {CGROUP_OPTION} option")]
    CgroupOptionMissing,
    #[error("failed to write {}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Restart(#[from] ServiceError),
}

pub struct ContainerRuntime<'a, E> {
    exec: &'a E,
    paths: &'a HostPaths,
}

impl<'a, E: SystemExecutor> ContainerRuntime<'a, E> {
    pub fn new(exec: &'a E, paths: &'a HostPaths) -> Self {
        Self { exec, paths }
    }

    /// Write containerd's default configuration with the systemd cgroup driver and restart it.
    ///
    /// The kubelet defaults to the systemd driver, and both sides must agree.
    pub fn configure(&self) -> Result<Change, RuntimeError> {
        let defaults = self
            .exec
            .read(&Invocation::new("containerd").args(["config", "default"]))
            .map_err(RuntimeError::DefaultConfig)?;
        let config = use_systemd_cgroup(&defaults).ok_or(RuntimeError::CgroupOptionMissing)?;

        let file = &self.paths.containerd_config;
        if file.read_to_string().is_ok_and(|existing| existing == config) {
            tracing::info!("containerd is already configured");
            return Ok(Change::Unchanged);
        }
        tracing::info!("Writing {}", file.display());
        file.write_atomic(config, 0o644).map_err(|source| RuntimeError::Write {
            path: file.0.clone(),
            source,
        })?;
        Systemctl::new(self.exec).restart("containerd")?;
        Ok(Change::Applied)
    }
}

/// Set every `SystemdCgroup = ...` line to `true`, keeping its indentation.
fn use_systemd_cgroup(config: &str) -> Option<String> {
    let mut found = false;
    let mut out = String::with_capacity(config.len());
    for line in config.split_inclusive('\n') {
        let trimmed = line.trim_start();
        let is_option = trimmed
            .strip_prefix(CGROUP_OPTION)
            .is_some_and(|rest| rest.trim_start().starts_with('='));
        if is_option {
            found = true;
            let indent = &line[..line.len() - trimmed.len()];
            let eol = if line.ends_with('\n') { "\n" } else { "" };
            out.push_str(indent);
            out.push_str(CGROUP_OPTION);
            out.push_str(" = true");
            out.push_str(eol);
        } else {
            out.push_str(line);
        }
    }
    found.then_some(out)
}
