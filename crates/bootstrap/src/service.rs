//! systemd units: a thin `systemctl` wrapper and the unit that runs `ki up` at boot.

use std::io;
use std::path::{Path, PathBuf};

use ki_paths::HostPaths;

use crate::exec::{ExecError, Invocation, SystemExecutor};

pub const SERVICE_UNIT: &str = "ki.service";

#[derive(thiserror::Error, Debug)]
pub enum ServiceError {
    #[error("systemctl {action} {unit} failed")]
    Systemctl {
        action: &'static str,
        unit: String,
        #[source]
        source: ExecError,
    },
    #[error("systemctl daemon-reload failed")]
    Reload(#[source] ExecError),
    #[error("failed to write {}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub struct Systemctl<'a, E>(&'a E);

impl<'a, E: SystemExecutor> Systemctl<'a, E> {
    pub fn new(exec: &'a E) -> Self {
        Self(exec)
    }

    fn unit_action(&self, action: &'static str, extra: &[&str], unit: &str) -> Result<(), ServiceError> {
        tracing::info!("systemctl {action} {unit}");
        let invocation = Invocation::new("systemctl")
            .arg(action)
            .args(extra.iter().copied())
            .arg(unit);
        self.0.run(&invocation).map_err(|source| ServiceError::Systemctl {
            action,
            unit: unit.to_owned(),
            source,
        })
    }

    pub fn daemon_reload(&self) -> Result<(), ServiceError> {
        self.0
            .run(&Invocation::new("systemctl").arg("daemon-reload"))
            .map_err(ServiceError::Reload)
    }

    pub fn enable_now(&self, unit: &str) -> Result<(), ServiceError> {
        self.unit_action("enable", &["--now"], unit)
    }

    pub fn restart(&self, unit: &str) -> Result<(), ServiceError> {
        self.unit_action("restart", &[], unit)
    }

    /// Queue a start job and return without waiting for it.
    pub fn start_no_block(&self, unit: &str) -> Result<(), ServiceError> {
        self.unit_action("start", &["--no-block"], unit)
    }
}

#[derive(Clone, Debug)]
pub struct ServiceOptions {
    /// The `ki` executable the unit runs.
    pub executable: PathBuf,
    /// Join this control plane instead of initializing one.
    pub join: Option<String>,
}

impl ServiceOptions {
    /// Contents of the environment file read by the unit.
    pub fn render_options(&self) -> String {
        match &self.join {
            Some(addr) => format!("OPTIONS=--join {addr}\n"),
            None => "OPTIONS=\n".to_owned(),
        }
    }
}

pub fn render_unit(executable: &Path, options_file: &Path) -> String {
    format!(
        "\
[Unit]
Description=Kubernetes node bootstrap
Wants=network-online.target
After=network-online.target cloud-final.service

[Service]
Type=oneshot
RemainAfterExit=yes
EnvironmentFile={options}
ExecStart={exe} up $OPTIONS
StandardOutput=journal+console
StandardError=journal+console

[Install]
WantedBy=multi-user.target
",
        options = options_file.display(),
        exe = executable.display(),
    )
}

/// Install `ki up` as a oneshot unit and start it in the background.
pub fn install_service(exec: &impl SystemExecutor, paths: &HostPaths, opts: &ServiceOptions) -> Result<(), ServiceError> {
    tracing::info!("Installing the ki service");
    let options = &paths.service_options;
    tracing::info!("Writing {}", options.display());
    options
        .write_atomic(opts.render_options(), 0o600)
        .map_err(|source| ServiceError::Write {
            path: options.0.clone(),
            source,
        })?;

    // The unit refers to host paths, not to wherever the root dir is mounted.
    let system = HostPaths::system();
    let unit = paths.unit_dir.unit(SERVICE_UNIT);
    tracing::info!("Writing {}", unit.display());
    unit.write_atomic(render_unit(&opts.executable, &system.service_options.0), 0o644)
        .map_err(|source| ServiceError::Write {
            path: unit.0.clone(),
            source,
        })?;

    let systemctl = Systemctl::new(exec);
    systemctl.daemon_reload()?;
    systemctl.start_no_block(SERVICE_UNIT)?;
    tracing::info!("ki service installed");
    Ok(())
}
