use anyhow::Context;
use ki_bootstrap::exec::HostExecutor;
use ki_bootstrap::paths::HostPaths;
use ki_bootstrap::service::{ServiceOptions, install_service};

/// Run `ki up` in the background as a oneshot systemd service.
///
/// Meant for cloud-init, which shouldn't block on the whole bootstrap.
#[derive(clap::Args)]
pub(super) struct InstallService {
    /// Passed through to `ki up --join`.
    #[arg(long, value_name = "CONTROL_PLANE")]
    join: Option<String>,
}

impl InstallService {
    pub(super) fn exec(self, paths: &HostPaths) -> anyhow::Result<()> {
        let executable = std::env::current_exe().context("failed to locate the ki executable")?;
        let opts = ServiceOptions {
            executable,
            join: self.join,
        };
        install_service(&HostExecutor, paths, &opts).context("failed to install the ki service")
    }
}
