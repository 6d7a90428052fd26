use std::future::Future;
use std::path::PathBuf;

use anyhow::Context;
use ki_bootstrap::config::KiConfig;
use ki_bootstrap::paths::{HostPaths, RootDir};

use crate::logging::configure_logging;

mod destroy;
mod install_service;
mod up;

/// Turn this host into a Kubernetes node, or tear a cluster's cloud resources down.
#[derive(clap::Parser)]
#[command(name = "ki", version)]
pub struct Args {
    /// Configuration file. Defaults to etc/ki/config.toml under the root directory.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Resolve every host path under this directory instead of `/`.
    #[arg(long, global = true)]
    root_dir: Option<RootDir>,
    #[command(subcommand)]
    cmd: Subcommand,
}

impl Args {
    pub fn exec(self) -> anyhow::Result<()> {
        let paths = match &self.root_dir {
            Some(root_dir) => HostPaths::from_root_dir(root_dir),
            None => HostPaths::system(),
        };
        configure_logging(&paths.config_dir.log_conf());
        let config_file = self.config.unwrap_or_else(|| paths.config_dir.config_toml().0);
        let config = KiConfig::load(&config_file).context("failed to load configuration")?;
        match self.cmd {
            Subcommand::Up(cmd) => cmd.exec(&paths, &config),
            Subcommand::Destroy(cmd) => cmd.exec(&config),
            Subcommand::InstallService(cmd) => cmd.exec(&paths),
        }
    }
}

#[derive(clap::Subcommand)]
enum Subcommand {
    Up(up::Up),
    Destroy(destroy::Destroy),
    InstallService(install_service::InstallService),
}

fn tokio_block_on<Fut: Future>(fut: Fut) -> anyhow::Result<Fut::Output> {
    Ok(tokio::runtime::Runtime::new()?.block_on(fut))
}

#[derive(clap::Args)]
struct ForceYes {
    /// Skip the confirmation dialog.
    #[arg(long, short)]
    yes: bool,
}

impl ForceYes {
    fn confirm(self, prompt: String) -> anyhow::Result<bool> {
        let yes = self.yes
            || dialoguer::Confirm::new()
                .with_prompt(prompt)
                .default(false)
                .interact()?;
        Ok(yes)
    }
}
