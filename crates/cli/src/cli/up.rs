use anyhow::Context;
use ki_bootstrap::config::KiConfig;
use ki_bootstrap::exec::HostExecutor;
use ki_bootstrap::fetch::{HttpFetcher, http_client};
use ki_bootstrap::paths::HostPaths;
use ki_bootstrap::pipeline::{Membership, Pipeline, Step, StepOutcome};
use ki_bootstrap::probe::TcpProbe;

use super::tokio_block_on;

/// Bootstrap this host as a control plane, or as a worker with `--join`.
#[derive(clap::Args)]
pub(super) struct Up {
    /// Join the cluster whose control plane has this address instead of creating one.
    #[arg(long, value_name = "CONTROL_PLANE")]
    pub(super) join: Option<String>,
    /// Leave a step out, e.g. to resume a run that already got past it. Can be repeated.
    #[arg(long, value_name = "STEP")]
    pub(super) skip: Vec<Step>,
}

impl Up {
    pub(super) fn exec(self, paths: &HostPaths, config: &KiConfig) -> anyhow::Result<()> {
        let membership = match self.join {
            Some(control_plane) => Membership::Worker { control_plane },
            None => Membership::ControlPlane,
        };
        let exec = HostExecutor;
        let fetch = HttpFetcher::new(http_client()?);
        let probe = TcpProbe::default();
        let pipeline = Pipeline::new(&exec, &fetch, &probe, paths, config).skipping(self.skip);

        let reports = tokio_block_on(pipeline.run(&membership))?.context("bootstrap failed")?;

        let elapsed: std::time::Duration = reports.iter().map(|r| r.elapsed).sum();
        let skipped = reports
            .iter()
            .filter(|r| matches!(r.outcome, StepOutcome::Skipped(_)))
            .count();
        tracing::info!(
            "{} node is ready after {elapsed:.1?} ({skipped} of {} steps skipped)",
            membership.role(),
            reports.len()
        );
        Ok(())
    }
}
