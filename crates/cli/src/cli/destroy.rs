use anyhow::Context;
use ki_bootstrap::cloud::HetznerCloud;
use ki_bootstrap::config::KiConfig;
use ki_bootstrap::fetch::http_client;
use ki_bootstrap::teardown::{AllResources, NamePrefix, TeardownOrchestrator};

use super::ForceYes;

/// Delete the servers, load balancers and networks of a Hetzner Cloud project.
///
/// Without `--name-prefix` this removes every such resource in the project, not just the
/// cluster's.
#[derive(clap::Args)]
pub(super) struct Destroy {
    /// Hetzner Cloud API token.
    #[arg(long, env = "HETZNER_TOKEN", hide_env_values = true)]
    token: String,
    /// Only delete resources whose name starts with this prefix.
    #[arg(long, value_name = "PREFIX")]
    name_prefix: Option<String>,
    #[command(flatten)]
    yes: ForceYes,
}

impl Destroy {
    pub(super) fn exec(self, config: &KiConfig) -> anyhow::Result<()> {
        let Self { token, name_prefix, yes } = self;
        let cloud = HetznerCloud::new(http_client()?, token);
        let orchestrator = TeardownOrchestrator::new(&cloud);
        // Pooled connections are bound to the runtime that opened them.
        let runtime = tokio::runtime::Runtime::new()?;

        let deadline = config.teardown.deadline();
        let plan = runtime
            .block_on(async {
                let plan = async {
                    match &name_prefix {
                        Some(prefix) => orchestrator.plan(&NamePrefix(prefix.clone())).await,
                        None => orchestrator.plan(&AllResources).await,
                    }
                };
                tokio::time::timeout(deadline, plan).await
            })
            .with_context(|| format!("listing cloud resources took longer than {}s", deadline.as_secs()))?
            .context("failed to enumerate cloud resources")?;
        if plan.is_empty() {
            tracing::info!("Nothing to delete");
            return Ok(());
        }
        for resource in &plan.resources {
            println!("  {resource}");
        }
        if !yes.confirm(format!("Delete these {} resources?", plan.resources.len()))? {
            return Ok(());
        }

        let report = runtime
            .block_on(orchestrator.execute(plan, deadline))
            .context("teardown failed")?;
        tracing::info!(
            "Deleted {} resources in {:.1?}",
            report.deleted.len(),
            report.elapsed
        );
        Ok(())
    }
}
