//! The ordered steps that turn a host into a cluster node.
//!
//! A role's plan is fixed. Steps run strictly one after another, since each relies on what the
//! previous ones left on the host, and the run stops at the first failure. Any step can be
//! skipped by name, which is how a partially completed run is resumed.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use anyhow::Context;
use ki_paths::HostPaths;
use tokio::time::Instant;
use tracing::Instrument;

use crate::address::default_route_address;
use crate::binary::{BinaryInstaller, InstallOutcome};
use crate::cloud::HetznerCloud;
use crate::cloud_controller::CloudControllerInstaller;
use crate::config::KiConfig;
use crate::coordinator::{ClusterBootstrapCoordinator, InitOptions, JoinOptions};
use crate::exec::SystemExecutor;
use crate::fetch::{Fetch, http_client};
use crate::helm;
use crate::ingress::install_default_ingress;
use crate::networking::{CniOptions, NetworkingInstaller};
use crate::packages::{PackageRepositoryManager, Repository};
use crate::preflight::{check_os, check_port_free, release_codename};
use crate::probe::PortProbe;
use crate::runtime::ContainerRuntime;
use crate::service::Systemctl;
use crate::system::{SwapOutcome, SystemConfigurator};
use crate::{Change, NodeRole};

const PREREQUISITES: &[&str] = &[
    "curl",
    "gnupg2",
    "software-properties-common",
    "apt-transport-https",
    "ca-certificates",
];
const KUBERNETES_PACKAGES: &[&str] = &["kubelet", "kubeadm", "kubectl"];
const CONTAINERD_MODULES: &[&str] = &["overlay", "br_netfilter"];
const KUBERNETES_PARAMETERS: [(&str, u8); 3] = [
    ("net.bridge.bridge-nf-call-ip6tables", 1),
    ("net.bridge.bridge-nf-call-iptables", 1),
    ("net.ipv4.ip_forward", 1),
];
const DOCKER_REPO_URL: &str = "https://download.docker.com/linux/ubuntu";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum Step {
    CheckOs,
    CheckPorts,
    DisableSwap,
    UpdatePackageIndex,
    LoadKernelModules,
    ConfigureKernelParameters,
    InstallPrerequisites,
    AddContainerRepository,
    InstallContainerRuntime,
    ConfigureContainerRuntime,
    AddKubernetesRepository,
    InstallKubernetes,
    InstallBinaries,
    InitControlPlane,
    InstallNetworking,
    InstallCloudController,
    InstallIngress,
    JoinCluster,
}

const HOST_STEPS: [Step; 13] = [
    Step::CheckOs,
    Step::CheckPorts,
    Step::DisableSwap,
    Step::UpdatePackageIndex,
    Step::LoadKernelModules,
    Step::ConfigureKernelParameters,
    Step::InstallPrerequisites,
    Step::AddContainerRepository,
    Step::InstallContainerRuntime,
    Step::ConfigureContainerRuntime,
    Step::AddKubernetesRepository,
    Step::InstallKubernetes,
    Step::InstallBinaries,
];

/// Every step `role` runs, in order.
pub fn plan(role: NodeRole) -> Vec<Step> {
    let cluster: &[Step] = match role {
        NodeRole::ControlPlane => &[
            Step::InitControlPlane,
            Step::InstallNetworking,
            Step::InstallCloudController,
            Step::InstallIngress,
        ],
        NodeRole::Worker => &[Step::JoinCluster],
    };
    HOST_STEPS.iter().chain(cluster).copied().collect()
}

/// How this node takes part in the cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Membership {
    ControlPlane,
    Worker { control_plane: String },
}

impl Membership {
    pub fn role(&self) -> NodeRole {
        match self {
            Membership::ControlPlane => NodeRole::ControlPlane,
            Membership::Worker { .. } => NodeRole::Worker,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    Done,
    /// The host was already in the state the step produces.
    AlreadySatisfied,
    Skipped(String),
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepOutcome::Done => f.write_str("done"),
            StepOutcome::AlreadySatisfied => f.write_str("already satisfied"),
            StepOutcome::Skipped(reason) => write!(f, "skipped ({reason})"),
        }
    }
}

impl From<Change> for StepOutcome {
    fn from(change: Change) -> Self {
        match change {
            Change::Applied => StepOutcome::Done,
            Change::Unchanged => StepOutcome::AlreadySatisfied,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StepReport {
    pub step: Step,
    pub outcome: StepOutcome,
    pub elapsed: Duration,
}

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("step {step} failed")]
    StepFailed {
        step: Step,
        #[source]
        source: anyhow::Error,
    },
}

/// Facts discovered by one step and reused by later ones.
#[derive(Default)]
struct Discovered {
    codename: Option<String>,
    advertise_address: Option<String>,
}

pub struct Pipeline<'a, E, F, P> {
    exec: &'a E,
    fetch: &'a F,
    probe: &'a P,
    paths: &'a HostPaths,
    config: &'a KiConfig,
    skip: BTreeSet<Step>,
}

impl<'a, E, F, P> Pipeline<'a, E, F, P>
where
    E: SystemExecutor,
    F: Fetch,
    P: PortProbe,
{
    pub fn new(exec: &'a E, fetch: &'a F, probe: &'a P, paths: &'a HostPaths, config: &'a KiConfig) -> Self {
        Self {
            exec,
            fetch,
            probe,
            paths,
            config,
            skip: BTreeSet::new(),
        }
    }

    /// Leave `steps` out of the run. They are reported as skipped.
    pub fn skipping(mut self, steps: impl IntoIterator<Item = Step>) -> Self {
        self.skip.extend(steps);
        self
    }

    /// Run the plan for `membership`'s role, stopping at the first failing step.
    pub async fn run(&self, membership: &Membership) -> Result<Vec<StepReport>, PipelineError> {
        let role = membership.role();
        tracing::info!("Bootstrapping a {role} node");
        let mut discovered = Discovered::default();
        let mut reports = Vec::new();
        for step in plan(role) {
            let start = Instant::now();
            let outcome = if self.skip.contains(&step) {
                StepOutcome::Skipped("requested".to_owned())
            } else {
                self.execute(step, membership, &mut discovered)
                    .instrument(tracing::info_span!("step", %step))
                    .await
                    .map_err(|source| PipelineError::StepFailed { step, source })?
            };
            let elapsed = start.elapsed();
            tracing::info!("{step}: {outcome} in {elapsed:.1?}");
            reports.push(StepReport { step, outcome, elapsed });
        }
        Ok(reports)
    }

    fn packages(&self) -> PackageRepositoryManager<'a, E, F> {
        PackageRepositoryManager::new(self.exec, self.fetch, self.paths)
    }

    fn codename(&self, discovered: &mut Discovered) -> anyhow::Result<String> {
        if let Some(codename) = &discovered.codename {
            return Ok(codename.clone());
        }
        let codename = release_codename(self.exec)?;
        discovered.codename = Some(codename.clone());
        Ok(codename)
    }

    fn advertise_address(&self, discovered: &mut Discovered) -> anyhow::Result<String> {
        if let Some(address) = &discovered.advertise_address {
            return Ok(address.clone());
        }
        let address = match &self.config.advertise_address {
            Some(address) => address.clone(),
            None => default_route_address(self.exec).context("failed to detect the advertise address")?,
        };
        tracing::info!("Advertise address: {address}");
        discovered.advertise_address = Some(address.clone());
        Ok(address)
    }

    async fn execute(
        &self,
        step: Step,
        membership: &Membership,
        discovered: &mut Discovered,
    ) -> anyhow::Result<StepOutcome> {
        let config = self.config;
        let system = SystemConfigurator::new(self.exec, self.paths);
        let outcome = match step {
            Step::CheckOs => {
                discovered.codename = Some(check_os(self.exec, &config.supported_releases)?);
                StepOutcome::Done
            }
            Step::CheckPorts => {
                for &port in &config.preflight_ports {
                    check_port_free(self.probe, port).await?;
                }
                StepOutcome::Done
            }
            Step::DisableSwap => match system.disable_swap()? {
                SwapOutcome::AlreadyDisabled => StepOutcome::AlreadySatisfied,
                SwapOutcome::Disabled { .. } => StepOutcome::Done,
            },
            Step::UpdatePackageIndex => {
                self.packages().update()?;
                StepOutcome::Done
            }
            Step::LoadKernelModules => {
                system.load_kernel_modules("containerd", CONTAINERD_MODULES)?;
                StepOutcome::Done
            }
            Step::ConfigureKernelParameters => {
                system.configure_kernel_parameters("kubernetes", KUBERNETES_PARAMETERS)?;
                StepOutcome::Done
            }
            Step::InstallPrerequisites => {
                self.packages().install(PREREQUISITES)?;
                StepOutcome::Done
            }
            Step::AddContainerRepository => {
                let codename = self.codename(discovered)?;
                let packages = self.packages();
                let key = packages.add_key("docker", &format!("{DOCKER_REPO_URL}/gpg")).await?;
                let repo = packages.add_repository(&Repository {
                    name: "docker".to_owned(),
                    url: DOCKER_REPO_URL.to_owned(),
                    suite: codename,
                    components: vec!["stable".to_owned()],
                    keyring: packages.keyring("docker"),
                })?;
                self.refresh_if_changed(key, repo)?
            }
            Step::InstallContainerRuntime => {
                self.packages().install(&["containerd.io"])?;
                StepOutcome::Done
            }
            Step::ConfigureContainerRuntime => ContainerRuntime::new(self.exec, self.paths).configure()?.into(),
            Step::AddKubernetesRepository => {
                let url = format!("https://pkgs.k8s.io/core:/stable:/{}/deb/", config.kubernetes_version);
                let packages = self.packages();
                let key = packages.add_key("kubernetes", &format!("{url}Release.key")).await?;
                let repo = packages.add_repository(&Repository {
                    name: "kubernetes".to_owned(),
                    url,
                    suite: "/".to_owned(),
                    components: vec![],
                    keyring: packages.keyring("kubernetes"),
                })?;
                self.refresh_if_changed(key, repo)?
            }
            Step::InstallKubernetes => {
                let packages = self.packages();
                packages.install(KUBERNETES_PACKAGES)?;
                packages.hold(KUBERNETES_PACKAGES)?;
                Systemctl::new(self.exec).enable_now("kubelet")?;
                StepOutcome::Done
            }
            Step::InstallBinaries => self.install_binaries().await?,
            Step::InitControlPlane => {
                let opts = InitOptions {
                    advertise_address: self.advertise_address(discovered)?,
                    api_server_port: config.api_server_port,
                    pod_network_cidr: config.pod_network_cidr.clone(),
                    service_cidr: config.service_cidr.clone(),
                    extra_sans: config.extra_sans.clone(),
                    skip_phases: config.skip_phases.clone(),
                };
                ClusterBootstrapCoordinator::new(self.exec, self.probe, self.paths).init_control_plane(&opts)?;
                StepOutcome::Done
            }
            Step::InstallNetworking => {
                helm::ensure_installed(self.paths)?;
                let opts = CniOptions {
                    api_server_host: self.advertise_address(discovered)?,
                    api_server_port: config.api_server_port,
                    chart_version: config.networking.chart_version.clone(),
                };
                NetworkingInstaller::new(self.exec, self.paths).install(&opts)?;
                StepOutcome::Done
            }
            Step::InstallCloudController => self.install_cloud_controller().await?,
            Step::InstallIngress => {
                install_default_ingress(self.exec, &self.paths.admin_kubeconfig)?;
                StepOutcome::Done
            }
            Step::JoinCluster => {
                let Membership::Worker { control_plane } = membership else {
                    anyhow::bail!("only a worker joins an existing control plane");
                };
                let opts = JoinOptions {
                    control_plane: control_plane.clone(),
                    api_server_port: config.api_server_port,
                    remote_user: config.remote_user.clone(),
                    readiness: config.join.readiness(),
                    retrieval: config.join.retrieval(),
                };
                ClusterBootstrapCoordinator::new(self.exec, self.probe, self.paths)
                    .join_worker(&opts)
                    .await?;
                StepOutcome::Done
            }
        };
        Ok(outcome)
    }

    /// A new key or source list only takes effect after the index is refreshed.
    fn refresh_if_changed(&self, key: Change, repo: Change) -> anyhow::Result<StepOutcome> {
        if key.applied() || repo.applied() {
            self.packages().update()?;
            Ok(StepOutcome::Done)
        } else {
            Ok(StepOutcome::AlreadySatisfied)
        }
    }

    async fn install_binaries(&self) -> anyhow::Result<StepOutcome> {
        if self.config.binaries.is_empty() {
            return Ok(StepOutcome::Skipped("no binaries configured".to_owned()));
        }
        let installer = BinaryInstaller::new(self.fetch, &self.paths.bin_dir);
        let mut installed = 0;
        for artifact in &self.config.binaries {
            if installer.install(artifact).await? == InstallOutcome::Installed {
                installed += 1;
            }
        }
        Ok(if installed == 0 {
            StepOutcome::AlreadySatisfied
        } else {
            StepOutcome::Done
        })
    }

    async fn install_cloud_controller(&self) -> anyhow::Result<StepOutcome> {
        let cloud = &self.config.cloud;
        let token_file = self
            .paths
            .root_dir
            .0
            .join(cloud.token_file.strip_prefix("/").unwrap_or(cloud.token_file.as_path()));
        if !token_file.exists() {
            return Ok(StepOutcome::Skipped(format!("{} does not exist", token_file.display())));
        }
        let token = std::fs::read_to_string(&token_file)
            .with_context(|| format!("failed to read {}", token_file.display()))?;
        let token = token.trim();
        anyhow::ensure!(!token.is_empty(), "{} is empty", token_file.display());
        helm::ensure_installed(self.paths)?;

        let api = HetznerCloud::new(http_client()?, token);
        CloudControllerInstaller::new(self.exec, self.paths)
            .install(&api, token, &cloud.network_name)
            .await?;
        Ok(StepOutcome::Done)
    }
}
