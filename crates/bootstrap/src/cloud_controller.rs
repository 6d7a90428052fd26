//! Hetzner cloud controller manager and CSI driver.
//!
//! Both charts read the API token and the private network from one secret, so the network is
//! resolved to its numeric ID before anything is applied to the cluster.

use ki_paths::HostPaths;

use crate::cloud::{CloudApi, CloudError, ResourceKind};
use crate::exec::SystemExecutor;
use crate::helm::{Helm, HelmError, Release};
use crate::kubectl::{ApplyError, Kubectl};

pub const NAMESPACE: &str = "hcloud";
pub const SECRET: &str = "hcloud";
pub const CHART_REPO_NAME: &str = "hcloud";
pub const CHART_REPO_URL: &str = "https://charts.hetzner.cloud";

const RELEASES: [(&str, &str); 2] = [
    ("hccm", "hcloud/hcloud-cloud-controller-manager"),
    ("hcsi", "hcloud/hcloud-csi"),
];

#[derive(thiserror::Error, Debug)]
pub enum CloudControllerError {
    #[error("failed to look up network {name}")]
    LookupNetwork {
        name: String,
        #[source]
        source: CloudError,
    },
    #[error("no network named {name} in the project")]
    NetworkNotFound { name: String },
    #[error(transparent)]
    Apply(#[from] ApplyError),
    #[error(transparent)]
    Helm(#[from] HelmError),
}

pub struct CloudControllerInstaller<'a, E> {
    exec: &'a E,
    paths: &'a HostPaths,
}

impl<'a, E: SystemExecutor> CloudControllerInstaller<'a, E> {
    pub fn new(exec: &'a E, paths: &'a HostPaths) -> Self {
        Self { exec, paths }
    }

    pub async fn install(
        &self,
        cloud: &impl CloudApi,
        token: &str,
        network_name: &str,
    ) -> Result<(), CloudControllerError> {
        let networks = cloud
            .list(ResourceKind::Network)
            .await
            .map_err(|source| CloudControllerError::LookupNetwork {
                name: network_name.to_owned(),
                source,
            })?;
        let network = networks
            .into_iter()
            .find(|n| n.name == network_name)
            .ok_or_else(|| CloudControllerError::NetworkNotFound {
                name: network_name.to_owned(),
            })?;
        tracing::debug!("Using {network}");

        let kubectl = Kubectl::new(self.exec, &self.paths.admin_kubeconfig);
        kubectl.apply_namespace(NAMESPACE)?;
        let network_id = network.id.to_string();
        kubectl.apply_secret(NAMESPACE, SECRET, [("token", token), ("network", network_id.as_str())])?;

        let helm = Helm::new(self.exec, &self.paths.admin_kubeconfig);
        helm.repo_add(CHART_REPO_NAME, CHART_REPO_URL)?;
        for (name, chart) in RELEASES {
            helm.upgrade_install(&Release {
                name,
                chart,
                namespace: NAMESPACE,
                ..Default::default()
            })?;
        }
        Ok(())
    }
}
