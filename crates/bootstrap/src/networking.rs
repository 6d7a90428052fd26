//! Cilium as the cluster CNI, replacing kube-proxy. It also serves as the default ingress
//! controller, behind a single shared load balancer.

use std::io;
use std::path::PathBuf;

use ki_paths::HostPaths;

use crate::exec::SystemExecutor;
use crate::helm::{Helm, HelmError, Release};

pub const CHART_REPO_NAME: &str = "cilium";
pub const CHART_REPO_URL: &str = "https://helm.cilium.io";
pub const CHART: &str = "cilium/cilium";
pub const NAMESPACE: &str = "kube-system";

#[derive(thiserror::Error, Debug)]
pub enum NetworkingError {
    #[error("failed to write {}", .path.display())]
    WriteValues {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Helm(#[from] HelmError),
}

#[derive(Clone, Debug)]
pub struct CniOptions {
    /// Address the agents use to reach the API server. kube-proxy isn't there to route the
    /// service IP, so this must be the control plane's own address.
    pub api_server_host: String,
    pub api_server_port: u16,
    pub chart_version: String,
}

pub fn render_values(opts: &CniOptions) -> String {
    format!(
        "\
k8sServiceHost: \"{host}\"
k8sServicePort: {port}
kubeProxyReplacement: true
ipam:
  mode: kubernetes
operator:
  replicas: 1
ingressController:
  enabled: true
  default: true
  loadbalancerMode: shared
",
        host = opts.api_server_host,
        port = opts.api_server_port,
    )
}

pub struct NetworkingInstaller<'a, E> {
    exec: &'a E,
    paths: &'a HostPaths,
}

impl<'a, E: SystemExecutor> NetworkingInstaller<'a, E> {
    pub fn new(exec: &'a E, paths: &'a HostPaths) -> Self {
        Self { exec, paths }
    }

    pub fn install(&self, opts: &CniOptions) -> Result<(), NetworkingError> {
        let values = self.paths.config_dir.cni_values();
        tracing::info!("Writing {}", values.display());
        values
            .write_atomic(render_values(opts), 0o644)
            .map_err(|source| NetworkingError::WriteValues {
                path: values.0.clone(),
                source,
            })?;

        let helm = Helm::new(self.exec, &self.paths.admin_kubeconfig);
        helm.repo_add(CHART_REPO_NAME, CHART_REPO_URL)?;
        helm.upgrade_install(&Release {
            name: "cilium",
            chart: CHART,
            namespace: NAMESPACE,
            version: Some(&opts.chart_version),
            values: Some(&values),
            create_namespace: false,
        })?;
        Ok(())
    }
}
