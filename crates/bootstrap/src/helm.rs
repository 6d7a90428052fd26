use ki_paths::{HostPaths, KubeconfigFile, ValuesFile};

use crate::exec::{ExecError, Invocation, SystemExecutor};

#[derive(thiserror::Error, Debug)]
pub enum HelmError {
    #[error("helm is not installed; add a [[binary]] entry for it to the configuration or install it on the host")]
    NotInstalled,
    #[error("failed to add chart repository {name}")]
    RepoAdd {
        name: String,
        #[source]
        source: ExecError,
    },
    #[error("failed to install release {release} ({chart})")]
    Upgrade {
        release: String,
        chart: String,
        #[source]
        source: ExecError,
    },
}

/// Fail before any chart work starts when there's no `helm` to run.
pub fn ensure_installed(paths: &HostPaths) -> Result<(), HelmError> {
    match paths.find_executable("helm") {
        Some(helm) => {
            tracing::debug!("using {}", helm.display());
            Ok(())
        }
        None => Err(HelmError::NotInstalled),
    }
}

/// A chart installed or upgraded in place with `helm upgrade --install`.
#[derive(Clone, Debug, Default)]
pub struct Release<'a> {
    pub name: &'a str,
    pub chart: &'a str,
    pub namespace: &'a str,
    pub version: Option<&'a str>,
    pub values: Option<&'a ValuesFile>,
    pub create_namespace: bool,
}

pub struct Helm<'a, E> {
    exec: &'a E,
    kubeconfig: &'a KubeconfigFile,
}

impl<'a, E: SystemExecutor> Helm<'a, E> {
    pub fn new(exec: &'a E, kubeconfig: &'a KubeconfigFile) -> Self {
        Self { exec, kubeconfig }
    }

    fn helm(&self) -> Invocation {
        Invocation::new("helm").env("KUBECONFIG", self.kubeconfig.display().to_string())
    }

    pub fn repo_add(&self, name: &str, url: &str) -> Result<(), HelmError> {
        tracing::info!("helm repo add {name} {url}");
        let invocation = self.helm().args(["repo", "add", "--force-update", name, url]);
        self.exec.run(&invocation).map_err(|source| HelmError::RepoAdd {
            name: name.to_owned(),
            source,
        })
    }

    pub fn upgrade_install(&self, release: &Release<'_>) -> Result<(), HelmError> {
        tracing::info!("Installing {} ({})", release.name, release.chart);
        let mut invocation = self.helm().args(["upgrade", "--install"]);
        if let Some(values) = release.values {
            invocation = invocation.arg("--values").arg(values.display().to_string());
        }
        if release.create_namespace {
            invocation = invocation.arg("--create-namespace");
        }
        invocation = invocation.args(["--namespace", release.namespace]);
        if let Some(version) = release.version {
            invocation = invocation.args(["--version", version]);
        }
        invocation = invocation.args([release.name, release.chart]);
        self.exec.run(&invocation).map_err(|source| HelmError::Upgrade {
            release: release.name.to_owned(),
            chart: release.chart.to_owned(),
            source,
        })
    }
}
