//! `/etc/ki/config.toml`. Every key is optional.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::binary::BinaryArtifact;
use crate::poll::PollPolicy;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration in {}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KiConfig {
    /// Distribution codenames the bootstrap has been validated on.
    pub supported_releases: Vec<String>,
    pub api_server_port: u16,
    /// Local ports that must be free before anything is changed.
    pub preflight_ports: Vec<u16>,
    pub pod_network_cidr: String,
    pub service_cidr: String,
    pub skip_phases: Vec<String>,
    pub extra_sans: Vec<String>,
    /// Detected from the default route when unset.
    pub advertise_address: Option<String>,
    /// Minor release stream of the Kubernetes package repository, e.g. `v1.31`.
    pub kubernetes_version: String,
    pub remote_user: String,
    pub join: JoinConfig,
    pub teardown: TeardownConfig,
    /// Installed under `/usr/local/bin`. The chart steps need `helm` from here or the host.
    #[serde(rename = "binary")]
    pub binaries: Vec<BinaryArtifact>,
    pub networking: NetworkingConfig,
    pub cloud: CloudConfig,
}

impl Default for KiConfig {
    fn default() -> Self {
        Self {
            supported_releases: vec!["noble".to_owned()],
            api_server_port: 6443,
            preflight_ports: vec![6443],
            pod_network_cidr: "10.244.0.0/16".to_owned(),
            service_cidr: "10.96.0.0/12".to_owned(),
            skip_phases: vec!["addon/kube-proxy".to_owned()],
            extra_sans: vec![],
            advertise_address: None,
            kubernetes_version: "v1.31".to_owned(),
            remote_user: "cluster".to_owned(),
            join: JoinConfig::default(),
            teardown: TeardownConfig::default(),
            binaries: vec![],
            networking: NetworkingConfig::default(),
            cloud: CloudConfig::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JoinConfig {
    pub poll_interval_secs: u64,
    pub retry_interval_secs: u64,
    /// Applies to the port wait and the credential retrieval separately.
    pub deadline_secs: u64,
}

impl Default for JoinConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 1,
            retry_interval_secs: 1,
            deadline_secs: 300,
        }
    }
}

impl JoinConfig {
    pub fn readiness(&self) -> PollPolicy {
        PollPolicy::new(
            Duration::from_secs(self.poll_interval_secs),
            Duration::from_secs(self.deadline_secs),
        )
    }

    pub fn retrieval(&self) -> PollPolicy {
        PollPolicy::new(
            Duration::from_secs(self.retry_interval_secs),
            Duration::from_secs(self.deadline_secs),
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TeardownConfig {
    pub deadline_secs: u64,
}

impl Default for TeardownConfig {
    fn default() -> Self {
        Self { deadline_secs: 300 }
    }
}

impl TeardownConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkingConfig {
    pub chart_version: String,
}

impl Default for NetworkingConfig {
    fn default() -> Self {
        Self {
            chart_version: "1.16.3".to_owned(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CloudConfig {
    /// Holds the API token. The cloud controller is skipped when it doesn't exist.
    pub token_file: PathBuf,
    /// Private network the cloud controller routes pods through.
    pub network_name: String,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            token_file: PathBuf::from("/root/.hcloud"),
            network_name: "kubernetes-cluster".to_owned(),
        }
    }
}

impl KiConfig {
    pub fn parse(path: impl Into<PathBuf>, text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.into(),
            source,
        })
    }

    /// Load the configuration at `path`, or the defaults if there's no such file.
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::parse(path, &text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("no config at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}
