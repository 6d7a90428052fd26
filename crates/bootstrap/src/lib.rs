//! Turns a bare Ubuntu host into a kubeadm cluster node, and removes a cluster's cloud
//! resources again.
//!
//! Each component takes its collaborators explicitly: a [`exec::SystemExecutor`] for host
//! commands, a [`fetch::Fetch`] for downloads, a [`probe::PortProbe`] for reachability and a
//! [`cloud::CloudApi`] for the provider. [`pipeline`] strings them together per [`NodeRole`].

pub mod address;
pub mod binary;
pub mod cloud;
pub mod cloud_controller;
pub mod config;
pub mod coordinator;
pub mod credential;
pub mod exec;
pub mod fetch;
pub mod helm;
pub mod ingress;
pub mod kubectl;
pub mod networking;
pub mod packages;
pub mod pipeline;
pub mod poll;
pub mod preflight;
pub mod probe;
pub mod runtime;
pub mod service;
pub mod system;
pub mod teardown;

pub use ki_paths as paths;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display)]
pub enum NodeRole {
    #[strum(to_string = "control plane")]
    ControlPlane,
    #[strum(to_string = "worker")]
    Worker,
}

/// Whether an idempotent operation had to touch the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Change {
    Applied,
    Unchanged,
}

impl Change {
    pub fn applied(self) -> bool {
        self == Change::Applied
    }
}
