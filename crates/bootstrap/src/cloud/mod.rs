//! The slice of a cloud provider API that teardown and the cloud controller need.

use std::fmt;

mod hetzner;

pub use hetzner::HetznerCloud;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ResourceKind {
    Server,
    #[strum(to_string = "load balancer")]
    LoadBalancer,
    Network,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloudResource {
    pub kind: ResourceKind,
    pub id: u64,
    pub name: String,
}

impl fmt::Display for CloudResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.kind, self.name, self.id)
    }
}

/// Handle to an asynchronous provider-side operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ActionId(pub u64);

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "action {}", self.0)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum CloudError {
    #[error("request to {endpoint} failed")]
    Transport {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{endpoint} returned HTTP {status}: {message} ({code})")]
    Api {
        endpoint: String,
        status: u16,
        code: String,
        message: String,
    },
    #[error("{action} failed: {message} ({code})")]
    ActionFailed { action: ActionId, code: String, message: String },
}

#[async_trait::async_trait]
pub trait CloudApi: Send + Sync {
    /// Every resource of `kind` in the account.
    async fn list(&self, kind: ResourceKind) -> Result<Vec<CloudResource>, CloudError>;

    /// Request deletion. Returns the action to wait on when the provider completes it asynchronously.
    async fn delete(&self, resource: &CloudResource) -> Result<Option<ActionId>, CloudError>;

    /// Block until `action` has finished, failing if it finished unsuccessfully.
    async fn wait_for_action(&self, action: ActionId) -> Result<(), CloudError>;
}
