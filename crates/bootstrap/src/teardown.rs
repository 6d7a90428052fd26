//! Deletion of a cluster's cloud resources.
//!
//! Servers go first, and each server's deletion is awaited before the next request, because
//! load balancers and networks can't be removed while servers are still attached to them.
//! Resources are enumerated once, up front; anything created afterwards is not seen.

use std::time::Duration;

use tokio::time::Instant;

use crate::cloud::{CloudApi, CloudError, CloudResource, ResourceKind};

/// Deletion order. Later kinds may have attachments to earlier ones.
pub const TEARDOWN_ORDER: [ResourceKind; 3] = [ResourceKind::Server, ResourceKind::LoadBalancer, ResourceKind::Network];

/// Decides which enumerated resources are deleted.
pub trait ResourceSelector {
    fn selects(&self, resource: &CloudResource) -> bool;
}

/// Every resource in the account.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllResources;

impl ResourceSelector for AllResources {
    fn selects(&self, _: &CloudResource) -> bool {
        true
    }
}

/// Resources whose name starts with the given prefix.
#[derive(Clone, Debug)]
pub struct NamePrefix(pub String);

impl ResourceSelector for NamePrefix {
    fn selects(&self, resource: &CloudResource) -> bool {
        resource.name.starts_with(&self.0)
    }
}

impl<F: Fn(&CloudResource) -> bool> ResourceSelector for F {
    fn selects(&self, resource: &CloudResource) -> bool {
        self(resource)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum TeardownError {
    #[error("failed to list {kind}s")]
    List {
        kind: ResourceKind,
        #[source]
        source: CloudError,
    },
    #[error("failed to delete {resource}")]
    Delete {
        resource: CloudResource,
        #[source]
        source: CloudError,
    },
    #[error("deletion of {resource} did not complete")]
    Await {
        resource: CloudResource,
        #[source]
        source: CloudError,
    },
    #[error("teardown did not finish within {}s; {deleted} resources were deleted", .deadline.as_secs())]
    DeadlineExceeded { deadline: Duration, deleted: usize },
}

/// What a teardown will delete, in deletion order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TeardownPlan {
    pub resources: Vec<CloudResource>,
}

impl TeardownPlan {
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub deleted: Vec<CloudResource>,
    pub elapsed: Duration,
}

pub struct TeardownOrchestrator<'a, C> {
    cloud: &'a C,
}

impl<'a, C: CloudApi> TeardownOrchestrator<'a, C> {
    pub fn new(cloud: &'a C) -> Self {
        Self { cloud }
    }

    /// Enumerate each resource kind once and keep what `selector` selects.
    pub async fn plan(&self, selector: &impl ResourceSelector) -> Result<TeardownPlan, TeardownError> {
        let mut resources = Vec::new();
        for kind in TEARDOWN_ORDER {
            let listed = self
                .cloud
                .list(kind)
                .await
                .map_err(|source| TeardownError::List { kind, source })?;
            tracing::info!("Found {} {kind}(s)", listed.len());
            resources.extend(listed.into_iter().filter(|r| selector.selects(r)));
        }
        Ok(TeardownPlan { resources })
    }

    /// Delete everything in `plan`, in order, stopping at the first failure.
    ///
    /// Nothing is retried. Each deletion that the provider completes asynchronously is
    /// awaited before the next one is requested.
    pub async fn execute(&self, plan: TeardownPlan, deadline: Duration) -> Result<TeardownReport, TeardownError> {
        self.execute_from(Instant::now(), plan, deadline).await
    }

    async fn execute_from(
        &self,
        start: Instant,
        plan: TeardownPlan,
        deadline: Duration,
    ) -> Result<TeardownReport, TeardownError> {
        let mut deleted = Vec::with_capacity(plan.resources.len());
        let outcome = tokio::time::timeout_at(start + deadline, self.delete_all(plan.resources, &mut deleted)).await;
        match outcome {
            Ok(result) => result.map(|()| TeardownReport {
                deleted,
                elapsed: start.elapsed(),
            }),
            Err(_) => Err(TeardownError::DeadlineExceeded {
                deadline,
                deleted: deleted.len(),
            }),
        }
    }

    async fn delete_all(
        &self,
        resources: Vec<CloudResource>,
        deleted: &mut Vec<CloudResource>,
    ) -> Result<(), TeardownError> {
        for resource in resources {
            tracing::info!("Deleting {resource}");
            let action = match self.cloud.delete(&resource).await {
                Ok(action) => action,
                Err(source) => return Err(TeardownError::Delete { resource, source }),
            };
            if let Some(action) = action {
                if let Err(source) = self.cloud.wait_for_action(action).await {
                    return Err(TeardownError::Await { resource, source });
                }
            }
            deleted.push(resource);
        }
        Ok(())
    }

    /// [`plan`](Self::plan) followed by [`execute`](Self::execute), with `deadline` covering both.
    pub async fn teardown(
        &self,
        selector: &impl ResourceSelector,
        deadline: Duration,
    ) -> Result<TeardownReport, TeardownError> {
        let start = Instant::now();
        let plan = tokio::time::timeout_at(start + deadline, self.plan(selector))
            .await
            .map_err(|_| TeardownError::DeadlineExceeded { deadline, deleted: 0 })??;
        self.execute_from(start, plan, deadline).await
    }
}
