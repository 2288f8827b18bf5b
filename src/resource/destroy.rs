//! Parallel destruction of a list of resources.
//!
//! Resources may depend on each other. Instead of computing a dependency
//! graph, the destroyer iterates to a fixed point: whenever at least one
//! resource disappears in a run, the resources that failed with a retryable
//! error are scheduled for another run. A run that makes no progress stops
//! the iteration and reports the remainder as exceeded.

use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, info, warn};

use super::{DestroyError, Resource};
use crate::provider::ResourceProvider;

/// Outcome totals of a destroy (or dry-run) invocation.
///
/// `deleted + gone + permanent_failures + retries_exceeded` always equals the
/// number of input resources.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DestroySummary {
    /// Resources destroyed (or, in a dry run, that would be destroyed).
    pub deleted: usize,
    /// Resources that turned out to no longer exist remotely.
    pub gone: usize,
    /// Resources dropped after a non-retryable refresh or destroy failure.
    pub permanent_failures: usize,
    /// Retryable failures left over once no run made progress.
    pub retries_exceeded: usize,
}

enum DestroyOutcome<P> {
    Deleted,
    Gone,
    Retry(Resource<P>),
    Failed,
}

/// Destroys a list of resources, `parallel` at a time, retrying resources
/// with retryable failures until all are destroyed or a run makes no
/// progress. In dry-run mode resources are still refreshed, but no destroy
/// is issued.
pub async fn destroy_resources<P: ResourceProvider>(
    resources: Vec<Resource<P>>,
    dry_run: bool,
    parallel: usize,
) -> DestroySummary {
    let parallel = parallel.max(1);
    let mut summary = DestroySummary::default();
    let mut pending = resources;

    loop {
        debug!(
            count = pending.len(),
            "start distributing resources to workers for this run"
        );
        let mut queue = pending.into_iter();
        let mut in_flight: FuturesUnordered<_> = queue
            .by_ref()
            .take(parallel)
            .map(|resource| destroy_one(resource, dry_run))
            .collect();

        let mut deleted_this_run = 0;
        let mut gone_this_run = 0;
        let mut retryable = Vec::new();
        while let Some(outcome) = in_flight.next().await {
            match outcome {
                DestroyOutcome::Deleted => deleted_this_run += 1,
                DestroyOutcome::Gone => gone_this_run += 1,
                DestroyOutcome::Retry(resource) => retryable.push(resource),
                DestroyOutcome::Failed => summary.permanent_failures += 1,
            }
            if let Some(resource) = queue.next() {
                in_flight.push(destroy_one(resource, dry_run));
            }
        }

        summary.deleted += deleted_this_run;
        summary.gone += gone_this_run;

        if retryable.is_empty() {
            break;
        }
        if deleted_this_run + gone_this_run == 0 {
            info!(
                "failed to delete the following resources (retries exceeded): {}",
                retryable.len()
            );
            for resource in &retryable {
                warn!(
                    resource_type = %resource.type_name(),
                    id = %resource.id(),
                    "retries exceeded"
                );
            }
            summary.retries_exceeded += retryable.len();
            break;
        }

        pending = retryable;
    }

    summary
}

async fn destroy_one<P: ResourceProvider>(
    mut resource: Resource<P>,
    dry_run: bool,
) -> DestroyOutcome<P> {
    if let Err(err) = resource.refresh().await {
        warn!(
            error = %err,
            resource_type = %resource.type_name(),
            id = %resource.id(),
            "cannot refresh resource state"
        );
        return DestroyOutcome::Failed;
    }

    if resource.is_gone() {
        info!(
            resource_type = %resource.type_name(),
            id = %resource.id(),
            "resource no longer exists remotely"
        );
        return DestroyOutcome::Gone;
    }

    if dry_run {
        info!(
            resource_type = %resource.type_name(),
            id = %resource.id(),
            "would delete resource"
        );
        return DestroyOutcome::Deleted;
    }

    match resource.destroy().await {
        Ok(()) => DestroyOutcome::Deleted,
        Err(DestroyError::Retryable(_)) => {
            info!(
                resource_type = %resource.type_name(),
                id = %resource.id(),
                "will retry to delete resource"
            );
            DestroyOutcome::Retry(resource)
        }
        Err(err) => {
            debug!(
                error = %err,
                resource_type = %resource.type_name(),
                id = %resource.id(),
                "unable to delete resource"
            );
            DestroyOutcome::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::super::testing::FakeProvider;
    use super::*;
    use crate::provider::ProviderError;

    fn retryable_error() -> ProviderError {
        ProviderError::Diagnostics("RequestError: send request failed".to_string())
    }

    #[tokio::test]
    async fn test_single_resource_happy_path() {
        let provider = Arc::new(FakeProvider::default());
        let resources = vec![Resource::new("aws_vpc", "vpc-aaaa", Arc::clone(&provider))];

        let summary = destroy_resources(resources, false, 1).await;

        assert_eq!(summary.deleted, 1);
        assert_eq!(summary, DestroySummary { deleted: 1, ..DestroySummary::default() });
        assert_eq!(
            provider.calls(),
            vec![
                "import aws_vpc vpc-aaaa",
                "read aws_vpc vpc-aaaa",
                "destroy aws_vpc vpc-aaaa"
            ]
        );
    }

    #[tokio::test]
    async fn test_dry_run_issues_no_destroy() {
        let provider = Arc::new(FakeProvider::default());
        let resources = vec![Resource::new("aws_vpc", "vpc-aaaa", Arc::clone(&provider))];

        let summary = destroy_resources(resources, true, 1).await;

        assert_eq!(summary.deleted, 1);
        assert_eq!(provider.destroy_calls(), 0);
        assert_eq!(
            provider.calls(),
            vec!["import aws_vpc vpc-aaaa", "read aws_vpc vpc-aaaa"]
        );
    }

    #[tokio::test]
    async fn test_gone_resource_produces_no_destroy_rpc() {
        let provider = FakeProvider {
            gone: ["vpc-aaaa".to_string()].into_iter().collect(),
            ..FakeProvider::default()
        };
        let provider = Arc::new(provider);
        let resources = vec![Resource::new("aws_vpc", "vpc-aaaa", Arc::clone(&provider))];

        let summary = destroy_resources(resources, false, 1).await;

        assert_eq!(summary.gone, 1);
        assert_eq!(summary.deleted, 0);
        assert_eq!(provider.destroy_calls(), 0);
    }

    #[tokio::test]
    async fn test_dependent_resources_destroyed_across_two_runs() {
        // the VPC destroy fails while the subnet still exists; once the
        // subnet is gone, the follow-up run destroys the VPC
        let provider = FakeProvider::default();
        provider
            .destroy_errors
            .lock()
            .unwrap()
            .insert("vpc-x".to_string(), vec![retryable_error()]);
        let provider = Arc::new(provider);

        let resources = vec![
            Resource::new("aws_vpc", "vpc-x", Arc::clone(&provider)),
            Resource::new("aws_subnet", "subnet-y", Arc::clone(&provider)),
        ];

        let summary = destroy_resources(resources, false, 2).await;

        assert_eq!(summary.deleted, 2);
        assert_eq!(summary.retries_exceeded, 0);
        let destroys: Vec<String> = provider
            .calls()
            .into_iter()
            .filter(|call| call.starts_with("destroy"))
            .collect();
        assert_eq!(destroys.len(), 3);
        // the second run retries the VPC after the subnet was destroyed
        assert_eq!(destroys.last().unwrap(), "destroy aws_vpc vpc-x");
        assert_eq!(
            destroys
                .iter()
                .filter(|call| *call == "destroy aws_vpc vpc-x")
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn test_no_progress_reports_retries_exceeded() {
        let provider = FakeProvider::default();
        provider.destroy_errors.lock().unwrap().insert(
            "vpc-x".to_string(),
            vec![
                ProviderError::OperationTimedOut {
                    op: "destroy",
                    budget: Duration::from_secs(2),
                },
            ],
        );
        let provider = Arc::new(provider);
        let resources = vec![Resource::new("aws_vpc", "vpc-x", Arc::clone(&provider))];

        let summary = destroy_resources(resources, false, 1).await;

        assert_eq!(summary.deleted, 0);
        assert_eq!(summary.retries_exceeded, 1);
        // no second run happens without progress
        assert_eq!(provider.destroy_calls(), 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_requeued() {
        let provider = FakeProvider::default();
        provider.destroy_errors.lock().unwrap().insert(
            "role-1".to_string(),
            vec![ProviderError::Diagnostics(
                "AccessDenied: not authorized".to_string(),
            )],
        );
        let provider = Arc::new(provider);
        let resources = vec![
            Resource::new("aws_iam_role", "role-1", Arc::clone(&provider)),
            Resource::new("aws_vpc", "vpc-x", Arc::clone(&provider)),
        ];

        let summary = destroy_resources(resources, false, 2).await;

        assert_eq!(summary.deleted, 1);
        assert_eq!(summary.permanent_failures, 1);
        // the permanently failed resource is destroyed once, never retried
        let role_destroys = provider
            .calls()
            .into_iter()
            .filter(|call| call == "destroy aws_iam_role role-1")
            .count();
        assert_eq!(role_destroys, 1);
    }

    #[tokio::test]
    async fn test_outcome_totals_match_input_size() {
        let provider = FakeProvider {
            gone: ["gone-1".to_string()].into_iter().collect(),
            ..FakeProvider::default()
        };
        {
            let mut errors = provider.destroy_errors.lock().unwrap();
            errors.insert(
                "perm-1".to_string(),
                vec![ProviderError::Diagnostics("AccessDenied".to_string())],
            );
            // enough queued failures to outlive every productive run
            errors.insert(
                "stuck-1".to_string(),
                vec![retryable_error(), retryable_error(), retryable_error()],
            );
        }
        let provider = Arc::new(provider);

        let resources = vec![
            Resource::new("aws_vpc", "ok-1", Arc::clone(&provider)),
            Resource::new("aws_vpc", "gone-1", Arc::clone(&provider)),
            Resource::new("aws_iam_role", "perm-1", Arc::clone(&provider)),
            Resource::new("aws_subnet", "stuck-1", Arc::clone(&provider)),
        ];
        let input = resources.len();

        let summary = destroy_resources(resources, false, 2).await;

        assert_eq!(
            summary.deleted + summary.gone + summary.permanent_failures + summary.retries_exceeded,
            input
        );
        assert_eq!(summary.deleted, 1);
        assert_eq!(summary.gone, 1);
        assert_eq!(summary.permanent_failures, 1);
        assert_eq!(summary.retries_exceeded, 1);
    }

    #[tokio::test]
    async fn test_refresh_failure_drops_resource_without_aborting() {
        let provider = FakeProvider {
            import_fails: ["bad-1".to_string()].into_iter().collect(),
            no_schema: ["aws_odd_thing".to_string()].into_iter().collect(),
            ..FakeProvider::default()
        };
        let provider = Arc::new(provider);
        let resources = vec![
            Resource::new("aws_odd_thing", "bad-1", Arc::clone(&provider)),
            Resource::new("aws_vpc", "vpc-x", Arc::clone(&provider)),
        ];

        let summary = destroy_resources(resources, false, 2).await;

        assert_eq!(summary.deleted, 1);
        assert_eq!(summary.permanent_failures, 1);
    }
}
