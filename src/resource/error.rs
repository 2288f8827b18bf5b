use thiserror::Error;

use crate::provider::ProviderError;

/// A resource could not be refreshed. The scheduler drops the resource from
/// the run with a warning; the run itself continues.
#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("failed to import resource: {0}")]
    Import(#[source] ProviderError),

    #[error("failed to read current state of resource: {0}")]
    Read(#[source] ProviderError),

    #[error("no resource found to be imported")]
    NothingImported,
}

/// A destroy attempt failed.
///
/// `Retryable` marks failures worth re-queueing, most commonly a resource
/// that is still a dependency of another resource in the same run.
#[derive(Debug, Error)]
pub enum DestroyError {
    #[error("resource has no refreshed state; refresh must succeed before destroy")]
    NotRefreshed,

    #[error(transparent)]
    Retryable(ProviderError),

    #[error(transparent)]
    Permanent(ProviderError),
}
