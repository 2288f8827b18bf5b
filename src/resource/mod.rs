//! Destroyable resources and their refresh/destroy state machine.

mod destroy;
mod error;

pub use destroy::{destroy_resources, DestroySummary};
pub use error::{DestroyError, RefreshError};

use std::sync::Arc;

use tracing::{debug, info};

use crate::provider::ResourceProvider;
use crate::value::Value;

/// Lifecycle of a resource within one program run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Created,
    Refreshed,
    /// The refresh found the resource no longer exists remotely.
    GoneRemote,
    Destroyed,
    TransientFailure,
    PermanentFailure,
}

/// A Terraform resource that can be refreshed and destroyed.
///
/// Its type and id together uniquely identify the remote object; the
/// provider handles the cloud-side operations.
pub struct Resource<P> {
    type_name: String,
    id: String,
    provider: Arc<P>,
    /// The v4 state file attribute object, when available. Refreshing
    /// through it avoids an import round-trip.
    attributes: Option<serde_json::Value>,
    /// Current remote state, populated by a successful refresh.
    state: Option<Value>,
    phase: Phase,
}

impl<P> Resource<P> {
    pub fn new(type_name: &str, id: &str, provider: Arc<P>) -> Resource<P> {
        Resource {
            type_name: type_name.to_string(),
            id: id.to_string(),
            provider,
            attributes: None,
            state: None,
            phase: Phase::Created,
        }
    }

    /// Attaches the attribute object recorded in the state file.
    pub fn with_attributes(mut self, attributes: serde_json::Value) -> Resource<P> {
        self.attributes = Some(attributes);
        self
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn state(&self) -> Option<&Value> {
        self.state.as_ref()
    }

    pub fn is_gone(&self) -> bool {
        self.phase == Phase::GoneRemote
    }
}

impl<P: ResourceProvider> Resource<P> {
    /// Refreshes the resource's state from the remote side.
    ///
    /// Three strategies are tried in order: read through the retained state
    /// file attributes, import by id and read the result, and finally read
    /// an id-only synthetic state for types that cannot be imported. A null
    /// result from any of them means the resource is already gone.
    pub async fn refresh(&mut self) -> Result<(), RefreshError> {
        let state = self.fetch_current_state().await?;
        if state.is_null() {
            self.phase = Phase::GoneRemote;
        } else {
            self.state = Some(state);
            self.phase = Phase::Refreshed;
        }
        Ok(())
    }

    async fn fetch_current_state(&self) -> Result<Value, RefreshError> {
        if let Some(attributes) = &self.attributes {
            match self.provider.schema_for_resource(&self.type_name) {
                Ok(schema) => {
                    let prior = schema.block.shape_json(attributes);
                    return self
                        .provider
                        .read_resource(&self.type_name, prior)
                        .await
                        .map_err(RefreshError::Read);
                }
                Err(err) => {
                    debug!(
                        resource_type = %self.type_name,
                        error = %err,
                        "cannot refresh through state attributes; falling back to import"
                    );
                }
            }
        }

        match self.import_and_read().await {
            Ok(state) => Ok(state),
            Err(err) => {
                debug!(
                    error = %err,
                    resource_type = %self.type_name,
                    id = %self.id,
                    "failed to import resource; trying to read resource by id only"
                );
                self.read_by_id().await
            }
        }
    }

    /// Imports the resource and reads the current state of the result whose
    /// type matches. Imports may fan out into multiple resources of related
    /// types; only the type-matched one is used.
    async fn import_and_read(&self) -> Result<Value, RefreshError> {
        let imported = self
            .provider
            .import_resource(&self.type_name, &self.id)
            .await
            .map_err(RefreshError::Import)?;

        if imported.len() > 1 {
            debug!(
                count = imported.len(),
                resource_type = %self.type_name,
                "found multiple resources during import"
            );
        }

        for resource in imported {
            let state = self
                .provider
                .read_resource(&resource.type_name, resource.state)
                .await
                .map_err(RefreshError::Read)?;

            if resource.type_name == self.type_name {
                return Ok(state);
            }
            debug!(
                resource_type = %resource.type_name,
                "skipping imported resource of different type"
            );
        }

        Err(RefreshError::NothingImported)
    }

    /// Reads the resource from a synthetic state that carries only its id.
    async fn read_by_id(&self) -> Result<Value, RefreshError> {
        let schema = self
            .provider
            .schema_for_resource(&self.type_name)
            .map_err(RefreshError::Read)?;
        let synthetic = schema.block.empty_value_with_id(&self.id);
        self.provider
            .read_resource(&self.type_name, synthetic)
            .await
            .map_err(RefreshError::Read)
    }

    /// Destroys the resource. The resource must have been refreshed first;
    /// calling this in any other phase is a programming error surfaced as
    /// [`DestroyError::NotRefreshed`].
    pub async fn destroy(&mut self) -> Result<(), DestroyError> {
        let state = match (&self.phase, &self.state) {
            (Phase::Refreshed, Some(state)) => state.clone(),
            _ => return Err(DestroyError::NotRefreshed),
        };

        match self.provider.destroy_resource(&self.type_name, state).await {
            Ok(()) => {
                self.phase = Phase::Destroyed;
                info!(id = %self.id, resource_type = %self.type_name, "deleted resource");
                Ok(())
            }
            Err(err) if err.is_retryable() => {
                self.phase = Phase::TransientFailure;
                Err(DestroyError::Retryable(err))
            }
            Err(err) => {
                self.phase = Phase::PermanentFailure;
                Err(DestroyError::Permanent(err))
            }
        }
    }
}
