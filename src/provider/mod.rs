//! Clients for Terraform provider plugins.
//!
//! A [`TerraformProvider`] wraps one running plugin subprocess and exposes
//! the calls needed to destroy resources: Configure, ImportResourceState,
//! ReadResource and ApplyResourceChange. Classifiably transient failures are
//! retried within a per-operation budget.

pub mod config;
pub mod install;
pub mod plugin;
pub mod proto;
pub mod retry;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use semver::Version;
use thiserror::Error;
use tonic::transport::Channel;
use tracing::{debug, info, warn};

use crate::schema::{Block, Schema};
use crate::value::{Value, ValueError};

use self::install::{InstallError, ProviderInstaller};
use self::plugin::{PluginError, PluginProcess};
use self::proto::tfplugin5;
use self::proto::tfplugin5::provider_client::ProviderClient;

/// Version string reported to plugins during Configure; matches the last
/// Terraform release of the protocol revision the pinned plugins speak.
const TERRAFORM_VERSION: &str = "0.12.31";

/// Fixed retry budget for import and read operations.
const IMPORT_READ_BUDGET: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{op} timed out ({budget:?})")]
    OperationTimedOut {
        op: &'static str,
        budget: Duration,
    },

    #[error("{0}")]
    Diagnostics(String),

    #[error("{op} RPC failed: {source}")]
    Rpc {
        op: &'static str,
        source: tonic::Status,
    },

    #[error("no schema for resource type '{0}'")]
    NoResourceSchema(String),

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error(transparent)]
    Value(#[from] ValueError),
}

impl ProviderError {
    /// Whether the failed operation is worth retrying later. Budget
    /// exhaustion counts: the underlying cause was transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::OperationTimedOut { .. } => true,
            ProviderError::Diagnostics(message) => retry::should_retry(message),
            ProviderError::Rpc { source, .. } => retry::should_retry(source.message()),
            _ => false,
        }
    }
}

/// Errors during provider initialization; all of them abort the run.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("failed to install provider ({name}): {source}")]
    Install {
        name: String,
        source: InstallError,
    },

    #[error("failed to launch provider ({}): {source}", path.display())]
    Launch {
        path: PathBuf,
        source: ProviderError,
    },

    #[error("failed to configure provider (name={name}, version={version}): {source}")]
    Configure {
        name: String,
        version: Version,
        source: ProviderError,
    },
}

/// A resource state imported by type and id. Only the id attribute is set;
/// a subsequent read populates the rest.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportedResource {
    pub type_name: String,
    pub state: Value,
}

/// The provider surface the resource engine drives.
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    /// Schema of a resource type, as declared by the provider.
    fn schema_for_resource(&self, type_name: &str) -> Result<Schema, ProviderError>;

    /// Imports a resource by type and id, the minimal information that
    /// uniquely identifies it.
    async fn import_resource(
        &self,
        type_name: &str,
        id: &str,
    ) -> Result<Vec<ImportedResource>, ProviderError>;

    /// Refreshes a resource from its prior state. Returns a null value when
    /// the resource no longer exists remotely.
    async fn read_resource(
        &self,
        type_name: &str,
        current_state: Value,
    ) -> Result<Value, ProviderError>;

    /// Destroys a resource. Requires the current state of the resource as
    /// input, fetched via `read_resource`.
    async fn destroy_resource(
        &self,
        type_name: &str,
        current_state: Value,
    ) -> Result<(), ProviderError>;
}

/// A configured Terraform provider plugin, bound to its live subprocess.
///
/// The subprocess is killed when the provider is dropped. Workers share one
/// provider per distinct provider name; the underlying gRPC channel
/// multiplexes concurrent calls.
pub struct TerraformProvider {
    name: String,
    client: ProviderClient<Channel>,
    provider_schema: Schema,
    resource_schemas: HashMap<String, Schema>,
    /// Retry budget for a destroy operation.
    timeout: Duration,
    _process: PluginProcess,
}

impl TerraformProvider {
    /// Launches a plugin executable and fetches its schema. The returned
    /// provider must be configured before any resource operation.
    pub async fn launch(
        name: &str,
        path: &Path,
        timeout: Duration,
    ) -> Result<TerraformProvider, ProviderError> {
        let (mut client, process) = plugin::launch(path).await?;

        let response = client
            .get_schema(tfplugin5::get_provider_schema::Request {})
            .await
            .map_err(|source| ProviderError::Rpc {
                op: "schema",
                source,
            })?
            .into_inner();
        if let Some(message) = diagnostics_error(&response.diagnostics) {
            return Err(ProviderError::Diagnostics(message));
        }

        let provider_schema = response
            .provider
            .as_ref()
            .ok_or_else(|| {
                ProviderError::Diagnostics("provider returned no configuration schema".to_string())
            })
            .and_then(|schema| {
                Schema::from_proto(schema)
                    .map_err(|err| ProviderError::Diagnostics(err.to_string()))
            })?;

        let mut resource_schemas = HashMap::new();
        for (type_name, schema) in &response.resource_schemas {
            match Schema::from_proto(schema) {
                Ok(schema) => {
                    resource_schemas.insert(type_name.clone(), schema);
                }
                Err(err) => {
                    debug!(%type_name, error = %err, "skipping undecodable resource schema");
                }
            }
        }

        Ok(TerraformProvider {
            name: name.to_string(),
            client,
            provider_schema,
            resource_schemas,
            timeout,
            _process: process,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configures the provider with the given profile. Attributes of the
    /// provider's config schema not covered by the profile are sent as
    /// unknown, which the plugin treats as unset. Not retried.
    pub async fn configure(&self, profile: &BTreeMap<String, Value>) -> Result<(), ProviderError> {
        let config = build_config_value(&self.provider_schema.block, profile);
        let request = tfplugin5::configure::Request {
            terraform_version: TERRAFORM_VERSION.to_string(),
            config: Some(dynamic_value(&config)?),
        };

        let mut client = self.client.clone();
        let response = client
            .configure(request)
            .await
            .map_err(|source| ProviderError::Rpc {
                op: "configure",
                source,
            })?
            .into_inner();
        match diagnostics_error(&response.diagnostics) {
            Some(message) => Err(ProviderError::Diagnostics(message)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ResourceProvider for TerraformProvider {
    fn schema_for_resource(&self, type_name: &str) -> Result<Schema, ProviderError> {
        self.resource_schemas
            .get(type_name)
            .cloned()
            .ok_or_else(|| ProviderError::NoResourceSchema(type_name.to_string()))
    }

    async fn import_resource(
        &self,
        type_name: &str,
        id: &str,
    ) -> Result<Vec<ImportedResource>, ProviderError> {
        const OP: &str = "import";
        let request = tfplugin5::import_resource_state::Request {
            type_name: type_name.to_string(),
            id: id.to_string(),
        };

        let start = Instant::now();
        let mut backoff = retry::INITIAL_BACKOFF;
        let mut client = self.client.clone();
        loop {
            match client.import_resource_state(request.clone()).await {
                Ok(response) => {
                    let response = response.into_inner();
                    match diagnostics_error(&response.diagnostics) {
                        None => {
                            let mut imported = Vec::with_capacity(response.imported_resources.len());
                            for resource in &response.imported_resources {
                                imported.push(ImportedResource {
                                    type_name: resource.type_name.clone(),
                                    state: decode_dynamic_value(resource.state.as_ref())?,
                                });
                            }
                            return Ok(imported);
                        }
                        Some(message) if retry::should_retry(&message) => {
                            debug!(error = %message, "retrying to import resource");
                        }
                        Some(message) => return Err(ProviderError::Diagnostics(message)),
                    }
                }
                Err(status) if retry::should_retry(status.message()) => {
                    debug!(error = %status, "retrying to import resource");
                }
                Err(status) => {
                    return Err(ProviderError::Rpc {
                        op: OP,
                        source: status,
                    })
                }
            }

            if start.elapsed() + backoff >= IMPORT_READ_BUDGET {
                return Err(ProviderError::OperationTimedOut {
                    op: OP,
                    budget: IMPORT_READ_BUDGET,
                });
            }
            tokio::time::sleep(backoff).await;
            backoff = retry::next_backoff(backoff);
        }
    }

    async fn read_resource(
        &self,
        type_name: &str,
        current_state: Value,
    ) -> Result<Value, ProviderError> {
        const OP: &str = "read";
        let request = tfplugin5::read_resource::Request {
            type_name: type_name.to_string(),
            current_state: Some(dynamic_value(&current_state)?),
            private: Vec::new(),
        };

        let start = Instant::now();
        let mut backoff = retry::INITIAL_BACKOFF;
        let mut client = self.client.clone();
        loop {
            match client.read_resource(request.clone()).await {
                Ok(response) => {
                    let response = response.into_inner();
                    match diagnostics_error(&response.diagnostics) {
                        None => return Ok(decode_dynamic_value(response.new_state.as_ref())?),
                        Some(message) if retry::should_retry(&message) => {
                            debug!(error = %message, "retrying to read current state of resource");
                        }
                        Some(message) => return Err(ProviderError::Diagnostics(message)),
                    }
                }
                Err(status) if retry::should_retry(status.message()) => {
                    debug!(error = %status, "retrying to read current state of resource");
                }
                Err(status) => {
                    return Err(ProviderError::Rpc {
                        op: OP,
                        source: status,
                    })
                }
            }

            if start.elapsed() + backoff >= IMPORT_READ_BUDGET {
                return Err(ProviderError::OperationTimedOut {
                    op: OP,
                    budget: IMPORT_READ_BUDGET,
                });
            }
            tokio::time::sleep(backoff).await;
            backoff = retry::next_backoff(backoff);
        }
    }

    async fn destroy_resource(
        &self,
        type_name: &str,
        current_state: Value,
    ) -> Result<(), ProviderError> {
        const OP: &str = "destroy";
        let prior_state = enable_force_destroy_attributes(current_state);
        let request = tfplugin5::apply_resource_change::Request {
            type_name: type_name.to_string(),
            prior_state: Some(dynamic_value(&prior_state)?),
            planned_state: Some(dynamic_value(&Value::Null)?),
            config: Some(dynamic_value(&Value::Null)?),
            planned_private: Vec::new(),
        };

        let start = Instant::now();
        let mut backoff = retry::INITIAL_BACKOFF;
        let mut client = self.client.clone();
        loop {
            match client.apply_resource_change(request.clone()).await {
                Ok(response) => {
                    let response = response.into_inner();
                    match diagnostics_error(&response.diagnostics) {
                        None => return Ok(()),
                        Some(message) if retry::should_retry(&message) => {
                            debug!(error = %message, "retrying to destroy resource");
                        }
                        Some(message) => return Err(ProviderError::Diagnostics(message)),
                    }
                }
                Err(status) if retry::should_retry(status.message()) => {
                    debug!(error = %status, "retrying to destroy resource");
                }
                Err(status) => {
                    return Err(ProviderError::Rpc {
                        op: OP,
                        source: status,
                    })
                }
            }

            if start.elapsed() + backoff >= self.timeout {
                return Err(ProviderError::OperationTimedOut {
                    op: OP,
                    budget: self.timeout,
                });
            }
            tokio::time::sleep(backoff).await;
            backoff = retry::next_backoff(backoff);
        }
    }
}

/// Installs, launches and configures every provider in the given list with
/// its built-in default configuration. Providers without a built-in profile
/// are skipped with a log message; any other failure aborts initialization.
pub async fn init_providers(
    provider_names: &[String],
    timeout: Duration,
    installer: &ProviderInstaller,
) -> Result<HashMap<String, Arc<TerraformProvider>>, InitError> {
    let mut providers = HashMap::new();
    for name in provider_names {
        if let Some(provider) = init(name, timeout, installer).await? {
            providers.insert(name.clone(), Arc::new(provider));
        }
    }
    Ok(providers)
}

async fn init(
    name: &str,
    timeout: Duration,
    installer: &ProviderInstaller,
) -> Result<Option<TerraformProvider>, InitError> {
    let Some(defaults) = config::defaults(name) else {
        warn!(name, "ignoring resources of (yet) unsupported provider");
        return Ok(None);
    };

    let meta = installer
        .install(name, defaults.version_constraint)
        .await
        .map_err(|source| InitError::Install {
            name: name.to_string(),
            source,
        })?;

    let provider = TerraformProvider::launch(name, &meta.path, timeout)
        .await
        .map_err(|source| InitError::Launch {
            path: meta.path.clone(),
            source,
        })?;

    provider
        .configure(&defaults.config)
        .await
        .map_err(|source| InitError::Configure {
            name: meta.name.clone(),
            version: meta.version.clone(),
            source,
        })?;

    info!(name, version = %meta.version, "configured provider");
    Ok(Some(provider))
}

/// Renders the error diagnostics of a response into a single message, or
/// `None` when the response carries no errors. Warnings are ignored.
fn diagnostics_error(diagnostics: &[tfplugin5::Diagnostic]) -> Option<String> {
    let errors: Vec<String> = diagnostics
        .iter()
        .filter(|d| d.severity() == tfplugin5::diagnostic::Severity::Error)
        .map(|d| {
            if d.detail.is_empty() {
                d.summary.clone()
            } else {
                format!("{}: {}", d.summary, d.detail)
            }
        })
        .collect();
    if errors.is_empty() {
        None
    } else {
        Some(errors.join("; "))
    }
}

fn dynamic_value(value: &Value) -> Result<tfplugin5::DynamicValue, ValueError> {
    Ok(tfplugin5::DynamicValue {
        msgpack: value.to_msgpack()?,
        json: Vec::new(),
    })
}

fn decode_dynamic_value(
    value: Option<&tfplugin5::DynamicValue>,
) -> Result<Value, ValueError> {
    let Some(value) = value else {
        return Ok(Value::Null);
    };
    if !value.msgpack.is_empty() {
        return Value::from_msgpack(&value.msgpack);
    }
    if !value.json.is_empty() {
        let json: serde_json::Value = serde_json::from_slice(&value.json)
            .map_err(|err| ValueError::Decode(err.to_string()))?;
        return Ok(Value::from_json(&json));
    }
    Ok(Value::Null)
}

/// Sets force-destroy attributes of a resource state to true, so that
/// resources like a non-empty S3 bucket or an IAM role with attached
/// policies can still be deleted.
///
/// Note: these attributes are currently AWS specific.
fn enable_force_destroy_attributes(state: Value) -> Value {
    match state {
        Value::Object(mut attrs) => {
            for (name, value) in attrs.iter_mut() {
                if (name == "force_destroy" || name == "force_detach_policies")
                    && matches!(value, Value::Bool(_))
                {
                    *value = Value::Bool(true);
                }
            }
            Value::Object(attrs)
        }
        other => other,
    }
}

/// Builds the Configure value for a provider: profile attributes where the
/// profile has them, unknown everywhere else.
fn build_config_value(block: &Block, profile: &BTreeMap<String, Value>) -> Value {
    let mut vals = BTreeMap::new();
    for name in block.attributes.keys() {
        vals.insert(
            name.clone(),
            profile.get(name).cloned().unwrap_or(Value::Unknown),
        );
    }
    for name in block.block_types.keys() {
        vals.insert(
            name.clone(),
            profile.get(name).cloned().unwrap_or(Value::Unknown),
        );
    }
    Value::Object(vals)
}
