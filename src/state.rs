//! Terraform state file parsing.
//!
//! Supports the two on-disk dialects still found in the wild: the legacy v3
//! layout (flat string attribute maps under `modules`) and the current v4
//! layout (JSON attribute objects under `resources`). Loading a state yields
//! a deterministic, address-sorted list of resource entries.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::provider::ResourceProvider;
use crate::resource::Resource;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to read state file {}: {source}", path.display())]
    NotReadable {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to decode state file: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unsupported state file version {0}")]
    UnsupportedVersion(u64),
}

/// Whether a resource is managed by the state or only read from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Managed,
    Data,
}

/// One resource instance found in a state file.
#[derive(Debug, Clone, PartialEq)]
pub struct StateResource {
    /// Module address (empty for the root module).
    pub module: String,
    /// Resource address within the module, e.g. `aws_vpc.main`.
    pub address: String,
    /// Instance key for counted or for-each resources (empty otherwise).
    pub instance_key: String,
    pub mode: Mode,
    pub type_name: String,
    /// May be empty when the state never recorded an id; such entries are
    /// kept and left to the refresh logic to resolve.
    pub id: String,
    /// Short provider name, e.g. `aws`.
    pub provider_key: String,
    /// The full v4 attribute object, when the dialect preserves one.
    pub attributes: Option<serde_json::Value>,
}

/// A parsed Terraform state.
#[derive(Debug, Clone)]
pub struct State {
    resources: Vec<StateResource>,
}

impl State {
    /// Loads a state from a given path to a Terraform state file.
    pub fn from_file(path: &Path) -> Result<State, StateError> {
        let raw = fs::read(path).map_err(|source| StateError::NotReadable {
            path: path.to_path_buf(),
            source,
        })?;

        let probe: VersionProbe = serde_json::from_slice(&raw)?;
        let mut resources = match probe.version {
            3 => {
                let state: StateV3 = serde_json::from_slice(&raw)?;
                enumerate_v3(state)
            }
            4 => {
                let state: StateV4 = serde_json::from_slice(&raw)?;
                enumerate_v4(state)
            }
            other => return Err(StateError::UnsupportedVersion(other)),
        };

        resources.sort_by(|a, b| {
            (&a.module, &a.address, &a.instance_key).cmp(&(&b.module, &b.address, &b.instance_key))
        });

        Ok(State { resources })
    }

    /// Every resource instance in the state, in address order.
    pub fn entries(&self) -> &[StateResource] {
        &self.resources
    }

    /// Returns all provider names referenced by the state (e.g. `aws`),
    /// deduplicated, in first-seen order.
    pub fn provider_names(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut names = Vec::new();
        for resource in &self.resources {
            if seen.insert(resource.provider_key.clone()) {
                names.push(resource.provider_key.clone());
            }
        }
        names
    }

    /// Binds the managed resources of the state to their initialized
    /// providers.
    ///
    /// Data sources live outside the state's ownership and are skipped, as
    /// are resources whose provider has no adapter in the given map.
    pub fn resources<P: ResourceProvider>(
        &self,
        providers: &HashMap<String, Arc<P>>,
    ) -> Vec<Resource<P>> {
        let mut out = Vec::new();
        for entry in &self.resources {
            if entry.mode != Mode::Managed {
                debug!(
                    resource_type = %entry.type_name,
                    id = %entry.id,
                    "ignoring non-managed resource"
                );
                continue;
            }

            let provider = match providers.get(&entry.provider_key) {
                Some(provider) => Arc::clone(provider),
                None => {
                    debug!(
                        name = %entry.provider_key,
                        "provider not found in list of initialized providers"
                    );
                    continue;
                }
            };

            let mut resource = Resource::new(&entry.type_name, &entry.id, provider);
            if let Some(attrs) = &entry.attributes {
                resource = resource.with_attributes(attrs.clone());
            }
            out.push(resource);
        }
        out
    }
}

#[derive(Deserialize)]
struct VersionProbe {
    version: u64,
}

#[derive(Deserialize)]
struct StateV4 {
    #[serde(default)]
    resources: Vec<ResourceV4>,
}

#[derive(Deserialize)]
struct ResourceV4 {
    #[serde(default)]
    module: Option<String>,
    mode: String,
    #[serde(rename = "type")]
    type_name: String,
    name: String,
    #[serde(default)]
    provider: String,
    #[serde(default)]
    instances: Vec<InstanceV4>,
}

#[derive(Deserialize)]
struct InstanceV4 {
    #[serde(default)]
    index_key: Option<serde_json::Value>,
    #[serde(default)]
    attributes: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct StateV3 {
    #[serde(default)]
    modules: Vec<ModuleV3>,
}

#[derive(Deserialize)]
struct ModuleV3 {
    #[serde(default)]
    path: Vec<String>,
    #[serde(default)]
    resources: BTreeMap<String, ResourceV3>,
}

#[derive(Deserialize)]
struct ResourceV3 {
    #[serde(default, rename = "type")]
    type_name: String,
    #[serde(default)]
    provider: String,
    #[serde(default)]
    primary: Option<InstanceV3>,
}

#[derive(Deserialize)]
struct InstanceV3 {
    #[serde(default)]
    id: String,
    #[serde(default)]
    attributes: BTreeMap<String, String>,
}

fn enumerate_v4(state: StateV4) -> Vec<StateResource> {
    let mut out = Vec::new();
    for resource in state.resources {
        let module = resource.module.unwrap_or_default();
        let address = format!("{}.{}", resource.type_name, resource.name);
        let mode = match resource.mode.as_str() {
            "data" => Mode::Data,
            _ => Mode::Managed,
        };
        let provider_key = provider_key(&resource.provider, &resource.type_name);

        for instance in resource.instances {
            let id = instance
                .attributes
                .as_ref()
                .and_then(|attrs| attrs.get("id"))
                .and_then(|id| id.as_str())
                .unwrap_or_default()
                .to_string();

            out.push(StateResource {
                module: module.clone(),
                address: address.clone(),
                instance_key: instance_key_string(instance.index_key.as_ref()),
                mode,
                type_name: resource.type_name.clone(),
                id,
                provider_key: provider_key.clone(),
                attributes: instance.attributes,
            });
        }
    }
    out
}

fn enumerate_v3(state: StateV3) -> Vec<StateResource> {
    let mut out = Vec::new();
    for module in state.modules {
        let module_address = module_address_v3(&module.path);
        for (address, resource) in module.resources {
            let mode = if address.starts_with("data.") {
                Mode::Data
            } else {
                Mode::Managed
            };
            let type_name = if resource.type_name.is_empty() {
                address
                    .trim_start_matches("data.")
                    .split('.')
                    .next()
                    .unwrap_or_default()
                    .to_string()
            } else {
                resource.type_name.clone()
            };

            let primary = match resource.primary {
                Some(primary) => primary,
                None => {
                    debug!(%address, "resource has no primary instance");
                    continue;
                }
            };
            // the flat attribute map is authoritative; the id field is a
            // fallback for states written before it was mirrored there
            let id = primary
                .attributes
                .get("id")
                .cloned()
                .unwrap_or_else(|| primary.id.clone());

            out.push(StateResource {
                module: module_address.clone(),
                address,
                instance_key: String::new(),
                mode,
                type_name: type_name.clone(),
                id,
                provider_key: provider_key(&resource.provider, &type_name),
                attributes: None,
            });
        }
    }
    out
}

/// Formats a v3 module path (`["root", "network"]`) as a module address
/// (`module.network`).
fn module_address_v3(path: &[String]) -> String {
    path.iter()
        .filter(|part| part.as_str() != "root")
        .map(|part| format!("module.{part}"))
        .collect::<Vec<_>>()
        .join(".")
}

fn instance_key_string(key: Option<&serde_json::Value>) -> String {
    match key {
        Some(serde_json::Value::Number(n)) => n.to_string(),
        Some(serde_json::Value::String(s)) => s.clone(),
        _ => String::new(),
    }
}

/// Reduces the provider address stored in a state file to the provider's
/// short name.
///
/// Handles the legacy form (`provider.aws`, optionally aliased) and the
/// registry form (`provider["registry.terraform.io/hashicorp/aws"]`). An
/// empty address falls back to the resource type's prefix.
fn provider_key(provider: &str, type_name: &str) -> String {
    let provider = provider.trim();
    if provider.is_empty() {
        return type_name.split('_').next().unwrap_or(type_name).to_string();
    }

    if let Some(start) = provider.find('"') {
        let rest = &provider[start + 1..];
        if let Some(end) = rest.find('"') {
            let source = &rest[..end];
            return source.rsplit('/').next().unwrap_or(source).to_string();
        }
    }

    provider
        .trim_start_matches("provider.")
        .split('.')
        .next()
        .unwrap_or(provider)
        .to_string()
}
