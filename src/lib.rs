//! Terradozer - destroy all resources from a Terraform state file.
//!
//! A library for reading a Terraform state file (v3 or v4) and destroying
//! every managed resource recorded in it, by driving the referenced provider
//! plugins over their gRPC protocol. No *.tf configuration files are needed.

pub mod provider;
pub mod resource;
pub mod schema;
pub mod state;
pub mod value;

pub use provider::{init_providers, ResourceProvider, TerraformProvider};
pub use resource::{destroy_resources, DestroySummary, Resource};
pub use state::{State, StateError};
pub use value::Value;
