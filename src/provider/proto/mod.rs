//! Terraform plugin protocol (version 5) types.
//!
//! Checked-in prost/tonic output for the subset of the tfplugin5 service this
//! tool drives: GetSchema, Configure, ReadResource, ApplyResourceChange,
//! ImportResourceState and Stop.

pub mod tfplugin5 {
    include!("generated/tfplugin5.rs");
}
