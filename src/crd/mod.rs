//! # Custom Resource Definitions
//!
//! CRD types for the Service Manager Controller.
//!
//! ## Module Structure
//!
//! - `instance.rs` - `ServiceInstance`: a provisioned remote resource
//! - `binding.rs` - `ServiceBinding`: credentials for an instance, materialized as a Secret
//! - `common.rs` - Types shared by both kinds (parameters sources, audit info)
//! - `status.rs` - Conditions and operation references

mod binding;
mod common;
mod instance;
mod status;

pub use binding::{
    CredentialRotationPolicy, ServiceBinding, ServiceBindingSpec, ServiceBindingStatus,
};
pub use common::{ParametersFromSource, SecretKeyReference, UserInfo};
pub use instance::{ServiceInstance, ServiceInstanceSpec, ServiceInstanceStatus};
pub use status::{Condition, OperationType};

/// Schema for opaque JSON documents (`parameters`): any object is accepted as-is
pub(crate) fn preserve_unknown_fields(_: &mut schemars::SchemaGenerator) -> schemars::Schema {
    schemars::json_schema!({
        "type": "object",
        "x-kubernetes-preserve-unknown-fields": true
    })
}
