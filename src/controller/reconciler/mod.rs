//! # Reconciler
//!
//! Reconciliation of `ServiceInstance` and `ServiceBinding` resources
//! against the remote service manager.
//!
//! ## Reconciliation Flow
//!
//! 1. Initialize conditions and add the finalizer on first sight
//! 2. Poll an ongoing remote operation until it finishes
//! 3. Run finalizer-guarded deletion for resources marked deleted
//! 4. Check dependencies (bindings wait for their instance)
//! 5. Recover a lost remote ID before ever creating, then create or update
//! 6. Maintain settled resources (sharing, credential rotation, stale bindings)
//!
//! ## Module Structure
//!
//! - `engine.rs` - Step execution, status writes, conflict retries
//! - `resource.rs` - `Reconcilable`, the seam between engine and kinds
//! - `instance.rs` / `binding.rs` - Kind specific remote calls
//! - `poll.rs` - Operation Poller
//! - `recovery.rs` - Recovery Resolver
//! - `delete.rs` - Deletion state machine
//! - `rotation.rs` - Credential rotation and stale bindings
//! - `classify.rs` - Transient or final remote failures
//! - `catalog.rs` / `parameters.rs` - Request building

mod binding;
pub mod catalog;
pub mod classify;
mod delete;
pub mod engine;
mod instance;
pub mod parameters;
mod poll;
mod recovery;
pub mod resource;
pub mod rotation;
pub mod types;

pub use engine::reconcile;
pub use resource::{Gate, Reconcilable, RemoteMatch};
pub use types::{Reconciler, ReconcilerError};
