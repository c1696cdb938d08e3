//! # Runtime
//!
//! Process startup, watch loops and the reconcile error policy.

pub mod error_policy;
pub mod initialization;
pub mod watch_loop;
