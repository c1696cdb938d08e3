//! # Controller
//!
//! Core controller modules for the Service Manager Controller.
//!
//! - `backoff`: Exponential backoff for failed reconciles
//! - `conditions`: Condition model shared by both resource kinds
//! - `duration`: Kubernetes duration strings (rotation policies)
//! - `reconciler`: Core reconciliation logic
//! - `secrets`: Secret materialization from binding credentials
//! - `state`: Lifecycle states and step planning

pub mod backoff;
pub mod conditions;
pub mod duration;
pub mod reconciler;
pub mod secrets;
pub mod state;
