//! Service Manager Controller Library
//!
//! Custom resources, reconcilers and the remote client of the Service
//! Manager Controller. Tests live next to the code they cover and under
//! `tests/`.

pub mod config;
pub mod constants;
pub mod controller;
pub mod credentials;
pub mod crd;
pub mod observability;
pub mod runtime;
pub mod server;
pub mod sm;
pub mod store;

#[cfg(any(test, feature = "testing"))]
pub mod testing;
