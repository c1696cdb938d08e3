//! # Service Manager Controller
//!
//! Reconciles `ServiceInstance` and `ServiceBinding` resources against a
//! remote service manager and writes binding credentials to Secrets.
//!
//! Configuration comes from environment variables, see
//! [`service_manager_controller::config::ControllerConfig`].

use anyhow::Result;
use service_manager_controller::runtime::{initialization, watch_loop};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let init = initialization::initialize().await?;
    watch_loop::run_watch_loop(init.client, init.reconciler, init.server_state).await?;
    info!("Service Manager Controller stopped");
    Ok(())
}
