//! Process lifecycle for long-running bus components
//!
//! Every component owns durable broker queues, so it must be released on
//! every exit path. [`run_until_shutdown`] pairs `launch` with `release`,
//! including when `launch` itself fails halfway.

use crate::error::BusResult;
use async_trait::async_trait;
use std::future::Future;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::{error, info};

/// A bus component with an acquire/release pair
#[async_trait]
pub trait Component: Send + Sync {
    fn name(&self) -> &str;

    /// Connect and subscribe
    async fn launch(&self) -> BusResult<()>;

    /// Unsubscribe and disconnect. Safe to call after a partial launch.
    async fn release(&self);
}

/// SIGINT/SIGTERM handlers, installed before any broker resource exists
pub struct ShutdownSignals {
    sigint: Signal,
    sigterm: Signal,
}

impl ShutdownSignals {
    pub fn register() -> std::io::Result<Self> {
        Ok(Self {
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
        })
    }

    /// Resolve on the first SIGINT or SIGTERM
    pub async fn wait(mut self) {
        tokio::select! {
            _ = self.sigint.recv() => info!("Received SIGINT, shutting down gracefully..."),
            _ = self.sigterm.recv() => info!("Received SIGTERM, shutting down gracefully..."),
        }
    }
}

/// Launch `component`, wait for `shutdown`, then release it.
///
/// `release` runs before a launch error is returned.
pub async fn run_until_shutdown<C, F>(component: &C, shutdown: F) -> BusResult<()>
where
    C: Component + ?Sized,
    F: Future<Output = ()>,
{
    if let Err(e) = component.launch().await {
        error!(component = component.name(), error = %e, "Launch failed, releasing");
        component.release().await;
        return Err(e);
    }

    info!(component = component.name(), "Running until shutdown");
    shutdown.await;
    component.release().await;
    Ok(())
}
