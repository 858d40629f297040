//! Daemon - runs the hub and endpoint catalog until Ctrl-C

use tokio::sync::mpsc;

use crate::kinds::Catalog;
use crate::{Config, Hub, Result};

/// The ET-Bus daemon
pub struct Daemon {
    hub: Hub,
}

impl Daemon {
    /// Create a daemon on the configured multicast group
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self::with_hub(Hub::multicast(config))
    }

    /// Create a daemon around an existing hub
    #[must_use]
    pub const fn with_hub(hub: Hub) -> Self {
        Self { hub }
    }

    /// Run until Ctrl-C
    ///
    /// # Errors
    ///
    /// Returns error if the hub cannot start
    pub async fn run(self) -> Result<()> {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = shutdown_tx.send(()).await;
            }
        });

        self.run_until(async move {
            shutdown_rx.recv().await;
        })
        .await
    }

    /// Run until `shutdown` resolves
    ///
    /// # Errors
    ///
    /// Returns error if the hub cannot start
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let mut catalog = Catalog::new(self.hub.clone());
        let messages = self.hub.subscribe();
        self.hub.start()?;

        let catalog_task = tokio::spawn(async move {
            catalog.run(messages).await;
            catalog
        });

        shutdown.await;
        tracing::info!("shutdown requested");

        // Stopping the hub closes the subscription, which ends the catalog
        self.hub.stop().await;
        match catalog_task.await {
            Ok(catalog) => {
                catalog.stop();
                tracing::info!(
                    endpoints = catalog.endpoints().count(),
                    sensors = catalog.sensors().count(),
                    devices = self.hub.devices().len(),
                    "daemon stopped"
                );
            }
            Err(e) => tracing::warn!(error = %e, "catalog task failed"),
        }
        Ok(())
    }
}
