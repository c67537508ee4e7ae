use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::config::Config;
use crate::registry::{HttpRegistryClient, RegistryClient};
use crate::resource::{K8sResourceAccessor, ResourceAccessor};
use crate::watchers::PipelineWatcher;

/// The application object for when the operator is running as a server.
pub struct App {
    /// The application's runtime config.
    _config: Arc<Config>,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handle of the DataPipeline CR watcher.
    watcher_handle: JoinHandle<Result<()>>,
}

impl App {
    /// Create a new instance.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        // Initialize K8s client.
        let client = kube::Client::try_default().await.context("error initializing K8s client")?;

        let (shutdown_tx, _) = broadcast::channel(100);
        let registry: Arc<dyn RegistryClient> = Arc::new(HttpRegistryClient::new(&config.registry_endpoint)?);
        let accessor: Arc<dyn ResourceAccessor> = Arc::new(K8sResourceAccessor::new(client.clone()));

        let watcher = PipelineWatcher::new(client, config.clone(), registry, accessor, shutdown_tx.clone());
        let watcher_handle = watcher.spawn();

        Ok(Self {
            _config: config,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
            watcher_handle,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));

        loop {
            tokio::select! {
                Some((sig, _)) = signals.next() => {
                    tracing::debug!(signal = sig, "signal received, beginning graceful shutdown");
                    let _ = self.shutdown_tx.send(());
                    break;
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine.
        tracing::debug!("Conduit operator is shutting down");
        if let Err(err) = self
            .watcher_handle
            .await
            .context("error joining DataPipeline watcher handle")
            .and_then(|res| res)
        {
            tracing::error!(error = ?err, "error shutting down DataPipeline watcher");
        }

        tracing::debug!("Conduit operator shutdown complete");
        Ok(())
    }
}
