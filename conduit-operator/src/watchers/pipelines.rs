use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use kube::api::{Api, ListParams};
use kube::client::Client;
use kube::runtime::watcher::{watcher, Error as WatcherError, Event};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use crate::config::Config;
use crate::convergence::{PipelineCtl, PipelineCtlMsg};
use crate::registry::RegistryClient;
use crate::resource::ResourceAccessor;
use conduit_core::crd::DataPipeline;

/// A result type used for CR events coming from K8s.
type PipelineCREventResult = std::result::Result<Event<DataPipeline>, WatcherError>;

/// A K8s event watcher of DataPipeline CRs.
///
/// One convergence controller is spawned per observed resource; the watcher
/// only routes events and never reconciles anything itself.
pub struct PipelineWatcher {
    /// K8s client.
    client: Client,
    /// Runtime config.
    config: Arc<Config>,
    /// The shared registry client handed to spawned controllers.
    registry: Arc<dyn RegistryClient>,
    /// The resource accessor handed to spawned controllers.
    accessor: Arc<dyn ResourceAccessor>,
    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,

    /// Handles for all spawned convergence controllers, keyed by resource name.
    pipelines: HashMap<String, PipelineHandle>,
}

/// A handle to a spawned convergence controller.
struct PipelineHandle {
    /// The controller's event channel.
    tx: mpsc::Sender<PipelineCtlMsg>,
    /// The controller's join handle.
    handle: JoinHandle<Result<()>>,
}

impl PipelineWatcher {
    /// Create a new instance.
    pub fn new(
        client: Client, config: Arc<Config>, registry: Arc<dyn RegistryClient>, accessor: Arc<dyn ResourceAccessor>, shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        Self {
            client,
            config,
            registry,
            accessor,
            shutdown_tx,
            pipelines: Default::default(),
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let pipelines_api: Api<DataPipeline> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let stream = watcher(pipelines_api, ListParams::default());
        tokio::pin!(stream);

        tracing::info!("DataPipeline CR watcher initialized");
        let mut shutdown = BroadcastStream::new(self.shutdown_tx.subscribe());
        loop {
            tokio::select! {
                Some(k8s_event_res) = stream.next() => self.handle_k8s_event(k8s_event_res).await,
                _ = shutdown.next() => break,
            }
        }

        // Controllers observe the same shutdown signal; just join them here.
        for (name, pipeline_handle) in self.pipelines.drain() {
            if let Err(err) = pipeline_handle
                .handle
                .await
                .context("error joining convergence controller handle")
                .and_then(|res| res)
            {
                tracing::error!(error = ?err, pipeline = %name, "error shutting down convergence controller");
            }
        }

        Ok(())
    }

    /// Handle watcher events coming from K8s.
    #[tracing::instrument(level = "debug", skip(self, res))]
    async fn handle_k8s_event(&mut self, res: PipelineCREventResult) {
        let event = match res {
            Ok(event) => event,
            Err(err) => {
                tracing::error!(error = ?err, "error from k8s watch stream");
                let _ = tokio::time::sleep(std::time::Duration::from_secs(10)).await;
                return;
            }
        };
        match event {
            Event::Applied(pipeline) => self.handle_pipeline_applied(pipeline).await,
            Event::Deleted(pipeline) => {
                let name = match &pipeline.metadata.name {
                    Some(name) => name.clone(),
                    None => return,
                };
                tracing::debug!(%name, "DataPipeline CR deleted");
                self.stop_controller(&name).await;
            }
            // Handle K8s watcher stream restart.
            //
            // The new listing is authoritative: spawn controllers for new
            // resources, pass updates to live ones, and stop any controller
            // whose resource no longer appears.
            Event::Restarted(pipelines) => {
                tracing::debug!("DataPipeline CR stream restarted");
                let mut live = HashSet::new();
                for pipeline in pipelines {
                    if let Some(name) = pipeline.metadata.name.clone() {
                        live.insert(name);
                        self.handle_pipeline_applied(pipeline).await;
                    }
                }
                let stale: Vec<String> = self.pipelines.keys().filter(|name| !live.contains(*name)).cloned().collect();
                for name in stale {
                    self.stop_controller(&name).await;
                }
            }
        }
    }

    /// Handle a pipeline applied/updated event.
    #[tracing::instrument(level = "debug", skip(self, pipeline))]
    async fn handle_pipeline_applied(&mut self, pipeline: DataPipeline) {
        let name = match &pipeline.metadata.name {
            Some(name) => name.clone(),
            None => return,
        };
        let pipeline = Arc::new(pipeline);

        // If a controller already exists, then simply pass along the updated model.
        if let Some(pipeline_handle) = self.pipelines.get(&name) {
            let _res = pipeline_handle.tx.send(PipelineCtlMsg::PipelineUpdated(pipeline)).await;
            return;
        }

        tracing::debug!(%name, "spawning convergence controller for DataPipeline");
        let (events_tx, events_rx) = mpsc::channel(1000);
        let ctl = PipelineCtl::new(self.registry.clone(), self.accessor.clone(), pipeline, self.shutdown_tx.clone(), events_rx);
        let handle = ctl.spawn();
        self.pipelines.insert(name, PipelineHandle { tx: events_tx, handle });
    }

    /// Stop the controller of the given resource, if one is running.
    async fn stop_controller(&mut self, name: &str) {
        let pipeline_handle = match self.pipelines.remove(name) {
            Some(pipeline_handle) => pipeline_handle,
            None => {
                tracing::debug!(%name, "no spawned convergence controller found, no-op");
                return;
            }
        };
        let _res = pipeline_handle.tx.send(PipelineCtlMsg::PipelineDeleted).await;
        if let Err(err) = pipeline_handle
            .handle
            .await
            .context("error joining convergence controller handle")
            .and_then(|res| res)
        {
            tracing::error!(error = ?err, pipeline = %name, "error shutting down convergence controller");
        }
    }
}
