//! Resource access.
//!
//! Loading of DataPipeline resources and persistence of their observed
//! status. Status is written at most once per reconcile pass, after the
//! terminal outcome is known; a write conflict abandons the pass and the
//! next pass re-runs the full sequence.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use kube::api::{Api, PostParams};
use kube::client::Client;
use tokio::time::timeout;

use conduit_core::crd::{DataPipeline, DataPipelineStatus, RequiredMetadata};

/// The default timeout to use for API calls.
const API_TIMEOUT: Duration = Duration::from_secs(5);

/// The outcome of a status persistence attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SaveOutcome {
    /// The status was persisted.
    Saved,
    /// The resource was mutated concurrently; the pass must be abandoned.
    Conflict,
}

/// Access to DataPipeline resources and their status subresource.
#[async_trait]
pub trait ResourceAccessor: Send + Sync + 'static {
    /// Load the current resource, or `None` if it no longer exists.
    async fn load(&self, namespace: &str, name: &str) -> Result<Option<DataPipeline>>;

    /// Persist the given status on the resource.
    async fn save_status(&self, pipeline: &DataPipeline, status: DataPipelineStatus) -> Result<SaveOutcome>;
}

/// A `ResourceAccessor` backed by the K8s API.
pub struct K8sResourceAccessor {
    /// K8s client.
    client: Client,
}

impl K8sResourceAccessor {
    /// Create a new instance.
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ResourceAccessor for K8sResourceAccessor {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn load(&self, namespace: &str, name: &str) -> Result<Option<DataPipeline>> {
        let api: Api<DataPipeline> = Api::namespaced(self.client.clone(), namespace);
        let res = timeout(API_TIMEOUT, api.get(name))
            .await
            .context("timeout while fetching DataPipeline")?;
        match res {
            Ok(pipeline) => Ok(Some(pipeline)),
            Err(kube::Error::Api(api_err)) if api_err.code == http::StatusCode::NOT_FOUND => Ok(None),
            Err(err) => Err(err).context("error fetching DataPipeline"),
        }
    }

    #[tracing::instrument(level = "debug", skip(self, pipeline, status))]
    async fn save_status(&self, pipeline: &DataPipeline, status: DataPipelineStatus) -> Result<SaveOutcome> {
        let api: Api<DataPipeline> = Api::namespaced(self.client.clone(), pipeline.namespace());

        // Carry the loaded resourceVersion so a concurrent mutation of the
        // resource is reported by the API server instead of overwritten.
        let mut updated = pipeline.clone();
        updated.status = Some(status);
        updated.metadata.managed_fields = None;
        let data = serde_json::to_vec(&updated).context("error serializing DataPipeline status")?;

        let res = timeout(API_TIMEOUT, api.replace_status(pipeline.name(), &PostParams::default(), data))
            .await
            .context("timeout while updating DataPipeline status")?;
        match res {
            Ok(_pipeline) => Ok(SaveOutcome::Saved),
            Err(kube::Error::Api(api_err)) if api_err.code == http::StatusCode::CONFLICT => Ok(SaveOutcome::Conflict),
            Err(err) => Err(err).context("error updating DataPipeline status"),
        }
    }
}
