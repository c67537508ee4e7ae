//! Schema convergence engine.
//!
//! ## Overview
//! A reconcile pass drives the registry toward holding a version of the
//! pipeline's declared schema, in three steps: check whether the subject
//! already holds a version, register the declared content if it does not,
//! then read back the subject's latest content and compare it against the
//! declaration. The read-back runs even when registration was skipped,
//! as the registry's write and read paths are not assumed to be
//! consistent with this pass's causal expectations.
//!
//! Every pass ends in a terminal [`Outcome`]; registry-level errors never
//! escape the engine. Status is persisted at most once per pass, after
//! the outcome is known, so an aborted or crashed pass leaves status
//! exactly as it was and the next pass re-runs the full sequence.
//!
//! One [`PipelineCtl`] exists per resource, and a controller executes at
//! most one pass at a time, which upholds the single-writer guarantee for
//! the resource's registry subject. Controllers for distinct resources
//! run fully independently; the only state shared between them is the
//! registry client's connection pool.


use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{SecondsFormat, Utc};
use futures::stream::StreamExt;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};

use crate::error::RegistryError;
use crate::registry::RegistryClient;
use crate::resource::{ResourceAccessor, SaveOutcome};
use conduit_core::crd::{DataPipeline, DataPipelineStatus, RequiredMetadata, StatusError, StatusErrorKind};

/// The delay scheduled after a pass which converged.
const STEADY_STATE_INTERVAL: Duration = Duration::from_secs(30);
/// The delay scheduled after a failed or abandoned pass.
const RETRY_BACKOFF: Duration = Duration::from_secs(5);

/// The terminal outcome of a single reconcile pass.
#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    /// The registry holds the declared schema, or the resource is paused.
    Converged {
        /// The pass made no registry calls because the resource is paused.
        paused: bool,
        /// The registry version holding the declared content.
        version: Option<i64>,
    },
    /// The pass failed with the given classification.
    Failed(Failure),
}

/// Failure classification of a reconcile pass.
#[derive(Clone, Debug, PartialEq)]
pub enum Failure {
    /// Network-level or unexpected registry failure; retried without being
    /// surfaced on resource status.
    Transient(String),
    /// The registry rejected the declared schema; requires a spec change.
    Config(String),
    /// The registry's latest content differs from what was requested.
    Drift(String),
}

/// A reschedule directive computed from a pass outcome.
#[derive(Debug, PartialEq)]
pub struct Directive {
    /// The status to persist, if the outcome was definitive for status.
    pub status: Option<DataPipelineStatus>,
    /// Delay before the next reconcile pass.
    pub requeue_after: Duration,
}

/// Execute one convergence pass for the given resource snapshot.
#[tracing::instrument(level = "debug", skip(registry, pipeline))]
pub async fn converge(registry: &dyn RegistryClient, pipeline: &DataPipeline) -> Outcome {
    if pipeline.spec.pause {
        tracing::debug!(name = pipeline.name(), "pipeline is paused, skipping registry convergence");
        return Outcome::Converged { paused: true, version: None };
    }
    let subject = pipeline.subject();

    // Check for an existing registered version of this subject.
    let existing = match registry.version_exists(&subject).await {
        Ok(existing) => existing,
        Err(err) => return failure_outcome(err),
    };

    // Register the declared content if the subject is absent. A subject
    // which already holds a version is never re-registered.
    let version = match existing {
        Some(meta) => meta.version,
        None => match registry.register_version(&subject, &pipeline.spec.schema).await {
            Ok(registered) => {
                tracing::info!(subject = %subject, version = registered.version, global_id = registered.global_id, "registered new schema version");
                registered.version
            }
            Err(err) => return failure_outcome(err),
        },
    };

    // Read back the latest content and compare it against the declaration.
    match registry.fetch_latest(&subject).await {
        Ok(Some(content)) if content == pipeline.spec.schema => Outcome::Converged {
            paused: false,
            version: Some(version),
        },
        Ok(Some(_content)) => Outcome::Failed(Failure::Drift(format!(
            "latest content of subject {} differs from the declared schema",
            subject
        ))),
        Ok(None) => Outcome::Failed(Failure::Drift(format!("subject {} holds no latest version", subject))),
        Err(err) => failure_outcome(err),
    }
}

/// Resolve a registry error into a terminal pass outcome.
fn failure_outcome(err: RegistryError) -> Outcome {
    match err {
        RegistryError::Transient(message) => Outcome::Failed(Failure::Transient(message)),
        RegistryError::MalformedSchema(message) => Outcome::Failed(Failure::Config(message)),
    }
}

/// Map a pass outcome onto its reschedule directive.
///
/// Transient failures produce no status write. Config and drift failures
/// surface their detail on status. A converged pass over an
/// already-converged resource keeps the previous convergence timestamp so
/// that an unchanged resource yields an unchanged status.
pub fn schedule(pipeline: &DataPipeline, outcome: &Outcome, now: chrono::DateTime<Utc>) -> Directive {
    let prior = pipeline.status.clone().unwrap_or_default();
    match outcome {
        // A paused pass observed nothing; the previous status stands as-is.
        Outcome::Converged { paused: true, .. } => Directive {
            status: None,
            requeue_after: STEADY_STATE_INTERVAL,
        },
        Outcome::Converged { version, .. } => {
            let last_converged_at = if prior.converged {
                prior.last_converged_at
            } else {
                Some(now.to_rfc3339_opts(SecondsFormat::Secs, true))
            };
            Directive {
                status: Some(DataPipelineStatus {
                    converged: true,
                    active_version: (*version).or(prior.active_version),
                    last_converged_at,
                    last_error: None,
                }),
                requeue_after: STEADY_STATE_INTERVAL,
            }
        }
        Outcome::Failed(Failure::Transient(_)) => Directive {
            status: None,
            requeue_after: RETRY_BACKOFF,
        },
        Outcome::Failed(Failure::Config(message)) => Directive {
            status: Some(failed_status(prior, StatusErrorKind::Config, message)),
            requeue_after: RETRY_BACKOFF,
        },
        Outcome::Failed(Failure::Drift(message)) => Directive {
            status: Some(failed_status(prior, StatusErrorKind::Drift, message)),
            requeue_after: RETRY_BACKOFF,
        },
    }
}

/// Build the status recorded for a surfaced failure.
fn failed_status(prior: DataPipelineStatus, kind: StatusErrorKind, message: &str) -> DataPipelineStatus {
    DataPipelineStatus {
        converged: false,
        active_version: prior.active_version,
        last_converged_at: prior.last_converged_at,
        last_error: Some(StatusError {
            kind,
            message: message.to_string(),
        }),
    }
}

/// Messages processed by a pipeline convergence controller.
pub enum PipelineCtlMsg {
    /// The resource was created or updated.
    PipelineUpdated(Arc<DataPipeline>),
    /// The resource was deleted.
    PipelineDeleted,
}

/// A convergence controller managing a single DataPipeline resource.
pub struct PipelineCtl {
    /// The shared registry client.
    registry: Arc<dyn RegistryClient>,
    /// The resource accessor used for loads and status persistence.
    accessor: Arc<dyn ResourceAccessor>,
    /// The namespace of the managed resource.
    namespace: String,
    /// The name of the managed resource.
    name: String,
    /// The last observed metadata generation of the managed resource.
    generation: Option<i64>,

    /// A channel of inbound resource events from the CR watcher.
    events_rx: ReceiverStream<PipelineCtlMsg>,
    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A bool indicating that this controller has been descheduled and needs to shutdown.
    descheduled: bool,
}

impl PipelineCtl {
    /// Create a new instance.
    pub fn new(
        registry: Arc<dyn RegistryClient>, accessor: Arc<dyn ResourceAccessor>, pipeline: Arc<DataPipeline>, shutdown_tx: broadcast::Sender<()>,
        events_rx: mpsc::Receiver<PipelineCtlMsg>,
    ) -> Self {
        Self {
            registry,
            accessor,
            namespace: pipeline.namespace().to_string(),
            name: pipeline.name().to_string(),
            generation: pipeline.metadata.generation,
            events_rx: ReceiverStream::new(events_rx),
            shutdown_tx,
            descheduled: false,
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::debug!("convergence controller {}/{} has started", self.namespace, self.name);
        let mut shutdown = BroadcastStream::new(self.shutdown_tx.subscribe());

        // The first pass runs immediately; each subsequent pass follows the
        // previous pass's reschedule directive.
        let mut deadline = Instant::now();
        loop {
            if self.descheduled {
                break;
            }
            let delay = tokio::time::sleep_until(deadline);
            tokio::select! {
                _ = delay => {
                    // Race the pass against shutdown so that a mid-pass
                    // cancellation persists nothing.
                    let requeue_opt = {
                        let pass = self.execute_pass();
                        tokio::pin!(pass);
                        tokio::select! {
                            requeue_opt = &mut pass => requeue_opt,
                            _ = shutdown.next() => break,
                        }
                    };
                    match requeue_opt {
                        Some(requeue_after) => deadline = Instant::now() + requeue_after,
                        None => self.descheduled = true,
                    }
                }
                msg_opt = self.events_rx.next() => match msg_opt {
                    Some(PipelineCtlMsg::PipelineUpdated(pipeline)) => {
                        // A spec change triggers an immediate pass; status-only
                        // updates do not reset the schedule.
                        if pipeline.metadata.generation != self.generation {
                            self.generation = pipeline.metadata.generation;
                            deadline = Instant::now();
                        }
                    }
                    Some(PipelineCtlMsg::PipelineDeleted) | None => self.descheduled = true,
                },
                _ = shutdown.next() => break,
            }
        }

        tracing::debug!("convergence controller {}/{} has shutdown", self.namespace, self.name);
        Ok(())
    }

    /// Execute a single reconcile pass, returning the delay before the next
    /// pass, or `None` if the resource no longer exists.
    #[tracing::instrument(level = "debug", skip(self))]
    async fn execute_pass(&self) -> Option<Duration> {
        // Load a fresh snapshot; the spec is immutable for the duration of the pass.
        let pipeline = match self.accessor.load(&self.namespace, &self.name).await {
            Ok(Some(pipeline)) => pipeline,
            Ok(None) => {
                tracing::debug!("DataPipeline {}/{} no longer exists, descheduling controller", self.namespace, self.name);
                return None;
            }
            Err(err) => {
                tracing::error!(error = ?err, "error loading DataPipeline for reconciliation");
                return Some(RETRY_BACKOFF);
            }
        };

        let outcome = converge(self.registry.as_ref(), &pipeline).await;
        if let Outcome::Failed(failure) = &outcome {
            match failure {
                Failure::Transient(message) => tracing::error!(error = %message, "transient registry failure, pass will be retried"),
                Failure::Config(message) => tracing::error!(error = %message, "registry rejected the declared schema"),
                Failure::Drift(message) => tracing::error!(error = %message, "registry content drift detected"),
            }
        }

        let directive = schedule(&pipeline, &outcome, Utc::now());
        if let Some(status) = directive.status {
            // Persist only when the status actually changed.
            if pipeline.status.as_ref() != Some(&status) {
                match self.accessor.save_status(&pipeline, status).await {
                    Ok(SaveOutcome::Saved) => (),
                    Ok(SaveOutcome::Conflict) => {
                        // Registry calls are not rolled back; re-running the
                        // full sequence next pass is idempotent.
                        tracing::debug!("DataPipeline mutated concurrently, abandoning pass");
                        return Some(RETRY_BACKOFF);
                    }
                    Err(err) => {
                        tracing::error!(error = ?err, "error persisting DataPipeline status");
                        return Some(RETRY_BACKOFF);
                    }
                }
            }
        }
        Some(directive.requeue_after)
    }
}
