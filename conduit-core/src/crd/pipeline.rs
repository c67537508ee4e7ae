//! DataPipeline CRD.
//!
//! The code here is used to generate the actual CRD used in K8s.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub type DataPipeline = DataPipelineCRD; // Mostly to resolve a Rust Analyzer issue.

/// The lowercased resource kind, used as the leading segment of registry subjects.
const SUBJECT_KIND: &str = "datapipeline";

/// CRD spec for the DataPipeline resource.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, CustomResource, JsonSchema)]
#[kube(
    struct = "DataPipelineCRD",
    status = "DataPipelineStatus",
    group = "conduit.rs",
    version = "v1",
    kind = "DataPipeline",
    namespaced,
    derive = "PartialEq",
    apiextensions = "v1",
    shortname = "datapipeline",
    printcolumn = r#"{"name":"Schema Version","type":"string","jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Converged","type":"boolean","jsonPath":".status.converged"}"#
)]
pub struct DataPipelineSpec {
    /// The declared name of this pipeline, used to derive its registry subject.
    pub name: String,
    /// Opaque version tag of the declared schema.
    ///
    /// A new tag always maps to a new registry subject; subjects are never
    /// reused across versions.
    pub version: String,
    /// The raw Avro schema text which the registry is to hold for this pipeline.
    pub schema: String,
    /// Freeze convergence for this pipeline.
    ///
    /// While paused, reconcile passes make no registry calls at all.
    #[serde(default)]
    pub pause: bool,
}

/// CRD status object.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
pub struct DataPipelineStatus {
    /// Whether the registry's latest content matches the declared schema.
    #[serde(default)]
    pub converged: bool,
    /// The registry version number last observed for this pipeline's subject.
    #[serde(rename = "activeVersion", default, skip_serializing_if = "Option::is_none")]
    pub active_version: Option<i64>,
    /// RFC3339 timestamp of the most recent transition into convergence.
    #[serde(rename = "lastConvergedAt", default, skip_serializing_if = "Option::is_none")]
    pub last_converged_at: Option<String>,
    /// Detail of the most recent non-retryable failure, if any.
    #[serde(rename = "lastError", default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<StatusError>,
}

/// A failure surfaced on resource status for operator attention.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
pub struct StatusError {
    /// The failure class.
    pub kind: StatusErrorKind,
    /// Human-readable failure detail.
    pub message: String,
}

/// Classification of failures surfaced on resource status.
///
/// Transient registry failures are never surfaced here; they are visible
/// only as retry cadence.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum StatusErrorKind {
    /// The registry rejected the declared schema content as invalid.
    Config,
    /// The registry's latest content differs from the declared schema.
    Drift,
}

impl DataPipelineCRD {
    /// Derive the registry subject for this pipeline's declared (name, version) pair.
    pub fn subject(&self) -> String {
        subject_for(&self.spec.name, &self.spec.version)
    }
}

/// Render the registry subject for the given declared name and version tag.
///
/// The subject is a pure function of the resource kind, declared name and
/// version tag, of the form `{kind}.{name}.{version}-value`. Distinct
/// (name, version) pairs always map to distinct subjects.
pub fn subject_for(name: &str, version: &str) -> String {
    format!("{}.{}.{}-value", SUBJECT_KIND, name, version)
}
