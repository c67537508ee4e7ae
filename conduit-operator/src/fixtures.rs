//! Test doubles shared across the operator's test suites.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;

use crate::error::RegistryError;
use crate::registry::{RegisteredVersion, RegistryClient, RegistryResult, VersionMetadata};
use crate::resource::{ResourceAccessor, SaveOutcome};
use conduit_core::crd::{DataPipeline, DataPipelineSpec, DataPipelineStatus, RequiredMetadata};

/// Build a DataPipeline in the `default` namespace for tests.
pub fn new_test_pipeline(name: &str, version: &str, schema: &str) -> DataPipeline {
    let mut pipeline = DataPipeline::new(
        name,
        DataPipelineSpec {
            name: name.to_string(),
            version: version.to_string(),
            schema: schema.to_string(),
            pause: false,
        },
    );
    pipeline.metadata.namespace = Some("default".into());
    pipeline
}

/// A record of one registry call observed by a test double.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegistryCall {
    VersionExists(String),
    RegisterVersion(String),
    FetchLatest(String),
}

/// An in-memory registry double holding ordered versions per subject.
#[derive(Default)]
pub struct MemoryRegistry {
    /// Registered content per subject; index + 1 is the version number.
    subjects: Mutex<HashMap<String, Vec<String>>>,
    /// Every call received, in order.
    calls: Mutex<Vec<RegistryCall>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    /// Seed the given subject with a registered version of the given content.
    pub fn seed(&self, subject: &str, content: &str) {
        self.subjects
            .lock()
            .expect("lock poisoned")
            .entry(subject.to_string())
            .or_default()
            .push(content.to_string());
    }

    /// The number of versions currently held by the given subject.
    pub fn version_count(&self, subject: &str) -> usize {
        self.subjects
            .lock()
            .expect("lock poisoned")
            .get(subject)
            .map(|versions| versions.len())
            .unwrap_or(0)
    }

    /// Every call received so far, in order.
    pub fn calls(&self) -> Vec<RegistryCall> {
        self.calls.lock().expect("lock poisoned").clone()
    }

    fn record(&self, call: RegistryCall) {
        self.calls.lock().expect("lock poisoned").push(call);
    }
}

#[async_trait]
impl RegistryClient for MemoryRegistry {
    async fn version_exists(&self, subject: &str) -> RegistryResult<Option<VersionMetadata>> {
        self.record(RegistryCall::VersionExists(subject.to_string()));
        let subjects = self.subjects.lock().expect("lock poisoned");
        Ok(subjects
            .get(subject)
            .filter(|versions| !versions.is_empty())
            .map(|_versions| VersionMetadata { version: 1 }))
    }

    async fn register_version(&self, subject: &str, content: &str) -> RegistryResult<RegisteredVersion> {
        self.record(RegistryCall::RegisterVersion(subject.to_string()));
        let mut subjects = self.subjects.lock().expect("lock poisoned");
        let versions = subjects.entry(subject.to_string()).or_default();
        versions.push(content.to_string());
        let version = versions.len() as i64;
        Ok(RegisteredVersion { version, global_id: version })
    }

    async fn fetch_latest(&self, subject: &str) -> RegistryResult<Option<String>> {
        self.record(RegistryCall::FetchLatest(subject.to_string()));
        let subjects = self.subjects.lock().expect("lock poisoned");
        Ok(subjects.get(subject).and_then(|versions| versions.last().cloned()))
    }
}

/// A scripted registry double returning pre-programmed results in order.
///
/// Unscripted calls resolve to a transient error so tests fail loudly.
#[derive(Default)]
pub struct StubRegistry {
    exists: Mutex<VecDeque<RegistryResult<Option<VersionMetadata>>>>,
    register: Mutex<VecDeque<RegistryResult<RegisteredVersion>>>,
    latest: Mutex<VecDeque<RegistryResult<Option<String>>>>,
    calls: Mutex<Vec<RegistryCall>>,
}

impl StubRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn script_exists(self, res: RegistryResult<Option<VersionMetadata>>) -> Self {
        self.exists.lock().expect("lock poisoned").push_back(res);
        self
    }

    pub fn script_register(self, res: RegistryResult<RegisteredVersion>) -> Self {
        self.register.lock().expect("lock poisoned").push_back(res);
        self
    }

    pub fn script_latest(self, res: RegistryResult<Option<String>>) -> Self {
        self.latest.lock().expect("lock poisoned").push_back(res);
        self
    }

    /// Every call received so far, in order.
    pub fn calls(&self) -> Vec<RegistryCall> {
        self.calls.lock().expect("lock poisoned").clone()
    }

    fn record(&self, call: RegistryCall) {
        self.calls.lock().expect("lock poisoned").push(call);
    }
}

#[async_trait]
impl RegistryClient for StubRegistry {
    async fn version_exists(&self, subject: &str) -> RegistryResult<Option<VersionMetadata>> {
        self.record(RegistryCall::VersionExists(subject.to_string()));
        self.exists
            .lock()
            .expect("lock poisoned")
            .pop_front()
            .unwrap_or_else(|| Err(RegistryError::Transient("unscripted existence check".into())))
    }

    async fn register_version(&self, subject: &str, _content: &str) -> RegistryResult<RegisteredVersion> {
        self.record(RegistryCall::RegisterVersion(subject.to_string()));
        self.register
            .lock()
            .expect("lock poisoned")
            .pop_front()
            .unwrap_or_else(|| Err(RegistryError::Transient("unscripted registration".into())))
    }

    async fn fetch_latest(&self, subject: &str) -> RegistryResult<Option<String>> {
        self.record(RegistryCall::FetchLatest(subject.to_string()));
        self.latest
            .lock()
            .expect("lock poisoned")
            .pop_front()
            .unwrap_or_else(|| Err(RegistryError::Transient("unscripted latest fetch".into())))
    }
}

/// An in-memory `ResourceAccessor` double.
#[derive(Default)]
pub struct MemoryAccessor {
    /// Stored resources keyed by (namespace, name).
    pipelines: Mutex<HashMap<(String, String), DataPipeline>>,
    /// Every status successfully persisted, in order.
    saved: Mutex<Vec<DataPipelineStatus>>,
    /// When set, the next save reports a conflict instead of persisting.
    conflict_next: Mutex<bool>,
}

impl MemoryAccessor {
    pub fn new() -> Self {
        Default::default()
    }

    /// Store the given resource.
    pub fn insert(&self, pipeline: DataPipeline) {
        let key = (pipeline.namespace().to_string(), pipeline.name().to_string());
        self.pipelines.lock().expect("lock poisoned").insert(key, pipeline);
    }

    /// Fetch a copy of the stored resource.
    pub fn get(&self, namespace: &str, name: &str) -> Option<DataPipeline> {
        self.pipelines
            .lock()
            .expect("lock poisoned")
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Every status successfully persisted so far, in order.
    pub fn saved(&self) -> Vec<DataPipelineStatus> {
        self.saved.lock().expect("lock poisoned").clone()
    }

    /// Make the next save attempt report a conflict.
    pub fn conflict_on_next_save(&self) {
        *self.conflict_next.lock().expect("lock poisoned") = true;
    }
}

#[async_trait]
impl ResourceAccessor for MemoryAccessor {
    async fn load(&self, namespace: &str, name: &str) -> Result<Option<DataPipeline>> {
        Ok(self
            .pipelines
            .lock()
            .expect("lock poisoned")
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn save_status(&self, pipeline: &DataPipeline, status: DataPipelineStatus) -> Result<SaveOutcome> {
        {
            let mut conflict = self.conflict_next.lock().expect("lock poisoned");
            if *conflict {
                *conflict = false;
                return Ok(SaveOutcome::Conflict);
            }
        }
        let key = (pipeline.namespace().to_string(), pipeline.name().to_string());
        if let Some(stored) = self.pipelines.lock().expect("lock poisoned").get_mut(&key) {
            stored.status = Some(status.clone());
        }
        self.saved.lock().expect("lock poisoned").push(status);
        Ok(SaveOutcome::Saved)
    }
}
