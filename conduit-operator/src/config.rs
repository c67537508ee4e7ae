//! Runtime configuration.

use anyhow::{Context, Result};
use serde::Deserialize;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    pub rust_log: String,
    /// The Kubernetes namespace to watch for DataPipeline resources.
    pub namespace: String,
    /// The name of the pod on which this instance is running.
    pub pod_name: String,
    /// Base URL of the schema registry's Confluent-compatible API.
    ///
    /// E.G., `http://apicurio:1080/apis/ccompat/v6`.
    pub registry_endpoint: String,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routine just parses the runtime environment and builds
    /// the application config from that. In the future, this may take into
    /// account an optional config file as well.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        envy::from_env().context("error building config from env")
    }
}
