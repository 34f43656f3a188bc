//! WLM enclave configuration: connection identity, service mode and
//! HTTP classification rules.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EnclaveError, Result};

/// Privilege level used to reach the native enclave services.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceMode {
    /// Supervisor-state IWM services.
    Authorized,
    /// Problem-state callable services.
    #[default]
    Unauthorized,
}

impl ServiceMode {
    /// String representation.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Authorized => "AUTHORIZED",
            Self::Unauthorized => "UNAUTHORIZED",
        }
    }
}

/// Top-level WLM configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WlmConfig {
    /// Service privilege level.
    #[serde(default)]
    pub mode: ServiceMode,
    /// Subsystem type passed to connect.
    #[serde(default = "default_subsystem")]
    pub subsystem: String,
    /// Subsystem name passed to connect.
    #[serde(default = "default_subsystem_name")]
    pub subsystem_name: String,
    /// Create function name used when classifying.
    #[serde(default = "default_create_function_name")]
    pub create_function_name: String,
    /// Collection name used when classifying.
    #[serde(default = "default_collection_name")]
    pub collection_name: String,
    /// Bounded wait for the connect worker to stop, in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
    /// Ordered HTTP classification rules.
    #[serde(default)]
    pub classification: Vec<ClassificationEntry>,
}

/// One raw classification rule as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationEntry {
    /// Transaction class (1-8 characters).
    pub transaction_class: String,
    /// Host name, or `*`.
    #[serde(default = "wildcard")]
    pub host: String,
    /// `*`, a port, an `m-n` range, or a comma separated list of those.
    #[serde(default = "wildcard")]
    pub port: String,
    /// `*` or a comma separated list of HTTP methods.
    #[serde(default = "wildcard")]
    pub method: String,
    /// Request URI, with `*` and `/**/` wildcards.
    #[serde(default = "wildcard")]
    pub resource: String,
}

impl ClassificationEntry {
    /// Entry for a transaction class with every other field wildcarded.
    pub fn new(transaction_class: &str) -> Self {
        Self {
            transaction_class: transaction_class.to_string(),
            host: wildcard(),
            port: wildcard(),
            method: wildcard(),
            resource: wildcard(),
        }
    }

    /// Set the host.
    pub fn with_host(mut self, host: &str) -> Self {
        self.host = host.to_string();
        self
    }

    /// Set the port specification.
    pub fn with_port(mut self, port: &str) -> Self {
        self.port = port.to_string();
        self
    }

    /// Set the method list.
    pub fn with_method(mut self, method: &str) -> Self {
        self.method = method.to_string();
        self
    }

    /// Set the resource pattern.
    pub fn with_resource(mut self, resource: &str) -> Self {
        self.resource = resource.to_string();
        self
    }
}

impl Default for WlmConfig {
    fn default() -> Self {
        Self {
            mode: ServiceMode::default(),
            subsystem: default_subsystem(),
            subsystem_name: default_subsystem_name(),
            create_function_name: default_create_function_name(),
            collection_name: default_collection_name(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            classification: Vec::new(),
        }
    }
}

impl WlmConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| EnclaveError::Config {
            message: format!("{path}: {e}"),
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| EnclaveError::Config {
            message: e.to_string(),
        })
    }

    /// Worker shutdown wait as a duration.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

fn wildcard() -> String {
    "*".to_string()
}

fn default_subsystem() -> String {
    "CB".to_string()
}

fn default_subsystem_name() -> String {
    "BBOSERVR".to_string()
}

fn default_create_function_name() -> String {
    "CBWLM".to_string()
}

fn default_collection_name() -> String {
    "LIBERTY".to_string()
}

fn default_shutdown_timeout() -> u64 {
    60
}
