use std::fmt;
use std::path::PathBuf;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Yaml},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::selector::SelectorError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PolicyMode {
    /// Reject pods without an affinity on the validating path.
    DenyMissing,
    /// Inject the affinity into every selected pod.
    PatchAlways,
    /// Inject the affinity into selected pods that have none.
    #[default]
    PatchMissing,
}

impl PolicyMode {
    pub const ALL: [PolicyMode; 3] = [
        PolicyMode::DenyMissing,
        PolicyMode::PatchAlways,
        PolicyMode::PatchMissing,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PolicyMode::DenyMissing => "denyMissing",
            PolicyMode::PatchAlways => "patchAlways",
            PolicyMode::PatchMissing => "patchMissing",
        }
    }
}

impl fmt::Display for PolicyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("affinity patch is not valid JSON: {0}")]
    InvalidAffinityPatch(#[source] serde_json::Error),
    #[error("affinity patch must be a JSON object, got: {0}")]
    AffinityPatchNotObject(Value),
    #[error("invalid pod selector: {0}")]
    InvalidSelector(#[from] SelectorError),
}

fn default_listen_addr() -> String {
    "0.0.0.0:8443".to_string()
}

fn default_metrics_addr() -> String {
    "0.0.0.0:9090".to_string()
}

fn default_cert_dir() -> String {
    "/var/run/affinity-admission-controller".to_string()
}

fn default_keypair_name() -> String {
    "tls".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_affinity_patch() -> Value {
    Value::Object(Default::default())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
    #[serde(default = "default_cert_dir")]
    pub cert_dir: String,
    #[serde(default = "default_keypair_name")]
    pub keypair_name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub client_ca: ClientCaConfig,
    #[serde(default)]
    pub policy: PolicySettings,
}

/// Where the API server's request-header client CA is published.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientCaConfig {
    pub enabled: bool,
    pub namespace: String,
    pub config_map: String,
    pub key: String,
}

impl Default for ClientCaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            namespace: "kube-system".to_string(),
            config_map: "extension-apiserver-authentication".to_string(),
            key: "requestheader-client-ca-file".to_string(),
        }
    }
}

/// Raw policy settings. `affinity_patch` and `pod_selector` accept either a
/// structured value or a string holding raw JSON (as passed on the command
/// line or through the environment).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicySettings {
    pub mode: PolicyMode,
    pub affinity_patch: Value,
    pub pod_selector: Option<Value>,
    pub reject_unsupported_content_type: bool,
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            mode: PolicyMode::default(),
            affinity_patch: default_affinity_patch(),
            pod_selector: None,
            reject_unsupported_content_type: false,
        }
    }
}

/// Values given on the command line. They take precedence over the file and
/// the environment.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub listen_addr: Option<String>,
    pub mode: Option<String>,
    pub affinity_patch: Option<String>,
    pub pod_selector: Option<String>,
}

impl AdmissionConfig {
    pub fn load(path: &str, overrides: &Overrides) -> Result<Self, Box<figment::Error>> {
        let mut figment = Figment::new()
            .merge(Yaml::file(path))
            .merge(Env::prefixed("AFFINITY_").split("__"));

        let flags = [
            ("listen_addr", &overrides.listen_addr),
            ("policy.mode", &overrides.mode),
            ("policy.affinity_patch", &overrides.affinity_patch),
            ("policy.pod_selector", &overrides.pod_selector),
        ];
        for (key, value) in flags {
            if let Some(value) = value {
                figment = figment.merge(Serialized::default(key, value));
            }
        }

        figment.extract().map_err(Box::new)
    }

    pub fn cert_path(&self) -> PathBuf {
        PathBuf::from(&self.cert_dir).join(format!("{}.crt", self.keypair_name))
    }

    pub fn key_path(&self) -> PathBuf {
        PathBuf::from(&self.cert_dir).join(format!("{}.key", self.keypair_name))
    }
}

impl PolicySettings {
    /// The affinity value to inject, decoded from raw JSON when given as a string.
    pub fn affinity_value(&self) -> Result<Value, ConfigError> {
        let value = match &self.affinity_patch {
            Value::String(raw) => {
                serde_json::from_str(raw).map_err(ConfigError::InvalidAffinityPatch)?
            }
            other => other.clone(),
        };
        if !value.is_object() {
            return Err(ConfigError::AffinityPatchNotObject(value));
        }
        Ok(value)
    }

    /// The pod selector as raw JSON, or `None` when unset, blank or `null`.
    pub fn pod_selector_json(&self) -> Option<String> {
        match &self.pod_selector {
            None | Some(Value::Null) => None,
            Some(Value::String(raw)) if matches!(raw.trim(), "" | "null") => None,
            Some(Value::String(raw)) => Some(raw.clone()),
            Some(other) => Some(other.to_string()),
        }
    }
}
