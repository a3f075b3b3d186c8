//! Supporting types for the Sleuth CRD

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Supported AI backends for the managed diagnostics server
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum Backend {
    /// OpenAI API (default)
    #[default]
    OpenAi,
    /// Azure OpenAI Service; the only backend that accepts an engine name
    AzureOpenAi,
    /// Amazon Bedrock; requires a region and uses its own credential path
    AmazonBedrock,
    /// LocalAI for self-hosted models
    LocalAi,
}

impl Backend {
    /// Returns true if this backend carries its own dedicated credential
    /// path instead of the generic password-style secret injection
    pub fn has_dedicated_credentials(&self) -> bool {
        matches!(self, Self::AmazonBedrock)
    }

    /// Returns true if this backend accepts an engine name
    pub fn supports_engine(&self) -> bool {
        matches!(self, Self::AzureOpenAi)
    }

    /// Returns true if this backend requires a region
    pub fn requires_region(&self) -> bool {
        matches!(self, Self::AmazonBedrock)
    }
}

impl std::str::FromStr for Backend {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "azureopenai" => Ok(Self::AzureOpenAi),
            "amazonbedrock" => Ok(Self::AmazonBedrock),
            "localai" => Ok(Self::LocalAi),
            _ => Err(crate::Error::validation(format!(
                "invalid backend: {s}, expected one of: openai, azureopenai, amazonbedrock, localai"
            ))),
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OpenAi => write!(f, "openai"),
            Self::AzureOpenAi => write!(f, "azureopenai"),
            Self::AmazonBedrock => write!(f, "amazonbedrock"),
            Self::LocalAi => write!(f, "localai"),
        }
    }
}

/// Reference to a key within a Kubernetes Secret
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecretRef {
    /// Name of the secret
    pub name: String,
    /// Key within the secret
    pub key: String,
}

/// Retry backoff policy for the managed diagnostics server
///
/// Persisted into the spec by the configure step when absent, so that the
/// durable store always carries the effective policy.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BackoffSpec {
    /// Whether backoff is enabled
    pub enabled: bool,
    /// Maximum number of retries
    pub max_retries: i32,
}

impl Default for BackoffSpec {
    fn default() -> Self {
        Self {
            enabled: false,
            max_retries: crate::DEFAULT_BACKOFF_MAX_RETRIES,
        }
    }
}

/// AI backend configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AiSpec {
    /// Which AI backend to use
    #[serde(default)]
    pub backend: Backend,

    /// Model name passed to the backend
    #[serde(default = "default_model")]
    pub model: String,

    /// Engine name; valid only for the azureopenai backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,

    /// Region; mandatory for the amazonbedrock backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    /// Credential secret reference for the backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<SecretRef>,

    /// Base URL override for the backend API
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Provider identifier forwarded to the server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,

    /// Proxy endpoint for outbound backend traffic
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_endpoint: Option<String>,

    /// Max token budget forwarded to the server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<String>,

    /// Top-K sampling parameter forwarded to the server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<String>,

    /// Retry backoff policy; defaulted by the configure step when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<BackoffSpec>,
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

/// Resource requests and limits for the workload container
///
/// Four independent fields: each falls back to its own fixed default when not
/// explicitly overridden, and overriding one never affects the others.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourcesSpec {
    /// CPU limit (default "1")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_limit: Option<String>,

    /// Memory limit (default "512Mi")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<String>,

    /// CPU request (default "0.2")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_request: Option<String>,

    /// Memory request (default "256Mi")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_request: Option<String>,
}

/// Additional backend-specific options
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExtraOptions {
    /// IAM role ARN for identity federation (IRSA); annotated onto the
    /// workload's ServiceAccount when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_role_arn: Option<String>,
}

/// Remote cache provider variants
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum RemoteCacheProvider {
    /// Azure Blob Storage cache
    Azure,
    /// Amazon S3 cache
    S3,
}

/// Remote analysis-cache configuration
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCacheSpec {
    /// Which cache provider to use
    pub provider: RemoteCacheProvider,
    /// Secret holding the cache provider credentials
    pub credentials: SecretRef,
}

/// Lifecycle phase of a managed Sleuth deployment
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[non_exhaustive]
pub enum SleuthPhase {
    /// Resource accepted, first pass not yet completed
    #[default]
    Pending,
    /// Descriptors converged, waiting for the workload to become available
    Progressing,
    /// The diagnostics server has available replicas
    Ready,
    /// The spec is contradictory and requires a change
    Failed,
}

impl std::fmt::Display for SleuthPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Progressing => write!(f, "Progressing"),
            Self::Ready => write!(f, "Ready"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., Ready)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the transition time set to now
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    /// Story: Backends know their own special-case rules
    ///
    /// The builder and validator never hard-code backend names at the call
    /// site; they ask the backend which rules apply to it.
    #[test]
    fn story_backend_capability_queries() {
        assert!(Backend::AzureOpenAi.supports_engine());
        assert!(!Backend::OpenAi.supports_engine());
        assert!(!Backend::AmazonBedrock.supports_engine());

        assert!(Backend::AmazonBedrock.requires_region());
        assert!(!Backend::AzureOpenAi.requires_region());

        assert!(Backend::AmazonBedrock.has_dedicated_credentials());
        assert!(!Backend::LocalAi.has_dedicated_credentials());
    }

    #[test]
    fn test_backend_round_trips_through_strings() {
        for backend in [
            Backend::OpenAi,
            Backend::AzureOpenAi,
            Backend::AmazonBedrock,
            Backend::LocalAi,
        ] {
            let parsed = Backend::from_str(&backend.to_string()).unwrap();
            assert_eq!(parsed, backend);
        }

        assert!(Backend::from_str("watsonx").is_err());
    }

    #[test]
    fn test_backoff_default_matches_persisted_policy() {
        let backoff = BackoffSpec::default();
        assert!(!backoff.enabled);
        assert_eq!(backoff.max_retries, 5);
    }

    #[test]
    fn test_condition_replaces_transition_time_on_creation() {
        let before = Utc::now();
        let condition = Condition::new("Ready", ConditionStatus::True, "WorkloadReady", "ok");
        assert!(condition.last_transition_time >= before);
        assert_eq!(condition.status.to_string(), "True");
    }
}
