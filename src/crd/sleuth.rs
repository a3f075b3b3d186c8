//! Sleuth Custom Resource Definition
//!
//! A Sleuth resource declares the desired state of one managed AI
//! diagnostics deployment: which backend and model to run, how much compute
//! it gets, which credentials it uses, and whether it targets the local
//! cluster or an external one via a kubeconfig secret.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    AiSpec, Condition, ExtraOptions, RemoteCacheSpec, ResourcesSpec, SecretRef, SleuthPhase,
};

/// Specification for a Sleuth deployment
///
/// The spec is immutable within a reconcile pass; the only field the operator
/// itself writes back is the derived default backoff policy.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "sleuth.dev",
    version = "v1alpha1",
    kind = "Sleuth",
    plural = "sleuths",
    shortname = "sl",
    status = "SleuthStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Backend","type":"string","jsonPath":".spec.ai.backend"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SleuthSpec {
    /// Container image repository for the diagnostics server
    #[serde(default = "default_repository")]
    pub repository: String,

    /// Image tag
    #[serde(default = "default_version")]
    pub version: String,

    /// Image pull policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,

    /// AI backend configuration
    pub ai: AiSpec,

    /// Resource requests and limits for the workload container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourcesSpec>,

    /// Kubeconfig secret reference; when set the workload analyzes an
    /// external cluster instead of the one it runs in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<SecretRef>,

    /// Additional backend-specific options
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_options: Option<ExtraOptions>,

    /// Remote analysis-cache configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_cache: Option<RemoteCacheSpec>,

    /// Node selector for workload scheduling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,
}

fn default_repository() -> String {
    "ghcr.io/sleuth-dev/sleuth".to_string()
}

fn default_version() -> String {
    "latest".to_string()
}

impl SleuthSpec {
    /// Returns true if the workload targets an external cluster
    pub fn is_out_of_cluster(&self) -> bool {
        self.kubeconfig.is_some()
    }

    /// Returns the IRSA role ARN if identity federation is configured
    pub fn irsa_role_arn(&self) -> Option<&str> {
        self.extra_options
            .as_ref()
            .and_then(|o| o.service_account_role_arn.as_deref())
    }

    /// Returns true if out-of-cluster mode must still keep the workload's
    /// in-cluster identity wiring (external-identity-federation credentials)
    pub fn keeps_identity_out_of_cluster(&self) -> bool {
        self.ai.backend.has_dedicated_credentials() && self.irsa_role_arn().is_some()
    }

    /// Validate the spec
    ///
    /// Raised before any synchronization is attempted: a contradictory spec
    /// is terminal and must never produce a partially configured workload.
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.ai.engine.is_some() && !self.ai.backend.supports_engine() {
            return Err(crate::Error::validation(format!(
                "engine is supported only by the azureopenai backend, not {}",
                self.ai.backend
            )));
        }

        if self.ai.backend.requires_region()
            && self.ai.region.as_deref().unwrap_or("").is_empty()
        {
            return Err(crate::Error::validation(format!(
                "region is required for the {} backend",
                self.ai.backend
            )));
        }

        Ok(())
    }
}

/// Status for a Sleuth deployment
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SleuthStatus {
    /// Current lifecycle phase
    #[serde(default)]
    pub phase: SleuthPhase,

    /// Whether the diagnostics server has available replicas
    #[serde(default)]
    pub ready: bool,

    /// Human-readable message about current state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Conditions representing the deployment state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl SleuthStatus {
    /// Create a new status with the given phase
    pub fn with_phase(phase: SleuthPhase) -> Self {
        Self {
            phase,
            ..Default::default()
        }
    }

    /// Set the ready flag and return self for chaining
    pub fn ready(mut self, ready: bool) -> Self {
        self.ready = ready;
        self
    }

    /// Set the message and return self for chaining
    pub fn message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Add a condition and return self for chaining
    ///
    /// A condition of the same type replaces the previous one rather than
    /// accumulating.
    pub fn condition(mut self, condition: Condition) -> Self {
        self.conditions.retain(|c| c.type_ != condition.type_);
        self.conditions.push(condition);
        self
    }
}
