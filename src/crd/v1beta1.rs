//! Legacy `v1beta1` schemas
//!
//! These are still served so that older manifests keep applying. Objects are
//! stored as `v1beta2`; see [`crate::conversion`] for the mapping.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::syncer::{RemoteSyncerStatus, ScopedResources, UnauthorizedUserMode};
use super::target::RemoteTargetStatus;
use super::types::{LocalRef, Subject};
use super::user::RemoteUserStatus;
use super::user_binding::RemoteUserBindingStatus;

/// Legacy RemoteSyncer
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kommit.dev",
    version = "v1beta1",
    kind = "RemoteSyncer",
    namespaced,
    status = "RemoteSyncerStatus",
    shortname = "rsy"
)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSyncerSpec {
    /// Repository URL
    pub remote_repository: String,
    /// Branch commits land on
    #[serde(default)]
    pub default_branch: String,
    /// Intercepted resources
    pub scoped_resources: ScopedResources,
    /// Renamed to `strategy` in v1beta2
    #[serde(default)]
    pub process_mode: ProcessMode,
    /// Directory inside the repository
    #[serde(default)]
    pub root_path: String,
    /// Field paths removed before serialization
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_fields: Vec<String>,
    /// ConfigMap with extra excluded fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excluded_fields_config_map_ref: Option<LocalRef>,
    /// Callers let through without a commit
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bypass_interception_subjects: Vec<Subject>,
    /// Handling of unbound callers
    #[serde(default)]
    pub default_unauthorized_user_mode: UnauthorizedUserMode,
    /// Default RemoteUser
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_remote_user_ref: Option<LocalRef>,
    /// Accept any TLS certificate
    #[serde(default)]
    pub insecure_skip_tls_verify: bool,
    /// Secret holding a CA bundle
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_bundle_secret_ref: Option<LocalRef>,
    /// Message for denied CommitOnly requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_blocked_message: Option<String>,
}

/// Legacy name of [`crate::crd::Strategy`]
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ProcessMode {
    /// Push then deny
    #[default]
    CommitOnly,
    /// Push then allow
    CommitApply,
}

/// Legacy RemoteUser
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kommit.dev",
    version = "v1beta1",
    kind = "RemoteUser",
    namespaced,
    status = "RemoteUserStatus",
    shortname = "ru"
)]
#[serde(rename_all = "camelCase")]
pub struct RemoteUserSpec {
    /// Commit author email
    pub email: String,
    /// Git host
    #[serde(rename = "gitBaseDomainFQDN")]
    pub git_base_domain_fqdn: String,
    /// basic-auth Secret
    pub secret_ref: LocalRef,
    /// Became the `kommit.dev/associated-remote-userbinding` annotation
    #[serde(default)]
    pub associated_remote_user_binding: bool,
}

/// Legacy RemoteUserBinding
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kommit.dev",
    version = "v1beta1",
    kind = "RemoteUserBinding",
    namespaced,
    status = "RemoteUserBindingStatus",
    shortname = "rub"
)]
#[serde(rename_all = "camelCase")]
pub struct RemoteUserBindingSpec {
    /// Kubernetes identity
    pub subject: Subject,
    /// Renamed to `remoteUserRefs` in v1beta2
    #[serde(default)]
    pub remote_refs: Vec<LocalRef>,
}

/// Legacy RemoteTarget
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kommit.dev",
    version = "v1beta1",
    kind = "RemoteTarget",
    namespaced,
    status = "RemoteTargetStatus",
    shortname = "rt"
)]
#[serde(rename_all = "camelCase")]
pub struct RemoteTargetSpec {
    /// Upstream repository
    pub upstream_repository: String,
    /// Upstream branch
    pub upstream_branch: String,
    /// Target repository
    pub target_repository: String,
    /// Target branch
    pub target_branch: String,
    /// Legacy merge strategy labels
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_strategy: Option<LegacyMergeStrategy>,
}

/// Merge strategy labels used before v1beta2
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum LegacyMergeStrategy {
    /// Now `TryFastForwardOrDie`
    FastForwardOrDie,
    /// Now `TryFastForwardOrHardReset`
    FastForwardOrReset,
    /// Now `TryHardResetOrDie`
    ResetOrDie,
}
