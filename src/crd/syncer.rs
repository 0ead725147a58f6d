//! RemoteSyncer CRD
//!
//! A RemoteSyncer selects which resources of its namespace are intercepted,
//! where their YAML lands in Git, and how the admission request is answered
//! once the commit is pushed.

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, LocalRef, ObjectDescriptor, Subject};

/// RemoteSyncer declares an interception scope and its Git destination.
///
/// Example:
/// ```yaml
/// apiVersion: kommit.dev/v1beta2
/// kind: RemoteSyncer
/// metadata:
///   name: app-configmaps
///   namespace: app
/// spec:
///   remoteRepository: https://git.example.com/platform/app-config.git
///   defaultBranch: main
///   rootPath: clusters/dev
///   strategy: CommitApply
///   targetStrategy: OneTarget
///   defaultUnauthorizedUserMode: Block
///   excludedFields:
///     - metadata.uid
///     - metadata.managedFields
///   scopedResources:
///     rules:
///       - apiGroups: [""]
///         apiVersions: ["v1"]
///         resources: ["configmaps"]
///         operations: ["CREATE", "UPDATE", "DELETE"]
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kommit.dev",
    version = "v1beta2",
    kind = "RemoteSyncer",
    namespaced,
    status = "RemoteSyncerStatus",
    shortname = "rsy",
    printcolumn = r#"{"name":"Repository","type":"string","jsonPath":".spec.remoteRepository"}"#,
    printcolumn = r#"{"name":"Strategy","type":"string","jsonPath":".spec.strategy"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSyncerSpec {
    /// Repository URL (`https://`, `http://` or `git://`)
    pub remote_repository: String,

    /// Branch commits land on when no per-user target is selected
    #[serde(default)]
    pub default_branch: String,

    /// Which resources and operations are intercepted
    pub scoped_resources: ScopedResources,

    /// Whether the change also reaches the cluster after the push
    #[serde(default)]
    pub strategy: Strategy,

    /// Whether a caller pushes to exactly one target or to every match
    #[serde(default)]
    pub target_strategy: TargetStrategy,

    /// Restricts candidate RemoteTargets by label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_target_selector: Option<LabelSelector>,

    /// Directory inside the repository under which objects are written
    #[serde(default)]
    pub root_path: String,

    /// Field paths removed before serialization
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_fields: Vec<String>,

    /// ConfigMap whose `excludedFields` key holds a YAML list of extra paths
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excluded_fields_config_map_ref: Option<LocalRef>,

    /// Callers whose requests are let through without a commit
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bypass_interception_subjects: Vec<Subject>,

    /// What to do with callers that have no binding
    #[serde(default)]
    pub default_unauthorized_user_mode: UnauthorizedUserMode,

    /// RemoteUser used for unbound callers in `UseDefaultUser` mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_remote_user_ref: Option<LocalRef>,

    /// RemoteTarget used for unbound callers in `UseDefaultUser` mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_remote_target_ref: Option<LocalRef>,

    /// Accept any TLS certificate from the Git server
    #[serde(default)]
    pub insecure_skip_tls_verify: bool,

    /// Secret holding a PEM CA bundle (`ca.crt` or `tls.crt`) for the Git server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_bundle_secret_ref: Option<LocalRef>,

    /// Message returned to the caller when a CommitOnly request is denied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_blocked_message: Option<String>,
}

/// Intercepted resources
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScopedResources {
    /// Group × version × resource × operation rules
    pub rules: Vec<ScopedRule>,

    /// How the apiserver matches equivalent resource versions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_policy: Option<MatchPolicy>,

    /// Only objects whose labels match are intercepted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_selector: Option<LabelSelector>,
}

/// One admission rule
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScopedRule {
    /// API groups, `""` for core and `*` for all
    pub api_groups: Vec<String>,
    /// API versions, `*` for all
    pub api_versions: Vec<String>,
    /// Plural resources, `*` for all
    pub resources: Vec<String>,
    /// Intercepted operations
    pub operations: Vec<Operation>,
}

/// Admission operation
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Object creation
    #[serde(rename = "CREATE")]
    Create,
    /// Object update or patch
    #[serde(rename = "UPDATE")]
    Update,
    /// Object deletion
    #[serde(rename = "DELETE")]
    Delete,
    /// Subresource connect (exec, port-forward, ...)
    #[serde(rename = "CONNECT")]
    Connect,
    /// Every operation
    #[serde(rename = "*")]
    All,
}

impl Operation {
    /// Wire name used by admission rules
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Connect => "CONNECT",
            Self::All => "*",
        }
    }

    /// RBAC verbs a caller needs to perform this operation directly
    pub fn rbac_verbs(&self) -> &'static [&'static str] {
        match self {
            Self::Create => &["create"],
            Self::Update => &["update", "patch"],
            Self::Delete => &["delete"],
            Self::Connect => &["connect"],
            Self::All => &["create", "update", "patch", "delete", "connect"],
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Admission match policy
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum MatchPolicy {
    /// Match only the exact group/version/resource
    Exact,
    /// Match equivalent versions of the resource too
    Equivalent,
}

impl MatchPolicy {
    /// Wire name used by admission configuration
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exact => "Exact",
            Self::Equivalent => "Equivalent",
        }
    }
}

/// What happens to the admission request after a successful push
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum Strategy {
    /// Push, then deny so the cluster never sees the change
    #[default]
    CommitOnly,
    /// Push, then allow the change into the cluster
    CommitApply,
}

/// How many RemoteTargets a single request is pushed to
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum TargetStrategy {
    /// Exactly one target must match
    #[default]
    OneTarget,
    /// Push to every matching target
    MultipleTarget,
}

impl std::fmt::Display for TargetStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OneTarget => write!(f, "OneTarget"),
            Self::MultipleTarget => write!(f, "MultipleTarget"),
        }
    }
}

impl std::str::FromStr for TargetStrategy {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OneTarget" => Ok(Self::OneTarget),
            "MultipleTarget" => Ok(Self::MultipleTarget),
            _ => Err(crate::Error::validation(format!(
                "invalid target strategy: {s}, expected OneTarget or MultipleTarget"
            ))),
        }
    }
}

/// Handling of callers without a RemoteUserBinding
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum UnauthorizedUserMode {
    /// Deny the request
    #[default]
    Block,
    /// Push with the default RemoteUser and RemoteTarget
    UseDefaultUser,
}

/// RemoteSyncer status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSyncerStatus {
    /// Type-keyed conditions (Ready, Synced)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Last intercepted request, whatever its outcome
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_observed_object_state: Option<ObservedObjectState>,

    /// Last request whose YAML reached Git
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_pushed_object_state: Option<PushedObjectState>,

    /// Last request let through by a bypass subject
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_bypassed_object_state: Option<BypassedObjectState>,
}

/// Record of an intercepted request
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObservedObjectState {
    /// The object the request was about
    pub last_observed_object: ObjectDescriptor,
    /// When the request was seen
    pub last_observed_time: DateTime<Utc>,
    /// Apiserver username of the caller
    pub last_observed_user: String,
    /// Admission operation
    pub operation: String,
}

/// Record of a successful push
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PushedObjectState {
    /// The object that was committed
    pub last_pushed_object: ObjectDescriptor,
    /// When the push finished
    pub last_pushed_time: DateTime<Utc>,
    /// Git username the commit was authored with
    pub last_pushed_git_user: String,
    /// Commit hash on the target branch
    pub last_commit_hash: String,
    /// Path of the YAML file in the repository
    pub last_pushed_path: String,
}

/// Record of a bypassed request
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BypassedObjectState {
    /// The object that was let through
    pub last_bypass_object: ObjectDescriptor,
    /// When the request was seen
    pub last_bypass_time: DateTime<Utc>,
    /// Apiserver username of the caller
    pub last_bypass_user: String,
}
