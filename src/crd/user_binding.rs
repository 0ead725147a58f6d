//! RemoteUserBinding CRD
//!
//! Binds a Kubernetes subject to the RemoteUsers (one per Git host) and the
//! RemoteTargets it may push to.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, LocalRef, Subject};

/// RemoteUserBinding maps a Kubernetes subject to Git identities.
///
/// Example:
/// ```yaml
/// apiVersion: kommit.dev/v1beta2
/// kind: RemoteUserBinding
/// metadata:
///   name: alice
///   namespace: app
/// spec:
///   subject:
///     kind: User
///     name: alice
///   remoteUserRefs:
///     - name: alice-gitea
///   remoteTargetRefs:
///     - name: app-config-main
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kommit.dev",
    version = "v1beta2",
    kind = "RemoteUserBinding",
    namespaced,
    status = "RemoteUserBindingStatus",
    shortname = "rub",
    printcolumn = r#"{"name":"Subject","type":"string","jsonPath":".spec.subject.name"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.globalStatus"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RemoteUserBindingSpec {
    /// The Kubernetes identity this binding applies to
    pub subject: Subject,

    /// RemoteUsers available to the subject, at most one per Git host is used
    #[serde(default)]
    pub remote_user_refs: Vec<LocalRef>,

    /// RemoteTargets the subject may push to
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remote_target_refs: Vec<LocalRef>,
}

/// Bound state of one referenced RemoteUser
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum HostBindingStatus {
    /// User and Secret are usable
    Bound,
    /// User or Secret missing or unusable
    NotBound,
}

/// Roll-up over all referenced RemoteUsers
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum GlobalBindingStatus {
    /// Every referenced user is bound
    AllBound,
    /// Some referenced users are bound
    PartiallyBound,
    /// No referenced user is bound
    NoneBound,
}

impl std::fmt::Display for GlobalBindingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AllBound => write!(f, "AllBound"),
            Self::PartiallyBound => write!(f, "PartiallyBound"),
            Self::NoneBound => write!(f, "NoneBound"),
        }
    }
}

/// Per-host status row
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GitUserHost {
    /// Referenced RemoteUser name
    pub remote_user_used: String,
    /// Secret the user points at, when the user exists
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<String>,
    /// Git host of the user, when the user exists
    #[serde(rename = "gitFQDN", default, skip_serializing_if = "Option::is_none")]
    pub git_fqdn: Option<String>,
    /// Bound or not
    pub status: HostBindingStatus,
}

/// RemoteUserBinding status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteUserBindingStatus {
    /// One row per referenced RemoteUser
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub git_user_hosts: Vec<GitUserHost>,

    /// Roll-up of the rows
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_status: Option<GlobalBindingStatus>,

    /// Type-keyed conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl GlobalBindingStatus {
    /// Roll up per-host rows. An empty binding counts as `NoneBound`.
    pub fn from_rows(rows: &[GitUserHost]) -> Self {
        let bound = rows
            .iter()
            .filter(|r| r.status == HostBindingStatus::Bound)
            .count();
        match bound {
            0 => Self::NoneBound,
            n if n == rows.len() => Self::AllBound,
            _ => Self::PartiallyBound,
        }
    }
}

impl RemoteUserBinding {
    /// Whether this binding references the named RemoteUser
    pub fn references_user(&self, name: &str) -> bool {
        self.spec.remote_user_refs.iter().any(|r| r.name == name)
    }

    /// Whether this binding references the named RemoteTarget
    pub fn references_target(&self, name: &str) -> bool {
        self.spec.remote_target_refs.iter().any(|r| r.name == name)
    }
}
