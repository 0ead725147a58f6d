//! RemoteUser CRD
//!
//! A RemoteUser pairs a Git host with a basic-auth Secret holding the Git
//! username and personal access token used to push on the caller's behalf.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, LocalRef};

/// RemoteUser holds a Git identity for one Git host.
///
/// Example:
/// ```yaml
/// apiVersion: kommit.dev/v1beta2
/// kind: RemoteUser
/// metadata:
///   name: alice-gitea
///   namespace: app
///   annotations:
///     kommit.dev/associated-remote-userbinding: "true"
/// spec:
///   email: alice@example.com
///   gitBaseDomainFQDN: git.example.com
///   secretRef:
///     name: alice-pat
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kommit.dev",
    version = "v1beta2",
    kind = "RemoteUser",
    namespaced,
    status = "RemoteUserStatus",
    shortname = "ru",
    printcolumn = r#"{"name":"Host","type":"string","jsonPath":".spec.gitBaseDomainFQDN"}"#,
    printcolumn = r#"{"name":"Secret","type":"string","jsonPath":".status.secretBoundStatus"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RemoteUserSpec {
    /// Commit author email
    pub email: String,

    /// Host of the Git server this identity is valid for
    #[serde(rename = "gitBaseDomainFQDN")]
    pub git_base_domain_fqdn: String,

    /// Secret of type `kubernetes.io/basic-auth`
    pub secret_ref: LocalRef,
}

/// Whether the referenced Secret is usable
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum SecretBoundStatus {
    /// The Secret does not exist
    SecretNotFound,
    /// The Secret exists but is not basic-auth or lacks a password
    SecretWrongType,
    /// The Secret is usable
    SecretBound,
}

impl std::fmt::Display for SecretBoundStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SecretNotFound => write!(f, "SecretNotFound"),
            Self::SecretWrongType => write!(f, "SecretWrongType"),
            Self::SecretBound => write!(f, "SecretBound"),
        }
    }
}

/// RemoteUser status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteUserStatus {
    /// Whether the Secret is usable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_bound_status: Option<SecretBoundStatus>,

    /// Git username found in the Secret
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_user: Option<String>,

    /// Type-keyed conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl RemoteUser {
    /// Whether the association webhook should maintain a default binding for this user
    pub fn wants_association(&self) -> bool {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(crate::ASSOCIATION_ANNOTATION))
            .is_some_and(|v| v == "true")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fqdn_field_keeps_its_upper_case_wire_name() {
        let spec = RemoteUserSpec {
            email: "alice@example.com".into(),
            git_base_domain_fqdn: "git.example.com".into(),
            secret_ref: LocalRef::new("alice-pat"),
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["gitBaseDomainFQDN"], "git.example.com");
        assert_eq!(json["secretRef"]["name"], "alice-pat");
    }

    #[test]
    fn association_opt_in_requires_literal_true() {
        let mut user = RemoteUser::new(
            "alice",
            RemoteUserSpec {
                email: "alice@example.com".into(),
                git_base_domain_fqdn: "git.example.com".into(),
                secret_ref: LocalRef::new("alice-pat"),
            },
        );
        assert!(!user.wants_association());

        user.metadata.annotations = Some(
            [(crate::ASSOCIATION_ANNOTATION.to_string(), "yes".to_string())]
                .into_iter()
                .collect(),
        );
        assert!(!user.wants_association());

        user.metadata.annotations = Some(
            [(crate::ASSOCIATION_ANNOTATION.to_string(), "true".to_string())]
                .into_iter()
                .collect(),
        );
        assert!(user.wants_association());
    }
}
