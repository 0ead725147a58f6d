//! Supporting types shared by the kommit CRDs

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

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

/// Status condition, keyed by `type`
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g. Ready, Synced)
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
    /// Create a new condition with the current timestamp
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

    /// True when both conditions say the same thing, ignoring timestamps
    pub fn same_state(&self, other: &Condition) -> bool {
        self.type_ == other.type_
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
    }
}

/// Merge `condition` into `conditions`, keyed by type.
///
/// An existing condition of the same type is replaced. The transition time
/// is kept when the status did not flip, so re-applying the same condition
/// is a no-op. Returns true when the list changed.
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition) -> bool {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if existing.same_state(&condition) {
                return false;
            }
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time;
            }
            *existing = condition;
            true
        }
        None => {
            conditions.push(condition);
            true
        }
    }
}

/// Find a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Well-known condition types and reasons
pub mod conditions {
    /// The resource is configured and serving
    pub const READY: &str = "Ready";
    /// The last intercepted change reached Git
    pub const SYNCED: &str = "Synced";

    /// Successful push
    pub const REASON_PUSHED: &str = "Pushed";
    /// Operation leaves the repository untouched
    pub const REASON_NOTHING_TO_COMMIT: &str = "NothingToCommit";
    /// Caller matched a bypass subject
    pub const REASON_BYPASSED: &str = "Bypassed";
    /// Identity or credential lookup failed
    pub const REASON_IDENTITY_FAILED: &str = "IdentityResolutionFailed";
    /// Object could not be serialized
    pub const REASON_SERIALIZATION_FAILED: &str = "SerializationFailed";
    /// Git rejected or failed the push
    pub const REASON_PUSH_FAILED: &str = "PushFailed";
    /// Push did not finish before the admission deadline
    pub const REASON_TIMEOUT: &str = "Timeout";
    /// Webhook entry installed
    pub const REASON_WEBHOOK_INSTALLED: &str = "WebhookInstalled";
    /// Webhook entry could not be installed
    pub const REASON_WEBHOOK_FAILED: &str = "WebhookInstallFailed";
    /// Target pattern could not be applied
    pub const REASON_TARGET_PATTERN_FAILED: &str = "TargetPatternFailed";
    /// Spec violates an invariant
    pub const REASON_INVALID_SPEC: &str = "InvalidSpec";
    /// Spec is consistent
    pub const REASON_VALID: &str = "Valid";
}

/// Kind of subject a binding or bypass entry refers to
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum SubjectKind {
    /// A human user as reported by the apiserver
    #[default]
    User,
    /// A service account in some namespace
    ServiceAccount,
}

impl std::fmt::Display for SubjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "User"),
            Self::ServiceAccount => write!(f, "ServiceAccount"),
        }
    }
}

/// A Kubernetes identity
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct Subject {
    /// User or ServiceAccount
    #[serde(default)]
    pub kind: SubjectKind,

    /// Username, or service account name
    pub name: String,

    /// Namespace of a service account; ignored for users
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl Subject {
    /// A user subject
    pub fn user(name: impl Into<String>) -> Self {
        Self {
            kind: SubjectKind::User,
            name: name.into(),
            namespace: None,
        }
    }

    /// A service-account subject
    pub fn service_account(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: SubjectKind::ServiceAccount,
            name: name.into(),
            namespace: Some(namespace.into()),
        }
    }

    /// Whether an apiserver username designates this subject.
    ///
    /// Service accounts match either their bare name or the fully qualified
    /// `system:serviceaccount:<ns>:<name>` form.
    pub fn matches_username(&self, username: &str) -> bool {
        if self.name == username {
            return true;
        }
        match (&self.kind, &self.namespace) {
            (SubjectKind::ServiceAccount, Some(ns)) => {
                username == format!("system:serviceaccount:{ns}:{}", self.name)
            }
            (SubjectKind::ServiceAccount, None) => username
                .strip_prefix("system:serviceaccount:")
                .and_then(|rest| rest.split_once(':'))
                .is_some_and(|(_, name)| name == self.name),
            (SubjectKind::User, _) => false,
        }
    }
}

/// Reference to an object in the same namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub struct LocalRef {
    /// Name of the referenced object
    pub name: String,
}

impl LocalRef {
    /// Create a reference by name
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Identity of an intercepted object (group/version/resource + name)
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectDescriptor {
    /// API group, empty for the core group
    #[serde(default)]
    pub group: String,
    /// API version
    pub version: String,
    /// Plural resource name
    pub resource: String,
    /// Object name
    pub name: String,
    /// Namespace, absent for cluster-scoped objects
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl std::fmt::Display for ObjectDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let group = if self.group.is_empty() {
            "core"
        } else {
            &self.group
        };
        match &self.namespace {
            Some(ns) => write!(
                f,
                "{group}/{}/{} {ns}/{}",
                self.version, self.resource, self.name
            ),
            None => write!(f, "{group}/{}/{} {}", self.version, self.resource, self.name),
        }
    }
}

/// Turn an arbitrary identity into a DNS-1123 label.
///
/// Lower-cases, maps every other character to `-`, collapses runs of `-`,
/// trims to 63 characters and strips leading and trailing `-`.
pub fn dns_label(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            out.push(c);
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    let trimmed: String = out.trim_matches('-').chars().take(63).collect();
    trimmed.trim_end_matches('-').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dns_label_handles_service_accounts_and_emails() {
        assert_eq!(
            dns_label("system:serviceaccount:ci:deployer"),
            "system-serviceaccount-ci-deployer"
        );
        assert_eq!(dns_label("Alice.Smith@Example.com"), "alice-smith-example-com");
        assert_eq!(dns_label("--x--"), "x");
        assert_eq!(dns_label(&"a".repeat(80)).len(), 63);
    }

    #[test]
    fn condition_serializes_with_kubernetes_field_names() {
        let condition = Condition::new("Ready", ConditionStatus::True, "Valid", "ok");
        let json = serde_json::to_value(&condition).unwrap();
        assert_eq!(json["type"], "Ready");
        assert_eq!(json["status"], "True");
        assert!(json.get("lastTransitionTime").is_some());
    }

    /// Story: repeated pushes do not grow the condition list
    #[test]
    fn story_condition_merge_is_idempotent() {
        let mut conditions = Vec::new();
        let c = Condition::new("Synced", ConditionStatus::True, "Pushed", "abc");

        assert!(set_condition(&mut conditions, c.clone()));
        assert!(!set_condition(&mut conditions, c.clone()));
        assert!(!set_condition(&mut conditions, c));
        assert_eq!(conditions.len(), 1);
    }

    /// Story: a failure replaces the previous success of the same type
    #[test]
    fn story_condition_merge_replaces_by_type() {
        let mut conditions = vec![
            Condition::new("Ready", ConditionStatus::True, "Valid", "ok"),
            Condition::new("Synced", ConditionStatus::True, "Pushed", "abc"),
        ];
        let failed = Condition::new("Synced", ConditionStatus::False, "PushFailed", "denied");
        assert!(set_condition(&mut conditions, failed));

        assert_eq!(conditions.len(), 2);
        let synced = find_condition(&conditions, "Synced").unwrap();
        assert_eq!(synced.status, ConditionStatus::False);
        assert_eq!(synced.reason, "PushFailed");
        assert_eq!(
            find_condition(&conditions, "Ready").unwrap().status,
            ConditionStatus::True
        );
    }

    #[test]
    fn transition_time_survives_message_only_changes() {
        let mut first = Condition::new("Synced", ConditionStatus::True, "Pushed", "one");
        first.last_transition_time = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let mut conditions = vec![first.clone()];

        set_condition(
            &mut conditions,
            Condition::new("Synced", ConditionStatus::True, "Pushed", "two"),
        );
        assert_eq!(conditions[0].message, "two");
        assert_eq!(
            conditions[0].last_transition_time,
            first.last_transition_time
        );
    }

    #[test]
    fn service_account_subject_matches_qualified_username() {
        let sa = Subject::service_account("ops", "deployer");
        assert!(sa.matches_username("system:serviceaccount:ops:deployer"));
        assert!(sa.matches_username("deployer"));
        assert!(!sa.matches_username("system:serviceaccount:other:deployer"));

        let any_ns = Subject {
            kind: SubjectKind::ServiceAccount,
            name: "deployer".into(),
            namespace: None,
        };
        assert!(any_ns.matches_username("system:serviceaccount:anywhere:deployer"));
    }

    #[test]
    fn user_subject_matches_exact_name_only() {
        let user = Subject::user("alice");
        assert!(user.matches_username("alice"));
        assert!(!user.matches_username("system:serviceaccount:ns:alice"));
    }

    #[test]
    fn subject_kind_defaults_to_user_when_absent() {
        let s: Subject = serde_json::from_str(r#"{"name":"bob"}"#).unwrap();
        assert_eq!(s.kind, SubjectKind::User);
    }

    #[test]
    fn descriptor_display_uses_core_for_empty_group() {
        let d = ObjectDescriptor {
            group: String::new(),
            version: "v1".into(),
            resource: "configmaps".into(),
            name: "cm1".into(),
            namespace: Some("app".into()),
        };
        assert_eq!(d.to_string(), "core/v1/configmaps app/cm1");
    }
}
