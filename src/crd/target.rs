//! RemoteTarget CRD
//!
//! A RemoteTarget names the branch a commit lands on and, when that branch
//! differs from the upstream the RemoteSyncer watches, how the two are
//! reconciled before committing.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;

/// RemoteTarget describes an upstream → target branch pair.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kommit.dev",
    version = "v1beta2",
    kind = "RemoteTarget",
    namespaced,
    status = "RemoteTargetStatus",
    shortname = "rt",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Target","type":"string","jsonPath":".spec.targetBranch"}"#,
    printcolumn = r#"{"name":"Merge","type":"string","jsonPath":".spec.mergeStrategy"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RemoteTargetSpec {
    /// Repository the RemoteSyncer points at
    pub upstream_repository: String,
    /// Branch the RemoteSyncer points at
    pub upstream_branch: String,
    /// Repository commits are pushed to
    pub target_repository: String,
    /// Branch commits are pushed to
    pub target_branch: String,
    /// How the target branch catches up with upstream; empty when they are the same
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_strategy: Option<MergeStrategy>,
}

/// Reconciliation of a target branch with its upstream before committing
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum MergeStrategy {
    /// Fast-forward to upstream or fail
    TryFastForwardOrDie,
    /// Fast-forward, otherwise reset onto upstream
    TryFastForwardOrHardReset,
    /// Reset onto upstream
    TryHardResetOrDie,
}

impl std::fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TryFastForwardOrDie => write!(f, "TryFastForwardOrDie"),
            Self::TryFastForwardOrHardReset => write!(f, "TryFastForwardOrHardReset"),
            Self::TryHardResetOrDie => write!(f, "TryHardResetOrDie"),
        }
    }
}

impl std::str::FromStr for MergeStrategy {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TryFastForwardOrDie" => Ok(Self::TryFastForwardOrDie),
            "TryFastForwardOrHardReset" => Ok(Self::TryFastForwardOrHardReset),
            "TryHardResetOrDie" => Ok(Self::TryHardResetOrDie),
            _ => Err(crate::Error::validation(format!(
                "invalid merge strategy: {s}"
            ))),
        }
    }
}

/// RemoteTarget status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteTargetStatus {
    /// Type-keyed conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl RemoteTargetSpec {
    /// True when upstream and target designate the same branch of the same repository
    pub fn is_same_branch(&self) -> bool {
        crate::git::same_repository(&self.upstream_repository, &self.target_repository)
            && self.upstream_branch == self.target_branch
    }

    /// Check the merge-strategy invariant
    pub fn validate(&self) -> Result<(), crate::Error> {
        match (self.is_same_branch(), self.merge_strategy) {
            (true, Some(s)) => Err(crate::Error::validation(format!(
                "mergeStrategy {s} must be empty when upstream and target are the same branch"
            ))),
            (false, None) => Err(crate::Error::validation(
                "mergeStrategy is required when upstream and target differ",
            )),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(target_branch: &str, merge: Option<MergeStrategy>) -> RemoteTargetSpec {
        RemoteTargetSpec {
            upstream_repository: "https://git.example.com/a/b.git".into(),
            upstream_branch: "main".into(),
            target_repository: "https://git.example.com/a/b".into(),
            target_branch: target_branch.into(),
            merge_strategy: merge,
        }
    }

    #[test]
    fn same_branch_ignores_dot_git_suffix() {
        assert!(spec("main", None).is_same_branch());
        assert!(!spec("alice", None).is_same_branch());
    }

    #[test]
    fn merge_strategy_invariant() {
        assert!(spec("main", None).validate().is_ok());
        assert!(spec("main", Some(MergeStrategy::TryHardResetOrDie))
            .validate()
            .is_err());
        assert!(spec("alice", Some(MergeStrategy::TryFastForwardOrDie))
            .validate()
            .is_ok());
        assert!(spec("alice", None).validate().is_err());
    }

    #[test]
    fn merge_strategy_parses_its_display_form() {
        for s in [
            MergeStrategy::TryFastForwardOrDie,
            MergeStrategy::TryFastForwardOrHardReset,
            MergeStrategy::TryHardResetOrDie,
        ] {
            assert_eq!(s.to_string().parse::<MergeStrategy>().unwrap(), s);
        }
    }
}
