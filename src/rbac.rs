//! SubjectAccessReview checks
//!
//! A RemoteSyncer must not let its creator intercept, and therefore push
//! changes to, resources the creator could not change directly. The same
//! applies to RemoteUsers and the Secret they point to.
//!
//! Rule cells naming a group, version or resource the apiserver does not
//! serve are skipped: nothing can be admitted through them.

use std::collections::HashMap;

use async_trait::async_trait;
use k8s_openapi::api::authentication::v1::UserInfo;
use k8s_openapi::api::authorization::v1::{
    ResourceAttributes, SubjectAccessReview, SubjectAccessReviewSpec,
};
use kube::api::{Api, PostParams};
use kube::discovery;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::client::KubeClientImpl;
use crate::crd::{Operation, ScopedRule};
use crate::Error;

/// One authorization question for the apiserver
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AccessCheck {
    /// Caller whose permissions are checked
    pub user: UserInfo,
    /// Namespace of the resource
    pub namespace: String,
    /// API group, empty for core
    pub group: String,
    /// API version
    pub version: String,
    /// Plural resource
    pub resource: String,
    /// Specific object, if any
    pub name: Option<String>,
    /// RBAC verb
    pub verb: String,
}

/// Asks the apiserver whether a user may perform an action
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AccessReviewer: Send + Sync {
    /// Whether the check is allowed
    async fn allowed(&self, check: &AccessCheck) -> Result<bool, Error>;

    /// Whether the apiserver serves `resource` (optionally `plural/subresource`)
    /// in `group`/`version`
    async fn serves(&self, group: &str, version: &str, resource: &str) -> Result<bool, Error>;
}

#[async_trait]
impl AccessReviewer for KubeClientImpl {
    async fn allowed(&self, check: &AccessCheck) -> Result<bool, Error> {
        let api: Api<SubjectAccessReview> = Api::all(self.client.clone());
        let review = SubjectAccessReview {
            metadata: Default::default(),
            spec: SubjectAccessReviewSpec {
                user: check.user.username.clone(),
                uid: check.user.uid.clone(),
                groups: check.user.groups.clone(),
                extra: check.user.extra.clone(),
                resource_attributes: Some(ResourceAttributes {
                    namespace: Some(check.namespace.clone()),
                    group: Some(check.group.clone()),
                    version: Some(check.version.clone()),
                    resource: Some(check.resource.clone()),
                    name: check.name.clone(),
                    verb: Some(check.verb.clone()),
                    ..Default::default()
                }),
                ..Default::default()
            },
            status: None,
        };

        let result = api.create(&PostParams::default(), &review).await?;
        let allowed = result.status.is_some_and(|s| s.allowed);
        debug!(
            user = ?check.user.username,
            verb = %check.verb,
            resource = %check.resource,
            namespace = %check.namespace,
            allowed,
            "SubjectAccessReview"
        );
        Ok(allowed)
    }

    async fn serves(&self, group: &str, version: &str, resource: &str) -> Result<bool, Error> {
        let api_group = match discovery::group(&self.client, group).await {
            Ok(g) => g,
            Err(kube::Error::Api(resp)) if resp.code == 404 => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let (plural, subresource) = match resource.split_once('/') {
            Some((plural, sub)) => (plural, Some(sub)),
            None => (resource, None),
        };
        let served = api_group
            .versioned_resources(version)
            .iter()
            .any(|(ar, caps)| {
                ar.plural == plural
                    && subresource.map_or(true, |sub| {
                        caps.subresources.iter().any(|(s, _)| s.plural == sub)
                    })
            });
        debug!(group, version, resource, served, "API discovery");
        Ok(served)
    }
}

/// One group × version × resource × operation combination of a rule set
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuleCell {
    /// API group
    pub group: String,
    /// API version
    pub version: String,
    /// Plural resource
    pub resource: String,
    /// Admission operation
    pub operation: Operation,
}

impl std::fmt::Display for RuleCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.group.is_empty() {
            write!(f, "{} {} [{}]", self.version, self.resource, self.operation)
        } else {
            write!(
                f,
                "{}/{} {} [{}]",
                self.group, self.version, self.resource, self.operation
            )
        }
    }
}

/// Expand rules into their cells
pub fn rule_cells(rules: &[ScopedRule]) -> Vec<RuleCell> {
    let mut cells = Vec::new();
    for rule in rules {
        for group in &rule.api_groups {
            for version in &rule.api_versions {
                for resource in &rule.resources {
                    for operation in &rule.operations {
                        let cell = RuleCell {
                            group: group.clone(),
                            version: version.clone(),
                            resource: resource.clone(),
                            operation: *operation,
                        };
                        if !cells.contains(&cell) {
                            cells.push(cell);
                        }
                    }
                }
            }
        }
    }
    cells
}

impl RuleCell {
    fn has_wildcard(&self) -> bool {
        [&self.group, &self.version, &self.resource]
            .iter()
            .any(|part| part.contains('*'))
    }
}

/// Cells of `rules` the user may not perform, in rule order.
///
/// A cell is allowed only when every RBAC verb of its operation is. Cells
/// the apiserver does not serve are skipped; wildcard cells are left to
/// the access review.
pub async fn denied_cells(
    reviewer: &dyn AccessReviewer,
    user: &UserInfo,
    namespace: &str,
    rules: &[ScopedRule],
) -> Result<Vec<RuleCell>, Error> {
    let mut denied = Vec::new();
    let mut served: HashMap<(String, String, String), bool> = HashMap::new();
    for cell in rule_cells(rules) {
        if !cell.has_wildcard() {
            let key = (cell.group.clone(), cell.version.clone(), cell.resource.clone());
            let is_served = match served.get(&key) {
                Some(s) => *s,
                None => {
                    let s = reviewer
                        .serves(&cell.group, &cell.version, &cell.resource)
                        .await?;
                    served.insert(key, s);
                    s
                }
            };
            if !is_served {
                debug!(cell = %cell, "Skipping access review for an unserved resource");
                continue;
            }
        }
        for verb in cell.operation.rbac_verbs() {
            let check = AccessCheck {
                user: user.clone(),
                namespace: namespace.to_string(),
                group: cell.group.clone(),
                version: cell.version.clone(),
                resource: cell.resource.clone(),
                name: None,
                verb: verb.to_string(),
            };
            if !reviewer.allowed(&check).await? {
                denied.push(cell.clone());
                break;
            }
        }
    }
    Ok(denied)
}

/// Whether the user may read the named Secret
pub async fn can_get_secret(
    reviewer: &dyn AccessReviewer,
    user: &UserInfo,
    namespace: &str,
    secret: &str,
) -> Result<bool, Error> {
    reviewer
        .allowed(&AccessCheck {
            user: user.clone(),
            namespace: namespace.to_string(),
            group: String::new(),
            version: "v1".to_string(),
            resource: "secrets".to_string(),
            name: Some(secret.to_string()),
            verb: "get".to_string(),
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> UserInfo {
        UserInfo {
            username: Some("alice".into()),
            groups: Some(vec!["devs".into()]),
            ..Default::default()
        }
    }

    fn serving_everything() -> MockAccessReviewer {
        let mut reviewer = MockAccessReviewer::new();
        reviewer.expect_serves().returning(|_, _, _| Ok(true));
        reviewer
    }

    fn rule(groups: &[&str], resources: &[&str], ops: &[Operation]) -> ScopedRule {
        ScopedRule {
            api_groups: groups.iter().map(|s| s.to_string()).collect(),
            api_versions: vec!["v1".into()],
            resources: resources.iter().map(|s| s.to_string()).collect(),
            operations: ops.to_vec(),
        }
    }

    #[test]
    fn cells_format_like_kubectl_resources() {
        let cells = rule_cells(&[
            rule(&[""], &["configmaps"], &[Operation::Create]),
            rule(&["apps"], &["deployments"], &[Operation::Create, Operation::Delete]),
        ]);
        let printed: Vec<_> = cells.iter().map(|c| c.to_string()).collect();
        assert_eq!(
            printed,
            vec![
                "v1 configmaps [CREATE]",
                "apps/v1 deployments [CREATE]",
                "apps/v1 deployments [DELETE]",
            ]
        );
    }

    #[test]
    fn duplicate_cells_are_collapsed() {
        let cells = rule_cells(&[
            rule(&[""], &["configmaps"], &[Operation::Create]),
            rule(&[""], &["configmaps"], &[Operation::Create]),
        ]);
        assert_eq!(cells.len(), 1);
    }

    /// Story: a creator allowed on configmaps but not deployments is told which cells fail
    #[tokio::test]
    async fn story_denied_cells_are_listed() {
        let mut reviewer = serving_everything();
        reviewer
            .expect_allowed()
            .returning(|check| Ok(check.resource == "configmaps" || check.verb == "update"));

        let denied = denied_cells(
            &reviewer,
            &alice(),
            "app",
            &[
                rule(&[""], &["configmaps"], &[Operation::Create]),
                rule(&["apps"], &["deployments"], &[Operation::Create, Operation::Update]),
            ],
        )
        .await
        .unwrap();

        let printed: Vec<_> = denied.iter().map(|c| c.to_string()).collect();
        assert_eq!(
            printed,
            vec!["apps/v1 deployments [CREATE]", "apps/v1 deployments [UPDATE]"]
        );
    }

    #[tokio::test]
    async fn update_needs_both_update_and_patch() {
        let mut reviewer = serving_everything();
        reviewer
            .expect_allowed()
            .returning(|check| Ok(check.verb != "patch"));

        let denied = denied_cells(
            &reviewer,
            &alice(),
            "app",
            &[rule(&[""], &["configmaps"], &[Operation::Update])],
        )
        .await
        .unwrap();
        assert_eq!(denied.len(), 1);
    }

    /// Story: a rule naming a CRD that is not installed does not block the syncer
    #[tokio::test]
    async fn story_unserved_resources_are_tolerated() {
        let mut reviewer = MockAccessReviewer::new();
        reviewer
            .expect_serves()
            .returning(|group, _, _| Ok(group != "widgets.example.com"));
        reviewer
            .expect_allowed()
            .returning(|check| Ok(check.group != "widgets.example.com" && check.resource != "secrets"));

        let denied = denied_cells(
            &reviewer,
            &alice(),
            "app",
            &[
                rule(&["widgets.example.com"], &["widgets"], &[Operation::Create]),
                rule(&[""], &["configmaps", "secrets"], &[Operation::Create]),
            ],
        )
        .await
        .unwrap();

        let printed: Vec<_> = denied.iter().map(|c| c.to_string()).collect();
        assert_eq!(printed, vec!["v1 secrets [CREATE]"]);
    }

    #[tokio::test]
    async fn discovery_runs_once_per_resource() {
        let mut reviewer = MockAccessReviewer::new();
        reviewer
            .expect_serves()
            .times(1)
            .returning(|_, _, _| Ok(true));
        reviewer.expect_allowed().returning(|_| Ok(true));

        let denied = denied_cells(
            &reviewer,
            &alice(),
            "app",
            &[rule(
                &[""],
                &["configmaps"],
                &[Operation::Create, Operation::Update, Operation::Delete],
            )],
        )
        .await
        .unwrap();
        assert!(denied.is_empty());
    }

    #[tokio::test]
    async fn wildcard_cells_skip_discovery() {
        let mut reviewer = MockAccessReviewer::new();
        reviewer.expect_serves().never();
        reviewer.expect_allowed().returning(|_| Ok(false));

        let denied = denied_cells(
            &reviewer,
            &alice(),
            "app",
            &[rule(&["*"], &["*"], &[Operation::Create])],
        )
        .await
        .unwrap();
        assert_eq!(denied.len(), 1);
    }

    #[tokio::test]
    async fn secret_check_asks_for_get_on_the_named_secret() {
        let mut reviewer = MockAccessReviewer::new();
        reviewer
            .expect_allowed()
            .withf(|check| {
                check.verb == "get"
                    && check.resource == "secrets"
                    && check.name.as_deref() == Some("alice-pat")
                    && check.namespace == "app"
                    && check.user.username.as_deref() == Some("alice")
            })
            .times(1)
            .returning(|_| Ok(true));

        assert!(can_get_secret(&reviewer, &alice(), "app", "alice-pat")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn review_errors_propagate() {
        let mut reviewer = MockAccessReviewer::new();
        reviewer
            .expect_allowed()
            .returning(|_| Err(Error::internal("apiserver down")));
        assert!(can_get_secret(&reviewer, &alice(), "app", "s").await.is_err());
    }
}
