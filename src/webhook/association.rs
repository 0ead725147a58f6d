//! RemoteUser association webhook
//!
//! A RemoteUser annotated `kommit.dev/associated-remote-userbinding: "true"`
//! is added to a default RemoteUserBinding for the person creating it, so
//! that pushing as yourself needs no hand-written binding. Removing the
//! annotation or the user takes it back out; a default binding left without
//! users is deleted.
//!
//! This webhook never blocks: bookkeeping failures are logged and the
//! request is allowed.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{extract::State, Json};
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::crd::{dns_label, LocalRef, RemoteUser, RemoteUserBinding, RemoteUserBindingSpec, Subject};
use crate::{Error, MANAGED_BY_ASSOCIATION, MANAGED_BY_LABEL};

use super::{request_from_review, WebhookState};

/// Prefix of default binding names
pub const DEFAULT_BINDING_PREFIX: &str = "associated-rub-";

/// Name of the default binding for an apiserver username
pub fn default_binding_name(username: &str) -> String {
    let mut name = format!("{DEFAULT_BINDING_PREFIX}{}", dns_label(username));
    name.truncate(253);
    name
}

/// Binding subject for an apiserver username
pub fn subject_for(username: &str) -> Subject {
    match username
        .strip_prefix("system:serviceaccount:")
        .and_then(|rest| rest.split_once(':'))
    {
        Some((namespace, name)) => Subject::service_account(namespace, name),
        None => Subject::user(username),
    }
}

fn is_association_managed(binding: &RemoteUserBinding) -> bool {
    binding
        .labels()
        .get(MANAGED_BY_LABEL)
        .is_some_and(|v| v == MANAGED_BY_ASSOCIATION)
}

/// `POST /kommit/v1beta2/associate/remoteuser`
pub async fn associate_user(
    State(state): State<Arc<WebhookState>>,
    Json(review): Json<AdmissionReview<RemoteUser>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let request = match request_from_review(review) {
        Ok(request) => request,
        Err(invalid) => return Json(invalid),
    };
    let response = AdmissionResponse::from(&request);
    if request.dry_run {
        return Json(response.into_review());
    }
    if let Err(e) = associate(&state, &request).await {
        warn!(uid = %request.uid, error = %e, "RemoteUser association failed");
    }
    Json(response.into_review())
}

async fn associate(state: &WebhookState, request: &AdmissionRequest<RemoteUser>) -> Result<(), Error> {
    let namespace = request.namespace.clone().unwrap_or_default();
    match (&request.operation, &request.object, &request.old_object) {
        (Operation::Create | Operation::Update, Some(user), _) if user.wants_association() => {
            let username = request.user_info.username.clone().unwrap_or_default();
            if username.is_empty() {
                return Err(Error::validation("request has no username"));
            }
            attach(state, &namespace, &username, &user.name_any()).await
        }
        (Operation::Create | Operation::Update, Some(user), _) => {
            detach(state, &namespace, &user.name_any()).await
        }
        (Operation::Delete, _, Some(user)) => detach(state, &namespace, &user.name_any()).await,
        (Operation::Delete, _, None) if !request.name.is_empty() => {
            detach(state, &namespace, &request.name).await
        }
        _ => Ok(()),
    }
}

/// Add `user` to the caller's default binding, creating it if needed
///
/// Only an association-managed binding whose subject is exactly the caller
/// is reused. Binding names are lossy, so a name already held by anything
/// else fails the association instead of joining that binding.
async fn attach(state: &WebhookState, namespace: &str, username: &str, user: &str) -> Result<(), Error> {
    let subject = subject_for(username);
    let bindings = state.reader.list_user_bindings(namespace).await?;
    let own = bindings
        .iter()
        .find(|b| is_association_managed(b) && b.spec.subject == subject)
        .cloned();

    match own {
        Some(binding) if binding.references_user(user) => {
            debug!(binding = %binding.name_any(), user = %user, "Already associated");
            Ok(())
        }
        Some(mut binding) => {
            binding.spec.remote_user_refs.push(LocalRef::new(user));
            state.bindings.replace_user_binding(&binding).await?;
            info!(binding = %binding.name_any(), user = %user, namespace = %namespace, "Associated RemoteUser");
            Ok(())
        }
        None => {
            let name = default_binding_name(username);
            if bindings.iter().any(|b| b.name_any() == name) {
                return Err(Error::validation(format!(
                    "RemoteUserBinding {name} already exists and does not belong to {username}"
                )));
            }
            let mut binding = RemoteUserBinding::new(
                &name,
                RemoteUserBindingSpec {
                    subject,
                    remote_user_refs: vec![LocalRef::new(user)],
                    remote_target_refs: vec![],
                },
            );
            binding.metadata.namespace = Some(namespace.to_string());
            binding.metadata.labels = Some(BTreeMap::from([(
                MANAGED_BY_LABEL.to_string(),
                MANAGED_BY_ASSOCIATION.to_string(),
            )]));
            state.bindings.create_user_binding(&binding).await?;
            info!(binding = %name, user = %user, namespace = %namespace, "Created default RemoteUserBinding");
            Ok(())
        }
    }
}

/// Remove `user` from every default binding, deleting the ones left empty
async fn detach(state: &WebhookState, namespace: &str, user: &str) -> Result<(), Error> {
    let bindings = state.reader.list_user_bindings(namespace).await?;
    for mut binding in bindings
        .into_iter()
        .filter(|b| is_association_managed(b) && b.references_user(user))
    {
        binding.spec.remote_user_refs.retain(|r| r.name != user);
        if binding.spec.remote_user_refs.is_empty() {
            state
                .bindings
                .delete_user_binding(namespace, &binding.name_any())
                .await?;
            info!(binding = %binding.name_any(), namespace = %namespace, "Deleted empty default RemoteUserBinding");
        } else {
            state.bindings.replace_user_binding(&binding).await?;
            info!(binding = %binding.name_any(), user = %user, "Dissociated RemoteUser");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{MockBindingWriter, MockClusterReader};
    use crate::rbac::MockAccessReviewer;
    use crate::webhook::PathRegistry;
    use serde_json::{json, Value};

    fn state(reader: MockClusterReader, writer: MockBindingWriter) -> Arc<WebhookState> {
        Arc::new(WebhookState::new(
            Arc::new(PathRegistry::new()),
            Arc::new(MockAccessReviewer::new()),
            Arc::new(reader),
            Arc::new(writer),
        ))
    }

    fn user_json(annotated: bool) -> Value {
        let mut user = json!({
            "apiVersion": "kommit.dev/v1beta2",
            "kind": "RemoteUser",
            "metadata": {"name": "alice-gitea", "namespace": "app"},
            "spec": {
                "email": "alice@example.com",
                "gitBaseDomainFQDN": "git.example.com",
                "secretRef": {"name": "alice-pat"}
            }
        });
        if annotated {
            user["metadata"]["annotations"] = json!({crate::ASSOCIATION_ANNOTATION: "true"});
        }
        user
    }

    fn review(operation: &str, object: Option<Value>, old: Option<Value>) -> AdmissionReview<RemoteUser> {
        review_as("alice@example.com", operation, object, old)
    }

    fn review_as(
        username: &str,
        operation: &str,
        object: Option<Value>,
        old: Option<Value>,
    ) -> AdmissionReview<RemoteUser> {
        serde_json::from_value(json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "5e6f7a8b-0000-4000-8000-000000000006",
                "kind": {"group": "kommit.dev", "version": "v1beta2", "kind": "RemoteUser"},
                "resource": {"group": "kommit.dev", "version": "v1beta2", "resource": "remoteusers"},
                "name": "alice-gitea",
                "namespace": "app",
                "operation": operation,
                "userInfo": {"username": username},
                "object": object,
                "oldObject": old
            }
        }))
        .unwrap()
    }

    fn default_binding(users: &[&str]) -> RemoteUserBinding {
        let mut b = RemoteUserBinding::new(
            &default_binding_name("alice@example.com"),
            RemoteUserBindingSpec {
                subject: Subject::user("alice@example.com"),
                remote_user_refs: users.iter().map(|u| LocalRef::new(*u)).collect(),
                remote_target_refs: vec![],
            },
        );
        b.metadata.namespace = Some("app".into());
        b.metadata.labels = Some(BTreeMap::from([(
            MANAGED_BY_LABEL.to_string(),
            MANAGED_BY_ASSOCIATION.to_string(),
        )]));
        b
    }

    #[test]
    fn names_and_subjects_follow_the_caller() {
        assert_eq!(
            default_binding_name("alice@example.com"),
            "associated-rub-alice-example-com"
        );
        assert_eq!(
            subject_for("system:serviceaccount:ci:deployer"),
            Subject::service_account("ci", "deployer")
        );
        assert_eq!(subject_for("alice"), Subject::user("alice"));
    }

    /// Story: opting in creates a default binding for the creator
    #[tokio::test]
    async fn story_opt_in_creates_default_binding() {
        let mut reader = MockClusterReader::new();
        reader.expect_list_user_bindings().returning(|_| Ok(vec![]));
        let mut writer = MockBindingWriter::new();
        writer
            .expect_create_user_binding()
            .withf(|b| {
                b.name_any() == "associated-rub-alice-example-com"
                    && b.spec.subject.name == "alice@example.com"
                    && b.references_user("alice-gitea")
                    && is_association_managed(b)
            })
            .times(1)
            .returning(|_| Ok(()));

        let Json(out) = associate_user(
            State(state(reader, writer)),
            Json(review("CREATE", Some(user_json(true)), None)),
        )
        .await;
        assert!(out.response.unwrap().allowed);
    }

    #[tokio::test]
    async fn opt_in_appends_to_an_existing_default_binding() {
        let mut reader = MockClusterReader::new();
        reader
            .expect_list_user_bindings()
            .returning(|_| Ok(vec![default_binding(&["alice-github"])]));
        let mut writer = MockBindingWriter::new();
        writer
            .expect_replace_user_binding()
            .withf(|b| b.references_user("alice-github") && b.references_user("alice-gitea"))
            .times(1)
            .returning(|_| Ok(()));
        writer.expect_create_user_binding().never();

        associate_user(
            State(state(reader, writer)),
            Json(review("UPDATE", Some(user_json(true)), Some(user_json(false)))),
        )
        .await;
    }

    /// Story: deleting the last associated user removes the default binding
    #[tokio::test]
    async fn story_delete_removes_empty_default_binding() {
        let mut reader = MockClusterReader::new();
        reader
            .expect_list_user_bindings()
            .returning(|_| Ok(vec![default_binding(&["alice-gitea"])]));
        let mut writer = MockBindingWriter::new();
        writer
            .expect_delete_user_binding()
            .withf(|ns, name| ns == "app" && name == "associated-rub-alice-example-com")
            .times(1)
            .returning(|_, _| Ok(()));

        let Json(out) = associate_user(
            State(state(reader, writer)),
            Json(review("DELETE", None, Some(user_json(true)))),
        )
        .await;
        assert!(out.response.unwrap().allowed);
    }

    #[tokio::test]
    async fn opt_out_leaves_hand_written_bindings_alone() {
        let mut reader = MockClusterReader::new();
        reader.expect_list_user_bindings().returning(|_| {
            let mut hand_written = default_binding(&["alice-gitea"]);
            hand_written.metadata.labels = None;
            Ok(vec![hand_written, default_binding(&["alice-gitea", "alice-github"])])
        });
        let mut writer = MockBindingWriter::new();
        writer
            .expect_replace_user_binding()
            .withf(|b| !b.references_user("alice-gitea") && b.references_user("alice-github"))
            .times(1)
            .returning(|_| Ok(()));
        writer.expect_delete_user_binding().never();

        associate_user(
            State(state(reader, writer)),
            Json(review("UPDATE", Some(user_json(false)), Some(user_json(true)))),
        )
        .await;
    }

    #[tokio::test]
    async fn failures_never_block_the_request() {
        let mut reader = MockClusterReader::new();
        reader
            .expect_list_user_bindings()
            .returning(|_| Err(Error::internal("apiserver down")));

        let Json(out) = associate_user(
            State(state(reader, MockBindingWriter::new())),
            Json(review("CREATE", Some(user_json(true)), None)),
        )
        .await;
        assert!(out.response.unwrap().allowed);
    }

    /// Story: two callers whose names sanitize alike never share a binding
    #[tokio::test]
    async fn story_name_collision_does_not_leak_a_credential() {
        let mut reader = MockClusterReader::new();
        reader.expect_list_user_bindings().returning(|_| {
            let mut other = default_binding(&["alice-own"]);
            other.metadata.name = Some("associated-rub-alice-smith".into());
            other.spec.subject = Subject::user("alice-smith");
            Ok(vec![other])
        });
        let mut writer = MockBindingWriter::new();
        writer.expect_replace_user_binding().never();
        writer.expect_create_user_binding().never();

        let Json(out) = associate_user(
            State(state(reader, writer)),
            Json(review_as("alice.smith", "CREATE", Some(user_json(true)), None)),
        )
        .await;
        assert!(out.response.unwrap().allowed);
    }

    #[tokio::test]
    async fn unmanaged_binding_with_the_default_name_is_not_joined() {
        let mut reader = MockClusterReader::new();
        reader.expect_list_user_bindings().returning(|_| {
            let mut planted = default_binding(&["mallory-gitea"]);
            planted.metadata.labels = None;
            Ok(vec![planted])
        });
        let mut writer = MockBindingWriter::new();
        writer.expect_replace_user_binding().never();
        writer.expect_create_user_binding().never();

        associate_user(
            State(state(reader, writer)),
            Json(review("CREATE", Some(user_json(true)), None)),
        )
        .await;
    }

    #[tokio::test]
    async fn own_binding_is_found_regardless_of_its_name() {
        let mut reader = MockClusterReader::new();
        reader.expect_list_user_bindings().returning(|_| {
            let mut own = default_binding(&["alice-github"]);
            own.metadata.name = Some("alice-default".into());
            Ok(vec![own])
        });
        let mut writer = MockBindingWriter::new();
        writer
            .expect_replace_user_binding()
            .withf(|b| b.name_any() == "alice-default" && b.references_user("alice-gitea"))
            .times(1)
            .returning(|_| Ok(()));
        writer.expect_create_user_binding().never();

        associate_user(
            State(state(reader, writer)),
            Json(review("CREATE", Some(user_json(true)), None)),
        )
        .await;
    }
}
