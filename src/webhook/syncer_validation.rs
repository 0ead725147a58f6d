//! RemoteSyncer validation webhook

use std::collections::HashMap;
use std::sync::Arc;

use axum::{extract::State, Json};
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use tracing::{debug, info, warn};

use crate::crd::{RemoteSyncer, RemoteSyncerSpec, Strategy, TargetStrategy, UnauthorizedUserMode};
use crate::fieldpath::is_valid_excluded_field;
use crate::git::is_valid_repository_url;
use crate::rbac::denied_cells;

use super::{request_from_review, WebhookState};

/// Problems with a RemoteSyncer spec, empty when it is consistent
pub fn validate_spec(spec: &RemoteSyncerSpec) -> Vec<String> {
    let mut errors = Vec::new();

    if !is_valid_repository_url(&spec.remote_repository) {
        errors.push(format!(
            "remoteRepository {:?} must match ^(https?|git)://[^ ]+$",
            spec.remote_repository
        ));
    }

    match (
        spec.default_unauthorized_user_mode,
        &spec.default_remote_user_ref,
    ) {
        (UnauthorizedUserMode::UseDefaultUser, None) => errors
            .push("defaultRemoteUserRef is required when defaultUnauthorizedUserMode is UseDefaultUser".into()),
        (UnauthorizedUserMode::Block, Some(_)) => errors
            .push("defaultRemoteUserRef must be empty when defaultUnauthorizedUserMode is Block".into()),
        _ => {}
    }

    if spec
        .default_blocked_message
        .as_deref()
        .is_some_and(|m| !m.is_empty())
        && spec.strategy != Strategy::CommitOnly
    {
        errors.push("defaultBlockedMessage is only allowed with strategy CommitOnly".into());
    }

    if spec.default_branch.is_empty() {
        if spec.target_strategy == TargetStrategy::OneTarget {
            errors.push("defaultBranch is required when targetStrategy is OneTarget".into());
        }
        if spec.default_unauthorized_user_mode == UnauthorizedUserMode::UseDefaultUser {
            errors.push(
                "defaultBranch is required when defaultUnauthorizedUserMode is UseDefaultUser".into(),
            );
        }
    }

    for field in &spec.excluded_fields {
        if !is_valid_excluded_field(field) {
            errors.push(format!("excludedFields entry {field:?} is not a valid field path"));
        }
    }

    let rules = &spec.scoped_resources.rules;
    if rules.is_empty() {
        errors.push("scopedResources.rules must contain at least one rule".into());
    }

    let mut owners: HashMap<(String, String, String), usize> = HashMap::new();
    for (i, rule) in rules.iter().enumerate() {
        if rule.api_groups.is_empty()
            || rule.api_versions.is_empty()
            || rule.resources.is_empty()
            || rule.operations.is_empty()
        {
            errors.push(format!(
                "scopedResources.rules[{i}] needs apiGroups, apiVersions, resources and operations"
            ));
        }
        for group in &rule.api_groups {
            for version in &rule.api_versions {
                for resource in &rule.resources {
                    let key = (group.clone(), version.clone(), resource.clone());
                    match owners.get(&key) {
                        Some(&first) if first != i => errors.push(format!(
                            "resource {group}/{version}/{resource} appears in rules {first} and {i}"
                        )),
                        Some(_) => {}
                        None => {
                            owners.insert(key, i);
                        }
                    }
                }
            }
        }
    }

    errors
}

/// `POST /kommit/v1beta2/validate/remotesyncer`
pub async fn validate_syncer(
    State(state): State<Arc<WebhookState>>,
    Json(review): Json<AdmissionReview<RemoteSyncer>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let request = match request_from_review(review) {
        Ok(request) => request,
        Err(invalid) => return Json(invalid),
    };
    Json(review_syncer(&state, &request).await.into_review())
}

async fn review_syncer(
    state: &WebhookState,
    request: &AdmissionRequest<RemoteSyncer>,
) -> AdmissionResponse {
    let response = AdmissionResponse::from(request);
    if matches!(request.operation, Operation::Delete) {
        return response;
    }
    let Some(syncer) = &request.object else {
        return response.deny("request carries no RemoteSyncer");
    };

    let errors = validate_spec(&syncer.spec);
    if !errors.is_empty() {
        debug!(uid = %request.uid, ?errors, "RemoteSyncer rejected");
        return response.deny(errors.join("; "));
    }

    let namespace = request.namespace.clone().unwrap_or_default();
    match denied_cells(
        state.reviewer.as_ref(),
        &request.user_info,
        &namespace,
        &syncer.spec.scoped_resources.rules,
    )
    .await
    {
        Ok(denied) if denied.is_empty() => response,
        Ok(denied) => {
            let cells: Vec<String> = denied.iter().map(|c| c.to_string()).collect();
            info!(
                uid = %request.uid,
                user = ?request.user_info.username,
                denied = ?cells,
                "RemoteSyncer scope exceeds creator permissions"
            );
            response.deny(format!(
                "you are not allowed to change every resource this RemoteSyncer intercepts: {}",
                cells.join(", ")
            ))
        }
        Err(e) => {
            warn!(uid = %request.uid, error = %e, "SubjectAccessReview failed");
            response.deny(format!("permission check failed: {e}"))
        }
    }
}
