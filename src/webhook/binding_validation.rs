//! RemoteUserBinding validation webhook

use std::collections::HashSet;
use std::sync::Arc;

use axum::{extract::State, Json};
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use kube::ResourceExt;
use tracing::{debug, warn};

use crate::crd::{LocalRef, RemoteUserBinding, RemoteUserBindingSpec};

use super::{request_from_review, WebhookState};

fn duplicates(refs: &[LocalRef]) -> Vec<&str> {
    let mut seen = HashSet::new();
    let mut dups = Vec::new();
    for r in refs {
        if !seen.insert(r.name.as_str()) && !dups.contains(&r.name.as_str()) {
            dups.push(r.name.as_str());
        }
    }
    dups
}

/// Problems with a RemoteUserBinding spec, empty when it is consistent
pub fn validate_spec(spec: &RemoteUserBindingSpec) -> Vec<String> {
    let mut errors = Vec::new();
    if spec.subject.name.trim().is_empty() {
        errors.push("subject.name must not be empty".to_string());
    }
    let users = duplicates(&spec.remote_user_refs);
    if !users.is_empty() {
        errors.push(format!("remoteUserRefs lists {} more than once", users.join(", ")));
    }
    let targets = duplicates(&spec.remote_target_refs);
    if !targets.is_empty() {
        errors.push(format!(
            "remoteTargetRefs lists {} more than once",
            targets.join(", ")
        ));
    }
    errors
}

/// `POST /kommit/v1beta2/validate/remoteuserbinding`
pub async fn validate_binding(
    State(state): State<Arc<WebhookState>>,
    Json(review): Json<AdmissionReview<RemoteUserBinding>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let request = match request_from_review(review) {
        Ok(request) => request,
        Err(invalid) => return Json(invalid),
    };
    Json(review_binding(&state, &request).await.into_review())
}

async fn review_binding(
    state: &WebhookState,
    request: &AdmissionRequest<RemoteUserBinding>,
) -> AdmissionResponse {
    let mut response = AdmissionResponse::from(request);
    if matches!(request.operation, Operation::Delete) {
        return response;
    }
    let Some(binding) = &request.object else {
        return response.deny("request carries no RemoteUserBinding");
    };

    let errors = validate_spec(&binding.spec);
    if !errors.is_empty() {
        debug!(uid = %request.uid, ?errors, "RemoteUserBinding rejected");
        return response.deny(errors.join("; "));
    }

    // Overlapping subjects are only caught at push time, so warn early.
    let namespace = request.namespace.clone().unwrap_or_default();
    let name = binding.name_any();
    match state.reader.list_user_bindings(&namespace).await {
        Ok(bindings) => {
            let others: Vec<String> = bindings
                .iter()
                .filter(|b| b.name_any() != name && b.spec.subject.name == binding.spec.subject.name)
                .map(|b| b.name_any())
                .collect();
            if !others.is_empty() {
                response.warnings.get_or_insert_with(Vec::new).push(format!(
                    "subject {} is also bound by {}; its requests will be denied as ambiguous",
                    binding.spec.subject.name,
                    others.join(", ")
                ));
            }
        }
        Err(e) => warn!(uid = %request.uid, error = %e, "Could not list bindings for overlap check"),
    }
    response
}
