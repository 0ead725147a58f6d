//! RemoteUser validation webhook
//!
//! A RemoteUser lends its Secret's token to whoever is bound to it, so its
//! author must be able to read that Secret themselves.

use std::sync::Arc;

use axum::{extract::State, Json};
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use tracing::{info, warn};

use crate::crd::RemoteUser;
use crate::rbac::can_get_secret;

use super::{request_from_review, WebhookState};

/// Host name with an optional port, without scheme or path
fn is_bare_host(fqdn: &str) -> bool {
    !fqdn.is_empty() && !fqdn.contains("://") && !fqdn.contains('/') && !fqdn.contains(char::is_whitespace)
}

/// `POST /kommit/v1beta2/validate/remoteuser`
pub async fn validate_user(
    State(state): State<Arc<WebhookState>>,
    Json(review): Json<AdmissionReview<RemoteUser>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let request = match request_from_review(review) {
        Ok(request) => request,
        Err(invalid) => return Json(invalid),
    };
    Json(review_user(&state, &request).await.into_review())
}

async fn review_user(state: &WebhookState, request: &AdmissionRequest<RemoteUser>) -> AdmissionResponse {
    let response = AdmissionResponse::from(request);
    if matches!(request.operation, Operation::Delete) {
        return response;
    }
    let Some(user) = &request.object else {
        return response.deny("request carries no RemoteUser");
    };

    let spec = &user.spec;
    if spec.secret_ref.name.is_empty() {
        return response.deny("secretRef.name must not be empty");
    }
    if !is_bare_host(&spec.git_base_domain_fqdn) {
        return response.deny(format!(
            "gitBaseDomainFQDN {:?} must be a bare host name",
            spec.git_base_domain_fqdn
        ));
    }

    let namespace = request.namespace.clone().unwrap_or_default();
    match can_get_secret(
        state.reviewer.as_ref(),
        &request.user_info,
        &namespace,
        &spec.secret_ref.name,
    )
    .await
    {
        Ok(true) => response,
        Ok(false) => {
            info!(
                uid = %request.uid,
                user = ?request.user_info.username,
                secret = %spec.secret_ref.name,
                "RemoteUser references a Secret its author cannot read"
            );
            response.deny(format!(
                "you are not allowed to get secret {namespace}/{}",
                spec.secret_ref.name
            ))
        }
        Err(e) => {
            warn!(uid = %request.uid, error = %e, "SubjectAccessReview failed");
            response.deny(format!("permission check failed: {e}"))
        }
    }
}
