//! Admission and conversion HTTP server
//!
//! One axum router serves everything the apiserver calls:
//!
//! - static validation routes for the kommit CRDs themselves
//! - the RemoteUser association route
//! - `POST /convert` for CRD version conversion
//! - a fallback that dispatches `/kommit.dev/validate/<ns>/<name>` to the
//!   [`DecisionPipeline`](crate::pipeline::DecisionPipeline) registered for
//!   that syncer
//!
//! Domain failures are always answered with `allowed: false` and a message.
//! HTTP errors are reserved for requests that are not admission reviews at all.

pub mod association;
pub mod binding_validation;
pub mod registry;
pub mod syncer_validation;
pub mod user_validation;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use kube::api::DynamicObject;
use kube::core::admission::{
    AdmissionRequest, AdmissionResponse, AdmissionReview, ConvertAdmissionReviewError,
};
use kube::core::conversion::ConversionReview;
use kube::Resource;
use tracing::{debug, info, warn};

use crate::client::{BindingWriter, ClusterReader};
use crate::rbac::AccessReviewer;
use crate::Error;

pub use registry::{webhook_path, PathRegistry};

/// Route of the RemoteSyncer validator
pub const VALIDATE_SYNCER_PATH: &str = "/kommit/v1beta2/validate/remotesyncer";
/// Route of the RemoteUser validator
pub const VALIDATE_USER_PATH: &str = "/kommit/v1beta2/validate/remoteuser";
/// Route of the RemoteUserBinding validator
pub const VALIDATE_BINDING_PATH: &str = "/kommit/v1beta2/validate/remoteuserbinding";
/// Route of the RemoteUser association webhook
pub const ASSOCIATE_USER_PATH: &str = "/kommit/v1beta2/associate/remoteuser";
/// Route of the CRD conversion webhook
pub const CONVERT_PATH: &str = "/convert";

/// Shared state for webhook handlers
pub struct WebhookState {
    /// Dynamic interception endpoints
    pub registry: Arc<PathRegistry>,
    /// SubjectAccessReview client for the RBAC checks
    pub reviewer: Arc<dyn AccessReviewer>,
    /// Reads bindings for the association and binding webhooks
    pub reader: Arc<dyn ClusterReader>,
    /// Writes default bindings for the association webhook
    pub bindings: Arc<dyn BindingWriter>,
}

impl WebhookState {
    /// Create webhook state
    pub fn new(
        registry: Arc<PathRegistry>,
        reviewer: Arc<dyn AccessReviewer>,
        reader: Arc<dyn ClusterReader>,
        bindings: Arc<dyn BindingWriter>,
    ) -> Self {
        Self {
            registry,
            reviewer,
            reader,
            bindings,
        }
    }
}

/// Unwrap the request of a review, or build the review that rejects it
pub(crate) fn request_from_review<T: Resource>(
    review: AdmissionReview<T>,
) -> Result<AdmissionRequest<T>, AdmissionReview<DynamicObject>> {
    review.try_into().map_err(|e: ConvertAdmissionReviewError| {
        warn!(error = %e, "Malformed AdmissionReview");
        AdmissionResponse::invalid(e.to_string()).into_review()
    })
}

/// Build the webhook router
pub fn router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route(VALIDATE_SYNCER_PATH, post(syncer_validation::validate_syncer))
        .route(VALIDATE_USER_PATH, post(user_validation::validate_user))
        .route(VALIDATE_BINDING_PATH, post(binding_validation::validate_binding))
        .route(ASSOCIATE_USER_PATH, post(association::associate_user))
        .route(CONVERT_PATH, post(convert))
        .fallback(dispatch)
        .with_state(state)
}

/// `POST /convert`
async fn convert(Json(review): Json<ConversionReview>) -> Json<ConversionReview> {
    Json(crate::conversion::review(review))
}

/// Route a dynamic interception path to its pipeline
async fn dispatch(
    State(state): State<Arc<WebhookState>>,
    method: Method,
    uri: Uri,
    body: Bytes,
) -> Response {
    let path = uri.path();
    let Some(pipeline) = state.registry.get(path).await else {
        debug!(path = %path, "No webhook registered");
        return (StatusCode::NOT_FOUND, format!("no webhook registered at {path}"))
            .into_response();
    };
    if method != Method::POST {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }

    let review: AdmissionReview<DynamicObject> = match serde_json::from_slice(&body) {
        Ok(review) => review,
        Err(e) => {
            warn!(path = %path, error = %e, "Body is not an AdmissionReview");
            return (StatusCode::BAD_REQUEST, format!("invalid AdmissionReview: {e}"))
                .into_response();
        }
    };
    let request = match request_from_review(review) {
        Ok(request) => request,
        Err(invalid) => return Json(invalid).into_response(),
    };
    Json(pipeline.review(&request).await.into_review()).into_response()
}

/// Serve the router over TLS with `tls.crt` and `tls.key` from `cert_dir`
pub async fn serve(state: Arc<WebhookState>, addr: SocketAddr, cert_dir: &Path) -> Result<(), Error> {
    let tls = RustlsConfig::from_pem_file(cert_dir.join("tls.crt"), cert_dir.join("tls.key"))
        .await
        .map_err(|e| Error::internal(format!("failed to load webhook certificate: {e}")))?;

    info!(addr = %addr, cert_dir = %cert_dir.display(), "Starting webhook server");
    axum_server::bind_rustls(addr, tls)
        .serve(router(state).into_make_service())
        .await
        .map_err(|e| Error::internal(format!("webhook server error: {e}")))
}
