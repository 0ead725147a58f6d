//! Schema version conversion between `v1beta1` and `v1beta2`
//!
//! `v1beta2` is the hub and storage version. Fields that only exist in the
//! hub are parked in annotations on the way down so that a
//! `v1beta2 → v1beta1 → v1beta2` trip loses nothing.

use std::collections::BTreeMap;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    CustomResourceConversion, CustomResourceDefinition, ServiceReference, WebhookClientConfig,
    WebhookConversion,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::ByteString;
use kube::core::conversion::{ConversionRequest, ConversionResponse, ConversionReview};
use kube::core::Status;
use serde_json::Value;
use tracing::{debug, warn};

use crate::crd::v1beta1::{self, LegacyMergeStrategy, ProcessMode};
use crate::crd::{
    LocalRef, MergeStrategy, RemoteSyncer, RemoteSyncerSpec, RemoteTarget, RemoteTargetSpec,
    RemoteUser, RemoteUserBinding, RemoteUserBindingSpec, RemoteUserSpec, Strategy,
    TargetStrategy,
};
use crate::controller::WebhookSettings;
use crate::webhook::CONVERT_PATH;
use crate::{Error, API_GROUP, ASSOCIATION_ANNOTATION};

/// Parked `spec.targetStrategy`
pub const TARGET_STRATEGY_ANNOTATION: &str = "kommit.dev/conversion.target-strategy";
/// Parked `spec.defaultRemoteTargetRef.name`
pub const DEFAULT_TARGET_ANNOTATION: &str = "kommit.dev/conversion.default-remote-target";
/// Parked `spec.remoteTargetSelector`, as JSON
pub const TARGET_SELECTOR_ANNOTATION: &str = "kommit.dev/conversion.remote-target-selector";
/// Parked `spec.remoteTargetRefs`, comma separated
pub const TARGET_REFS_ANNOTATION: &str = "kommit.dev/conversion.remote-target-refs";

fn api_version(version: &str) -> String {
    format!("{API_GROUP}/{version}")
}

fn take_annotation(meta: &mut ObjectMeta, key: &str) -> Option<String> {
    let annotations = meta.annotations.as_mut()?;
    let value = annotations.remove(key);
    if annotations.is_empty() {
        meta.annotations = None;
    }
    value
}

fn put_annotation(meta: &mut ObjectMeta, key: &str, value: String) {
    meta.annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(key.to_string(), value);
}

// =============================================================================
// RemoteSyncer
// =============================================================================

/// `v1beta1` RemoteSyncer to the hub
pub fn syncer_to_hub(legacy: v1beta1::RemoteSyncer) -> RemoteSyncer {
    let mut metadata = legacy.metadata;
    let spec = legacy.spec;

    let target_strategy = take_annotation(&mut metadata, TARGET_STRATEGY_ANNOTATION)
        .and_then(|s| match s.parse::<TargetStrategy>() {
            Ok(ts) => Some(ts),
            Err(e) => {
                warn!(error = %e, "Ignoring parked target strategy");
                None
            }
        })
        .unwrap_or_default();
    let default_remote_target_ref =
        take_annotation(&mut metadata, DEFAULT_TARGET_ANNOTATION).map(LocalRef::new);
    let remote_target_selector = take_annotation(&mut metadata, TARGET_SELECTOR_ANNOTATION)
        .and_then(|s| match serde_json::from_str::<LabelSelector>(&s) {
            Ok(selector) => Some(selector),
            Err(e) => {
                warn!(error = %e, "Ignoring parked target selector");
                None
            }
        });

    RemoteSyncer {
        metadata,
        spec: RemoteSyncerSpec {
            remote_repository: spec.remote_repository,
            default_branch: spec.default_branch,
            scoped_resources: spec.scoped_resources,
            strategy: match spec.process_mode {
                ProcessMode::CommitOnly => Strategy::CommitOnly,
                ProcessMode::CommitApply => Strategy::CommitApply,
            },
            target_strategy,
            remote_target_selector,
            root_path: spec.root_path,
            excluded_fields: spec.excluded_fields,
            excluded_fields_config_map_ref: spec.excluded_fields_config_map_ref,
            bypass_interception_subjects: spec.bypass_interception_subjects,
            default_unauthorized_user_mode: spec.default_unauthorized_user_mode,
            default_remote_user_ref: spec.default_remote_user_ref,
            default_remote_target_ref,
            insecure_skip_tls_verify: spec.insecure_skip_tls_verify,
            ca_bundle_secret_ref: spec.ca_bundle_secret_ref,
            default_blocked_message: spec.default_blocked_message,
        },
        status: legacy.status,
    }
}

/// Hub RemoteSyncer to `v1beta1`
pub fn syncer_from_hub(hub: RemoteSyncer) -> Result<v1beta1::RemoteSyncer, Error> {
    let mut metadata = hub.metadata;
    let spec = hub.spec;

    if spec.target_strategy != TargetStrategy::default() {
        put_annotation(
            &mut metadata,
            TARGET_STRATEGY_ANNOTATION,
            spec.target_strategy.to_string(),
        );
    }
    if let Some(target) = spec.default_remote_target_ref {
        put_annotation(&mut metadata, DEFAULT_TARGET_ANNOTATION, target.name);
    }
    if let Some(selector) = &spec.remote_target_selector {
        put_annotation(
            &mut metadata,
            TARGET_SELECTOR_ANNOTATION,
            serde_json::to_string(selector)?,
        );
    }

    Ok(v1beta1::RemoteSyncer {
        metadata,
        spec: v1beta1::RemoteSyncerSpec {
            remote_repository: spec.remote_repository,
            default_branch: spec.default_branch,
            scoped_resources: spec.scoped_resources,
            process_mode: match spec.strategy {
                Strategy::CommitOnly => ProcessMode::CommitOnly,
                Strategy::CommitApply => ProcessMode::CommitApply,
            },
            root_path: spec.root_path,
            excluded_fields: spec.excluded_fields,
            excluded_fields_config_map_ref: spec.excluded_fields_config_map_ref,
            bypass_interception_subjects: spec.bypass_interception_subjects,
            default_unauthorized_user_mode: spec.default_unauthorized_user_mode,
            default_remote_user_ref: spec.default_remote_user_ref,
            insecure_skip_tls_verify: spec.insecure_skip_tls_verify,
            ca_bundle_secret_ref: spec.ca_bundle_secret_ref,
            default_blocked_message: spec.default_blocked_message,
        },
        status: hub.status,
    })
}

// =============================================================================
// RemoteUser
// =============================================================================

/// `v1beta1` RemoteUser to the hub; the boolean becomes the association annotation
pub fn user_to_hub(legacy: v1beta1::RemoteUser) -> RemoteUser {
    let mut metadata = legacy.metadata;
    take_annotation(&mut metadata, ASSOCIATION_ANNOTATION);
    if legacy.spec.associated_remote_user_binding {
        put_annotation(&mut metadata, ASSOCIATION_ANNOTATION, "true".to_string());
    }
    RemoteUser {
        metadata,
        spec: RemoteUserSpec {
            email: legacy.spec.email,
            git_base_domain_fqdn: legacy.spec.git_base_domain_fqdn,
            secret_ref: legacy.spec.secret_ref,
        },
        status: legacy.status,
    }
}

/// Hub RemoteUser to `v1beta1`; anything but `"true"` reads as `false`
pub fn user_from_hub(hub: RemoteUser) -> v1beta1::RemoteUser {
    let associated = hub.wants_association();
    let mut metadata = hub.metadata;
    take_annotation(&mut metadata, ASSOCIATION_ANNOTATION);
    v1beta1::RemoteUser {
        metadata,
        spec: v1beta1::RemoteUserSpec {
            email: hub.spec.email,
            git_base_domain_fqdn: hub.spec.git_base_domain_fqdn,
            secret_ref: hub.spec.secret_ref,
            associated_remote_user_binding: associated,
        },
        status: hub.status,
    }
}

// =============================================================================
// RemoteUserBinding
// =============================================================================

/// `v1beta1` RemoteUserBinding to the hub
pub fn binding_to_hub(legacy: v1beta1::RemoteUserBinding) -> RemoteUserBinding {
    let mut metadata = legacy.metadata;
    let remote_target_refs = take_annotation(&mut metadata, TARGET_REFS_ANNOTATION)
        .map(|refs| {
            refs.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(LocalRef::new)
                .collect()
        })
        .unwrap_or_default();
    RemoteUserBinding {
        metadata,
        spec: RemoteUserBindingSpec {
            subject: legacy.spec.subject,
            remote_user_refs: legacy.spec.remote_refs,
            remote_target_refs,
        },
        status: legacy.status,
    }
}

/// Hub RemoteUserBinding to `v1beta1`
pub fn binding_from_hub(hub: RemoteUserBinding) -> v1beta1::RemoteUserBinding {
    let mut metadata = hub.metadata;
    if !hub.spec.remote_target_refs.is_empty() {
        let refs: Vec<&str> = hub
            .spec
            .remote_target_refs
            .iter()
            .map(|r| r.name.as_str())
            .collect();
        put_annotation(&mut metadata, TARGET_REFS_ANNOTATION, refs.join(","));
    }
    v1beta1::RemoteUserBinding {
        metadata,
        spec: v1beta1::RemoteUserBindingSpec {
            subject: hub.spec.subject,
            remote_refs: hub.spec.remote_user_refs,
        },
        status: hub.status,
    }
}

// =============================================================================
// RemoteTarget
// =============================================================================

fn merge_to_hub(legacy: LegacyMergeStrategy) -> MergeStrategy {
    match legacy {
        LegacyMergeStrategy::FastForwardOrDie => MergeStrategy::TryFastForwardOrDie,
        LegacyMergeStrategy::FastForwardOrReset => MergeStrategy::TryFastForwardOrHardReset,
        LegacyMergeStrategy::ResetOrDie => MergeStrategy::TryHardResetOrDie,
    }
}

fn merge_from_hub(hub: MergeStrategy) -> LegacyMergeStrategy {
    match hub {
        MergeStrategy::TryFastForwardOrDie => LegacyMergeStrategy::FastForwardOrDie,
        MergeStrategy::TryFastForwardOrHardReset => LegacyMergeStrategy::FastForwardOrReset,
        MergeStrategy::TryHardResetOrDie => LegacyMergeStrategy::ResetOrDie,
    }
}

/// `v1beta1` RemoteTarget to the hub
pub fn target_to_hub(legacy: v1beta1::RemoteTarget) -> RemoteTarget {
    RemoteTarget {
        metadata: legacy.metadata,
        spec: RemoteTargetSpec {
            upstream_repository: legacy.spec.upstream_repository,
            upstream_branch: legacy.spec.upstream_branch,
            target_repository: legacy.spec.target_repository,
            target_branch: legacy.spec.target_branch,
            merge_strategy: legacy.spec.merge_strategy.map(merge_to_hub),
        },
        status: legacy.status,
    }
}

/// Hub RemoteTarget to `v1beta1`
pub fn target_from_hub(hub: RemoteTarget) -> v1beta1::RemoteTarget {
    v1beta1::RemoteTarget {
        metadata: hub.metadata,
        spec: v1beta1::RemoteTargetSpec {
            upstream_repository: hub.spec.upstream_repository,
            upstream_branch: hub.spec.upstream_branch,
            target_repository: hub.spec.target_repository,
            target_branch: hub.spec.target_branch,
            merge_strategy: hub.spec.merge_strategy.map(merge_from_hub),
        },
        status: hub.status,
    }
}

// =============================================================================
// Dispatch
// =============================================================================

/// Convert one raw object to `desired_api_version`
pub fn convert(object: Value, desired_api_version: &str) -> Result<Value, Error> {
    let current = object
        .get("apiVersion")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::validation("object has no apiVersion"))?
        .to_string();
    if current == desired_api_version {
        return Ok(object);
    }
    let kind = object
        .get("kind")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::validation("object has no kind"))?
        .to_string();

    let hub = api_version(crate::crd::HUB_VERSION);
    let legacy = api_version("v1beta1");
    let up = current == legacy && desired_api_version == hub;
    let down = current == hub && desired_api_version == legacy;
    if !up && !down {
        return Err(Error::validation(format!(
            "cannot convert {kind} from {current} to {desired_api_version}"
        )));
    }

    let converted = match (kind.as_str(), up) {
        ("RemoteSyncer", true) => serde_json::to_value(syncer_to_hub(serde_json::from_value(object)?))?,
        ("RemoteSyncer", false) => {
            serde_json::to_value(syncer_from_hub(serde_json::from_value(object)?)?)?
        }
        ("RemoteUser", true) => serde_json::to_value(user_to_hub(serde_json::from_value(object)?))?,
        ("RemoteUser", false) => serde_json::to_value(user_from_hub(serde_json::from_value(object)?))?,
        ("RemoteUserBinding", true) => {
            serde_json::to_value(binding_to_hub(serde_json::from_value(object)?))?
        }
        ("RemoteUserBinding", false) => {
            serde_json::to_value(binding_from_hub(serde_json::from_value(object)?))?
        }
        ("RemoteTarget", true) => serde_json::to_value(target_to_hub(serde_json::from_value(object)?))?,
        ("RemoteTarget", false) => {
            serde_json::to_value(target_from_hub(serde_json::from_value(object)?))?
        }
        _ => return Err(Error::validation(format!("unknown kind {kind}"))),
    };
    debug!(kind = %kind, from = %current, to = %desired_api_version, "Converted object");
    Ok(converted)
}

/// Answer a ConversionReview. Any object failing fails the whole review.
pub fn review(review: ConversionReview) -> ConversionReview {
    let mut request = match ConversionRequest::from_review(review) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "Malformed ConversionReview");
            return ConversionResponse::invalid(Status::failure(&e.to_string(), "InvalidRequest"))
                .into_review();
        }
    };

    let objects = std::mem::take(&mut request.objects);
    let desired = request.desired_api_version.clone();
    let converted: Result<Vec<Value>, Error> = objects
        .into_iter()
        .map(|object| convert(object, &desired))
        .collect();

    let response = ConversionResponse::for_request(request);
    let response = match converted {
        Ok(objects) => response.success(objects),
        Err(e) => {
            warn!(desired = %desired, error = %e, "Conversion failed");
            response.failure(Status::failure(&e.to_string(), "ConversionFailed"))
        }
    };
    response.into_review()
}

/// Point a merged CRD's conversion at the webhook server
pub fn with_conversion_webhook(
    mut crd: CustomResourceDefinition,
    settings: &WebhookSettings,
) -> CustomResourceDefinition {
    let ca_bundle = settings.ca_bundle.clone().map(ByteString);
    let client_config = if settings.dev_mode {
        WebhookClientConfig {
            url: Some(format!(
                "https://{}:{}{CONVERT_PATH}",
                settings.dev_host, settings.port
            )),
            ca_bundle,
            ..Default::default()
        }
    } else {
        WebhookClientConfig {
            service: Some(ServiceReference {
                name: settings.service_name.clone(),
                namespace: settings.service_namespace.clone(),
                path: Some(CONVERT_PATH.to_string()),
                port: Some(443),
            }),
            ca_bundle,
            ..Default::default()
        }
    };
    crd.spec.conversion = Some(CustomResourceConversion {
        strategy: "Webhook".to_string(),
        webhook: Some(WebhookConversion {
            client_config: Some(client_config),
            conversion_review_versions: vec!["v1".to_string()],
        }),
    });
    crd
}
