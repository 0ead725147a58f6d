//! RemoteUser reconciler
//!
//! Reports whether the referenced Secret exists and is a basic-auth Secret,
//! and which Git username it carries.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Secret;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, info, instrument};

use crate::crd::{
    conditions, set_condition, Condition, ConditionStatus, RemoteUser, RemoteUserStatus,
    SecretBoundStatus,
};
use crate::identity::{secret_value, BASIC_AUTH_SECRET_TYPE};
use crate::Error;

use super::Context;

/// Recheck interval for users whose Secret is unusable
const UNBOUND_RECHECK: Duration = Duration::from_secs(300);

/// Classify a RemoteUser's Secret
pub fn secret_bound_status(secret: Option<&Secret>) -> SecretBoundStatus {
    match secret {
        None => SecretBoundStatus::SecretNotFound,
        Some(s) if s.type_.as_deref() != Some(BASIC_AUTH_SECRET_TYPE) => {
            SecretBoundStatus::SecretWrongType
        }
        Some(_) => SecretBoundStatus::SecretBound,
    }
}

fn desired_status(user: &RemoteUser, secret: Option<&Secret>) -> RemoteUserStatus {
    let bound = secret_bound_status(secret);
    let git_user = match bound {
        SecretBoundStatus::SecretBound => secret.and_then(|s| secret_value(s, "username")),
        _ => None,
    };
    let (status, message) = match bound {
        SecretBoundStatus::SecretBound => (
            ConditionStatus::True,
            format!("secret {} is bound", user.spec.secret_ref.name),
        ),
        SecretBoundStatus::SecretNotFound => (
            ConditionStatus::False,
            format!("secret {} not found", user.spec.secret_ref.name),
        ),
        SecretBoundStatus::SecretWrongType => (
            ConditionStatus::False,
            format!(
                "secret {} is not of type {BASIC_AUTH_SECRET_TYPE}",
                user.spec.secret_ref.name
            ),
        ),
    };

    let mut merged = user
        .status
        .as_ref()
        .map(|s| s.conditions.clone())
        .unwrap_or_default();
    set_condition(
        &mut merged,
        Condition::new(conditions::READY, status, bound.to_string(), message),
    );

    RemoteUserStatus {
        secret_bound_status: Some(bound),
        git_user,
        conditions: merged,
    }
}

/// Reconcile a RemoteUser
#[instrument(skip(user, ctx), fields(user = %user.name_any(), namespace = ?user.namespace()))]
pub async fn reconcile_user(user: Arc<RemoteUser>, ctx: Arc<Context>) -> Result<Action, Error> {
    let namespace = user.namespace().unwrap_or_default();
    let secret = ctx
        .reader
        .get_secret(&namespace, &user.spec.secret_ref.name)
        .await?;
    let status = desired_status(&user, secret.as_ref());

    if user.status.as_ref() != Some(&status) {
        ctx.status
            .patch_user_status(&namespace, &user.name_any(), &status)
            .await?;
        info!(secret_bound_status = ?status.secret_bound_status, "updated RemoteUser status");
    } else {
        debug!("RemoteUser status unchanged");
    }

    match status.secret_bound_status {
        Some(SecretBoundStatus::SecretBound) => Ok(Action::await_change()),
        _ => Ok(Action::requeue(UNBOUND_RECHECK)),
    }
}
