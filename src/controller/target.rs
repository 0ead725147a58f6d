//! RemoteTarget reconciler: `Ready` mirrors the merge-strategy invariant

use std::sync::Arc;

use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, instrument};

use crate::crd::{
    conditions, set_condition, Condition, ConditionStatus, RemoteTarget, RemoteTargetStatus,
};
use crate::Error;

use super::Context;

/// Reconcile a RemoteTarget
#[instrument(skip(target, ctx), fields(target = %target.name_any(), namespace = ?target.namespace()))]
pub async fn reconcile_target(target: Arc<RemoteTarget>, ctx: Arc<Context>) -> Result<Action, Error> {
    let condition = match target.spec.validate() {
        Ok(()) => Condition::new(
            conditions::READY,
            ConditionStatus::True,
            conditions::REASON_VALID,
            format!("commits land on {}", target.spec.target_branch),
        ),
        Err(e) => Condition::new(
            conditions::READY,
            ConditionStatus::False,
            conditions::REASON_INVALID_SPEC,
            e.to_string(),
        ),
    };

    let mut status: RemoteTargetStatus = target.status.clone().unwrap_or_default();
    if !set_condition(&mut status.conditions, condition) {
        debug!("RemoteTarget status unchanged");
        return Ok(Action::await_change());
    }
    ctx.status
        .patch_target_status(&target.namespace().unwrap_or_default(), &target.name_any(), &status)
        .await?;
    Ok(Action::await_change())
}
