//! RemoteSyncer status bookkeeping for intercepted requests

use chrono::Utc;
use tracing::{debug, warn};

use crate::client::SyncerStore;
use crate::crd::{
    conditions, set_condition, BypassedObjectState, Condition, ConditionStatus,
    ObservedObjectState, PushedObjectState, RemoteSyncerStatus,
};
use crate::Error;

use super::AdmissionDecision;

/// Attempts at writing status before giving up on repeated conflicts
const STATUS_WRITE_ATTEMPTS: u32 = 5;

/// Fold the outcome of one request into a syncer status
pub fn record(status: &mut RemoteSyncerStatus, decision: &AdmissionDecision) {
    let now = Utc::now();
    status.last_observed_object_state = Some(ObservedObjectState {
        last_observed_object: decision.object.clone(),
        last_observed_time: now,
        last_observed_user: decision.username.clone(),
        operation: decision.operation.clone(),
    });

    if decision.bypass {
        status.last_bypassed_object_state = Some(BypassedObjectState {
            last_bypass_object: decision.object.clone(),
            last_bypass_time: now,
            last_bypass_user: decision.username.clone(),
        });
        return;
    }

    if !decision.process_pass {
        set_condition(
            &mut status.conditions,
            Condition::new(
                conditions::SYNCED,
                ConditionStatus::False,
                decision.reason,
                decision.message.clone(),
            ),
        );
        return;
    }

    if decision.dry_run {
        return;
    }

    if let (Some(push), Some(identity)) = (decision.pushes.last(), decision.identity.as_ref()) {
        status.last_pushed_object_state = Some(PushedObjectState {
            last_pushed_object: decision.object.clone(),
            last_pushed_time: now,
            last_pushed_git_user: identity.git_username.clone(),
            last_commit_hash: push.outcome.commit_hash.clone(),
            last_pushed_path: push.outcome.path.clone(),
        });
    }
    set_condition(
        &mut status.conditions,
        Condition::new(
            conditions::SYNCED,
            ConditionStatus::True,
            conditions::REASON_PUSHED,
            decision.message.clone(),
        ),
    );
}

/// Re-read the syncer and write `decision` into its status.
///
/// Retries on conflicts; a syncer deleted in the meantime is not an error.
pub async fn persist(
    store: &dyn SyncerStore,
    namespace: &str,
    name: &str,
    decision: &AdmissionDecision,
) -> Result<(), Error> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let Some(mut syncer) = store.get_syncer(namespace, name).await? else {
            debug!(syncer = %name, namespace = %namespace, "Syncer gone, skipping status update");
            return Ok(());
        };
        let status = syncer.status.get_or_insert_with(Default::default);
        record(status, decision);

        match store.replace_syncer_status(&syncer).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_conflict() && attempt < STATUS_WRITE_ATTEMPTS => {
                warn!(
                    syncer = %name,
                    namespace = %namespace,
                    attempt,
                    "Status conflict, retrying"
                );
            }
            Err(e) => return Err(e),
        }
    }
}
