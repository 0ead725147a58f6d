//! RemoteSyncer reconciler
//!
//! Keeps the webhook server and the cluster-wide webhook configuration in
//! step with each RemoteSyncer: a pipeline is registered at the syncer's
//! path, its webhook entry is merged into the shared configuration, target
//! patterns are applied, and `Ready` reports the outcome. The cleanup
//! finalizer takes the path and entry away before the object goes.

use std::sync::Arc;

use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use crate::crd::{conditions, set_condition, Condition, ConditionStatus, RemoteSyncer};
use crate::events::{actions, reasons};
use crate::pipeline::DecisionPipeline;
use crate::webhook::webhook_path;
use crate::{Error, SYNCER_FINALIZER};

use super::webhook_config::{build_webhook, remove_webhook, upsert_webhook, webhook_name};
use super::{target_pattern, Context};

/// Attempts at writing `Ready` against concurrent status writers
const STATUS_ATTEMPTS: u32 = 5;

/// Reconcile a RemoteSyncer
#[instrument(skip(syncer, ctx), fields(syncer = %syncer.name_any(), namespace = ?syncer.namespace()))]
pub async fn reconcile_syncer(syncer: Arc<RemoteSyncer>, ctx: Arc<Context>) -> Result<Action, Error> {
    if syncer.meta().deletion_timestamp.is_some() {
        return cleanup(&syncer, &ctx).await;
    }

    if !syncer.finalizers().iter().any(|f| f == SYNCER_FINALIZER) {
        ctx.syncers.add_finalizer(&syncer).await?;
        debug!("added cleanup finalizer");
    }

    let namespace = syncer.namespace().unwrap_or_default();
    let name = syncer.name_any();
    let path = webhook_path(&namespace, &name);

    let pipeline = Arc::new(DecisionPipeline::new(ctx.pipeline.clone(), (*syncer).clone()));
    if ctx.registry.register(&path, pipeline).await {
        info!(path = %path, "registered interception path");
    }

    let entry = build_webhook(&syncer, &ctx.settings);
    if let Err(e) = upsert_webhook(ctx.webhooks.as_ref(), &ctx.settings.config_name, &entry).await {
        warn!(error = %e, "failed to install webhook entry");
        publish(&ctx, &syncer, EventType::Warning, reasons::WEBHOOK_FAILED, e.to_string()).await;
        write_ready(
            &ctx,
            &syncer,
            ConditionStatus::False,
            conditions::REASON_WEBHOOK_FAILED,
            e.to_string(),
        )
        .await?;
        return Err(e);
    }

    match target_pattern::apply(&ctx, &syncer).await {
        Ok(count) => debug!(count, "target patterns applied"),
        Err(e) => {
            warn!(error = %e, "target pattern failed");
            publish(&ctx, &syncer, EventType::Warning, reasons::TARGET_PATTERN_FAILED, e.to_string())
                .await;
            write_ready(
                &ctx,
                &syncer,
                ConditionStatus::False,
                conditions::REASON_TARGET_PATTERN_FAILED,
                e.to_string(),
            )
            .await?;
            return Err(e);
        }
    }

    let changed = write_ready(
        &ctx,
        &syncer,
        ConditionStatus::True,
        conditions::REASON_WEBHOOK_INSTALLED,
        format!("intercepting at {path}"),
    )
    .await?;
    if changed {
        publish(
            &ctx,
            &syncer,
            EventType::Normal,
            reasons::WEBHOOK_INSTALLED,
            format!("webhook {} serves {path}", entry.name),
        )
        .await;
    }

    Ok(Action::await_change())
}

async fn cleanup(syncer: &RemoteSyncer, ctx: &Context) -> Result<Action, Error> {
    if !syncer.finalizers().iter().any(|f| f == SYNCER_FINALIZER) {
        return Ok(Action::await_change());
    }
    let namespace = syncer.namespace().unwrap_or_default();
    let name = syncer.name_any();
    let path = webhook_path(&namespace, &name);

    ctx.registry.unregister(&path).await;
    remove_webhook(
        ctx.webhooks.as_ref(),
        &ctx.settings.config_name,
        &webhook_name(&namespace, &name),
    )
    .await?;
    target_pattern::teardown(ctx, syncer).await?;
    publish(
        ctx,
        syncer,
        EventType::Normal,
        reasons::WEBHOOK_REMOVED,
        format!("stopped intercepting at {path}"),
    )
    .await;

    ctx.syncers.remove_finalizer(syncer).await?;
    info!(path = %path, "cleaned up RemoteSyncer");
    Ok(Action::await_change())
}

async fn publish(ctx: &Context, syncer: &RemoteSyncer, type_: EventType, reason: &str, note: String) {
    let action = if syncer.meta().deletion_timestamp.is_some() {
        actions::CLEANUP
    } else {
        actions::RECONCILE
    };
    ctx.events
        .publish(&syncer.object_ref(&()), type_, reason, action, Some(note))
        .await;
}

/// Merge `Ready` into the live status. Returns true when it changed.
///
/// The decision pipeline writes `Synced` on the same status, so this reads
/// the current object and replaces its status, retrying on conflicts.
async fn write_ready(
    ctx: &Context,
    syncer: &RemoteSyncer,
    status: ConditionStatus,
    reason: &str,
    message: String,
) -> Result<bool, Error> {
    let namespace = syncer.namespace().unwrap_or_default();
    let name = syncer.name_any();
    let condition = Condition::new(conditions::READY, status, reason, message);

    let mut attempt = 0;
    loop {
        attempt += 1;
        let Some(mut current) = ctx.syncers.get_syncer(&namespace, &name).await? else {
            return Ok(false);
        };
        let current_status = current.status.get_or_insert_with(Default::default);
        if !set_condition(&mut current_status.conditions, condition.clone()) {
            return Ok(false);
        }
        match ctx.syncers.replace_syncer_status(&current).await {
            Ok(()) => return Ok(true),
            Err(e) if e.is_conflict() && attempt < STATUS_ATTEMPTS => {
                debug!(attempt, "status conflict, retrying");
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::test_support::Mocks;
    use crate::crd::{
        find_condition, Operation, RemoteSyncerSpec, RemoteSyncerStatus, ScopedResources,
        ScopedRule,
    };
    use k8s_openapi::api::admissionregistration::v1::ValidatingWebhookConfiguration;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::core::ErrorResponse;
    use std::sync::Mutex;

    fn syncer(finalized: bool) -> RemoteSyncer {
        let mut s = RemoteSyncer::new(
            "configs",
            RemoteSyncerSpec {
                remote_repository: "https://git.example.com/a/b.git".into(),
                default_branch: "main".into(),
                scoped_resources: ScopedResources {
                    rules: vec![ScopedRule {
                        api_groups: vec!["".into()],
                        api_versions: vec!["v1".into()],
                        resources: vec!["configmaps".into()],
                        operations: vec![Operation::Create],
                    }],
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        s.metadata.namespace = Some("app".into());
        s.metadata.resource_version = Some("7".into());
        if finalized {
            s.metadata.finalizers = Some(vec![SYNCER_FINALIZER.to_string()]);
        }
        s
    }

    fn conflict() -> Error {
        Error::Kube(kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: "conflict".into(),
            reason: "Conflict".into(),
            code: 409,
        }))
    }

    fn quiet_patterns(mocks: &mut Mocks) {
        mocks.reader.expect_list_user_bindings().returning(|_| Ok(vec![]));
        mocks
            .targets
            .expect_list_generated_targets()
            .returning(|_, _| Ok(vec![]));
    }

    /// Story: a new syncer starts intercepting and reports Ready
    #[tokio::test]
    async fn story_syncer_becomes_ready() {
        let mut mocks = Mocks::default();
        mocks.syncers.expect_add_finalizer().times(1).returning(|_| Ok(()));
        mocks.webhooks.expect_get_config().returning(|_| Ok(None));
        mocks
            .webhooks
            .expect_create_config()
            .withf(|c| c.webhooks.as_ref().unwrap()[0].name == "configs.app.kommit.dev")
            .times(1)
            .returning(|_| Ok(()));
        quiet_patterns(&mut mocks);
        mocks
            .syncers
            .expect_get_syncer()
            .returning(|_, _| Ok(Some(syncer(true))));
        let written = Arc::new(Mutex::new(None));
        let seen = written.clone();
        mocks.syncers.expect_replace_syncer_status().times(1).returning(move |s| {
            *seen.lock().unwrap() = s.status.clone();
            Ok(())
        });
        let ctx = mocks.into_context();

        let action = reconcile_syncer(Arc::new(syncer(false)), ctx.clone()).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert!(ctx
            .registry
            .get("/kommit.dev/validate/app/configs")
            .await
            .is_some());

        let status: RemoteSyncerStatus = written.lock().unwrap().clone().unwrap();
        let ready = find_condition(&status.conditions, conditions::READY).unwrap();
        assert_eq!(ready.status, ConditionStatus::True);
        assert_eq!(ready.reason, conditions::REASON_WEBHOOK_INSTALLED);
    }

    #[tokio::test]
    async fn webhook_failure_reports_not_ready_and_errors() {
        let mut mocks = Mocks::default();
        mocks
            .webhooks
            .expect_get_config()
            .returning(|_| Err(Error::internal("apiserver down")));
        mocks
            .syncers
            .expect_get_syncer()
            .returning(|_, _| Ok(Some(syncer(true))));
        mocks
            .syncers
            .expect_replace_syncer_status()
            .withf(|s| {
                let conditions = &s.status.as_ref().unwrap().conditions;
                let ready = find_condition(conditions, conditions::READY).unwrap();
                ready.status == ConditionStatus::False
                    && ready.reason == conditions::REASON_WEBHOOK_FAILED
            })
            .times(1)
            .returning(|_| Ok(()));
        let ctx = mocks.into_context();

        assert!(reconcile_syncer(Arc::new(syncer(true)), ctx).await.is_err());
    }

    #[tokio::test]
    async fn ready_write_retries_status_conflicts() {
        let mut mocks = Mocks::default();
        mocks
            .syncers
            .expect_get_syncer()
            .times(2)
            .returning(|_, _| Ok(Some(syncer(true))));
        let mut calls = 0;
        mocks
            .syncers
            .expect_replace_syncer_status()
            .times(2)
            .returning(move |_| {
                calls += 1;
                if calls == 1 {
                    Err(conflict())
                } else {
                    Ok(())
                }
            });
        let ctx = mocks.into_context();

        let changed = write_ready(
            &ctx,
            &syncer(true),
            ConditionStatus::True,
            conditions::REASON_WEBHOOK_INSTALLED,
            "ok".into(),
        )
        .await
        .unwrap();
        assert!(changed);
    }

    /// Story: deleting a syncer stops interception before the object disappears
    #[tokio::test]
    async fn story_deletion_removes_path_and_entry() {
        let mut mocks = Mocks::default();
        mocks.webhooks.expect_get_config().returning(|_| {
            let mut config = ValidatingWebhookConfiguration::default();
            config.metadata.name = Some("kommit-remotesyncer-interceptor".into());
            config.webhooks = Some(vec![build_webhook(&syncer(true), &Default::default())]);
            Ok(Some(config))
        });
        mocks
            .webhooks
            .expect_replace_config()
            .withf(|c| c.webhooks.as_ref().is_some_and(Vec::is_empty))
            .times(1)
            .returning(|_| Ok(()));
        quiet_patterns(&mut mocks);
        mocks.syncers.expect_remove_finalizer().times(1).returning(|_| Ok(()));
        let ctx = mocks.into_context();

        let path = webhook_path("app", "configs");
        ctx.registry
            .register(
                &path,
                Arc::new(DecisionPipeline::new(ctx.pipeline.clone(), syncer(true))),
            )
            .await;

        let mut deleting = syncer(true);
        deleting.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        reconcile_syncer(Arc::new(deleting), ctx.clone()).await.unwrap();

        assert!(ctx.registry.get(&path).await.is_none());
    }
}
