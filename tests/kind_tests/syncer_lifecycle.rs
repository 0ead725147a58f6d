//! RemoteSyncer lifecycle tests
//!
//! Stories about the reconciler driving a real apiserver: the syncer's
//! webhook entry appears in the shared configuration, branch patterns turn
//! into RemoteTargets, and deleting the syncer takes both away again.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::admissionregistration::v1::ValidatingWebhookConfiguration;
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, PostParams};
use kube::{Client, ResourceExt};

use kommit::controller::target_pattern::ONE_OR_MANY_BRANCHES_ANNOTATION;
use kommit::controller::webhook_config::webhook_name;
use kommit::controller::{reconcile_syncer, Context, WebhookSettings};
use kommit::crd::{
    conditions, find_condition, ConditionStatus, Operation, RemoteSyncer, RemoteSyncerSpec, RemoteTarget,
    ScopedResources, ScopedRule,
};
use kommit::webhook::{webhook_path, PathRegistry};
use kommit::{SYNCER_FINALIZER, SYNCER_LABEL};

use super::helpers::{cleanup_namespace, ensure_namespace, ensure_test_cluster};

const NAMESPACE: &str = "kommit-story-lifecycle";
const CONFIG_NAME: &str = "kommit-integration-interceptor";

fn template_syncer(name: &str) -> RemoteSyncer {
    RemoteSyncer {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            annotations: Some(BTreeMap::from([(
                ONE_OR_MANY_BRANCHES_ANNOTATION.to_string(),
                "main, release/1.0".to_string(),
            )])),
            ..Default::default()
        },
        spec: RemoteSyncerSpec {
            remote_repository: "https://git.example.com/platform/app-config.git".to_string(),
            default_branch: "main".to_string(),
            scoped_resources: ScopedResources {
                rules: vec![ScopedRule {
                    api_groups: vec![String::new()],
                    api_versions: vec!["v1".to_string()],
                    // Fail-closed entry; nothing else in the namespace is a PodTemplate
                    resources: vec!["podtemplates".to_string()],
                    operations: vec![Operation::Create, Operation::Update],
                }],
                ..Default::default()
            },
            ..Default::default()
        },
        status: None,
    }
}

fn test_context(client: Client, registry: Arc<PathRegistry>) -> Arc<Context> {
    let settings = WebhookSettings {
        config_name: CONFIG_NAME.to_string(),
        ..Default::default()
    };
    let cache = std::env::temp_dir().join("kommit-integration-git-cache");
    Arc::new(
        Context::builder(client)
            .settings(settings)
            .git_cache_dir(cache)
            .registry(registry)
            .build(),
    )
}

/// Story: A platform engineer creates a RemoteSyncer and the operator wires it up
///
/// One reconcile should leave the syncer with the cleanup finalizer, a served
/// interception path, an entry in the shared webhook configuration, one
/// generated RemoteTarget per annotated branch and a `Ready=True` condition.
///
/// Deleting the syncer and reconciling again removes every one of those.
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_syncer_reconcile_installs_and_removes_interception() {
    let client = ensure_test_cluster().await.expect("cluster available");
    ensure_namespace(&client, NAMESPACE).await.expect("namespace");

    let registry = Arc::new(PathRegistry::new());
    let ctx = test_context(client.clone(), registry.clone());
    let syncers: Api<RemoteSyncer> = Api::namespaced(client.clone(), NAMESPACE);
    let targets: Api<RemoteTarget> = Api::namespaced(client.clone(), NAMESPACE);
    let configs: Api<ValidatingWebhookConfiguration> = Api::all(client.clone());

    // Chapter 1: create and reconcile
    let created = syncers
        .create(&PostParams::default(), &template_syncer("app-templates"))
        .await
        .expect("RemoteSyncer accepted");
    reconcile_syncer(Arc::new(created), ctx.clone())
        .await
        .expect("first reconcile succeeds");

    let reconciled = syncers.get("app-templates").await.expect("syncer readable");
    assert!(reconciled.finalizers().iter().any(|f| f == SYNCER_FINALIZER));
    let ready = reconciled
        .status
        .as_ref()
        .and_then(|s| find_condition(&s.conditions, conditions::READY))
        .expect("Ready condition written");
    assert_eq!(ready.status, ConditionStatus::True);

    let path = webhook_path(NAMESPACE, "app-templates");
    assert!(registry.get(&path).await.is_some(), "path is served");

    let entry = webhook_name(NAMESPACE, "app-templates");
    let config = configs.get(CONFIG_NAME).await.expect("configuration created");
    assert!(config
        .webhooks
        .unwrap_or_default()
        .iter()
        .any(|w| w.name == entry));

    let generated = targets
        .list(&ListParams::default().labels(&format!("{SYNCER_LABEL}=app-templates")))
        .await
        .expect("targets listable");
    let mut branches: Vec<_> = generated
        .items
        .iter()
        .map(|t| t.spec.target_branch.clone())
        .collect();
    branches.sort();
    assert_eq!(branches, vec!["main", "release/1.0"]);

    // Chapter 2: delete; the finalizer keeps the object until cleanup runs
    syncers
        .delete("app-templates", &DeleteParams::default())
        .await
        .expect("delete accepted");
    let terminating = syncers.get("app-templates").await.expect("held by finalizer");
    assert!(terminating.metadata.deletion_timestamp.is_some());
    reconcile_syncer(Arc::new(terminating), ctx.clone())
        .await
        .expect("cleanup reconcile succeeds");

    assert!(registry.get(&path).await.is_none(), "path withdrawn");
    let config = configs.get(CONFIG_NAME).await.expect("configuration kept");
    assert!(!config
        .webhooks
        .unwrap_or_default()
        .iter()
        .any(|w| w.name == entry));
    let remaining = targets
        .list(&ListParams::default().labels(&format!("{SYNCER_LABEL}=app-templates")))
        .await
        .expect("targets listable");
    assert!(remaining.items.is_empty(), "generated targets deleted");

    let _ = configs.delete(CONFIG_NAME, &DeleteParams::default()).await;
    cleanup_namespace(&client, NAMESPACE).await;
}
