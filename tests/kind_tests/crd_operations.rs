//! CRD operation tests
//!
//! Stories about a platform team declaring Git interception through the
//! Kubernetes API: the schemas accept the documented shapes, defaults are
//! applied, and status lives on its own subresource.

use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};

use kommit::crd::{
    LocalRef, MergeStrategy, Operation, RemoteSyncer, RemoteSyncerSpec, RemoteTarget, RemoteTargetSpec,
    RemoteUser, RemoteUserBinding, RemoteUserBindingSpec, RemoteUserSpec, RemoteUserStatus,
    ScopedResources, ScopedRule, SecretBoundStatus, Strategy, Subject, TargetStrategy,
    UnauthorizedUserMode,
};

use super::helpers::{cleanup_namespace, ensure_namespace, ensure_test_cluster};

fn meta(namespace: &str, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        ..Default::default()
    }
}

fn configmap_syncer(namespace: &str, name: &str) -> RemoteSyncer {
    RemoteSyncer {
        metadata: meta(namespace, name),
        spec: RemoteSyncerSpec {
            remote_repository: "https://git.example.com/platform/app-config.git".to_string(),
            default_branch: "main".to_string(),
            root_path: "clusters/dev".to_string(),
            scoped_resources: ScopedResources {
                rules: vec![ScopedRule {
                    api_groups: vec![String::new()],
                    api_versions: vec!["v1".to_string()],
                    resources: vec!["configmaps".to_string()],
                    operations: vec![
                        Operation::Create,
                        Operation::Update,
                        Operation::Delete,
                    ],
                }],
                ..Default::default()
            },
            excluded_fields: vec!["metadata.managedFields".to_string()],
            ..Default::default()
        },
        status: None,
    }
}

/// Story: A platform engineer declares which ConfigMaps get committed to Git
///
/// The RemoteSyncer is stored at v1beta2 and read back unchanged. Fields the
/// engineer left out fall back to their documented defaults.
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_platform_engineer_declares_a_remote_syncer() {
    const NAMESPACE: &str = "kommit-story-syncer";
    let client = ensure_test_cluster().await.expect("cluster available");
    ensure_namespace(&client, NAMESPACE).await.expect("namespace");
    let api: Api<RemoteSyncer> = Api::namespaced(client.clone(), NAMESPACE);

    let created = api
        .create(&PostParams::default(), &configmap_syncer(NAMESPACE, "app-configmaps"))
        .await
        .expect("RemoteSyncer accepted");
    assert_eq!(created.spec.default_branch, "main");

    let fetched = api.get("app-configmaps").await.expect("RemoteSyncer readable");
    assert_eq!(fetched.spec.strategy, Strategy::CommitOnly);
    assert_eq!(fetched.spec.target_strategy, TargetStrategy::OneTarget);
    assert_eq!(
        fetched.spec.default_unauthorized_user_mode,
        UnauthorizedUserMode::Block
    );
    assert_eq!(fetched.spec.scoped_resources.rules.len(), 1);
    assert_eq!(fetched.spec.excluded_fields, vec!["metadata.managedFields"]);

    cleanup_namespace(&client, NAMESPACE).await;
}

/// Story: A developer registers a Git identity and binds it to themselves
///
/// The RemoteUser and RemoteUserBinding round-trip through the apiserver, and
/// the controller-owned status is written through the status subresource
/// without touching the spec.
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_developer_binds_a_git_identity() {
    const NAMESPACE: &str = "kommit-story-identity";
    let client = ensure_test_cluster().await.expect("cluster available");
    ensure_namespace(&client, NAMESPACE).await.expect("namespace");

    let users: Api<RemoteUser> = Api::namespaced(client.clone(), NAMESPACE);
    let user = RemoteUser {
        metadata: meta(NAMESPACE, "alice-gitea"),
        spec: RemoteUserSpec {
            email: "alice@example.com".to_string(),
            git_base_domain_fqdn: "git.example.com".to_string(),
            secret_ref: LocalRef::new("alice-pat"),
        },
        status: None,
    };
    users
        .create(&PostParams::default(), &user)
        .await
        .expect("RemoteUser accepted");

    let status = serde_json::json!({
        "status": RemoteUserStatus {
            secret_bound_status: Some(SecretBoundStatus::SecretNotFound),
            ..Default::default()
        }
    });
    users
        .patch_status(
            "alice-gitea",
            &PatchParams::default(),
            &Patch::Merge(&status),
        )
        .await
        .expect("status subresource writable");

    let fetched = users.get("alice-gitea").await.expect("RemoteUser readable");
    assert_eq!(fetched.spec.git_base_domain_fqdn, "git.example.com");
    assert_eq!(
        fetched.status.and_then(|s| s.secret_bound_status),
        Some(SecretBoundStatus::SecretNotFound)
    );

    let bindings: Api<RemoteUserBinding> = Api::namespaced(client.clone(), NAMESPACE);
    let binding = RemoteUserBinding {
        metadata: meta(NAMESPACE, "alice"),
        spec: RemoteUserBindingSpec {
            subject: Subject::user("alice"),
            remote_user_refs: vec![LocalRef::new("alice-gitea")],
            remote_target_refs: vec![LocalRef::new("app-config-main")],
        },
        status: None,
    };
    bindings
        .create(&PostParams::default(), &binding)
        .await
        .expect("RemoteUserBinding accepted");

    let fetched = bindings.get("alice").await.expect("binding readable");
    assert!(fetched.references_user("alice-gitea"));
    assert!(fetched.references_target("app-config-main"));

    cleanup_namespace(&client, NAMESPACE).await;
}

/// Story: A release manager routes commits to a staging branch
///
/// A RemoteTarget whose branch differs from upstream carries its merge
/// strategy through the apiserver.
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_release_manager_declares_a_branch_target() {
    const NAMESPACE: &str = "kommit-story-target";
    let client = ensure_test_cluster().await.expect("cluster available");
    ensure_namespace(&client, NAMESPACE).await.expect("namespace");
    let api: Api<RemoteTarget> = Api::namespaced(client.clone(), NAMESPACE);

    let target = RemoteTarget {
        metadata: meta(NAMESPACE, "app-config-staging"),
        spec: RemoteTargetSpec {
            upstream_repository: "https://git.example.com/platform/app-config.git".to_string(),
            upstream_branch: "main".to_string(),
            target_repository: "https://git.example.com/platform/app-config.git".to_string(),
            target_branch: "staging".to_string(),
            merge_strategy: Some(MergeStrategy::TryFastForwardOrHardReset),
        },
        status: None,
    };
    api.create(&PostParams::default(), &target)
        .await
        .expect("RemoteTarget accepted");

    let fetched = api.get("app-config-staging").await.expect("target readable");
    assert!(!fetched.spec.is_same_branch());
    assert!(fetched.spec.validate().is_ok());
    assert_eq!(
        fetched.spec.merge_strategy,
        Some(MergeStrategy::TryFastForwardOrHardReset)
    );

    cleanup_namespace(&client, NAMESPACE).await;
}
