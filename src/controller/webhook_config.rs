//! Cluster-wide ValidatingWebhookConfiguration shared by all RemoteSyncers
//!
//! Every syncer owns exactly one webhook entry, named
//! `<syncer>.<namespace>.kommit.dev`, inside a single configuration object.
//! Entries are merged in with a get/replace loop so concurrent reconciles of
//! different syncers never drop each other's entries.

use async_trait::async_trait;
use k8s_openapi::api::admissionregistration::v1::{
    RuleWithOperations, ServiceReference, ValidatingWebhook, ValidatingWebhookConfiguration,
    WebhookClientConfig,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use k8s_openapi::ByteString;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::ResourceExt;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::client::KubeClientImpl;
use crate::crd::RemoteSyncer;
use crate::webhook::{
    webhook_path, ASSOCIATE_USER_PATH, VALIDATE_BINDING_PATH, VALIDATE_SYNCER_PATH,
    VALIDATE_USER_PATH,
};
use crate::{Error, API_GROUP, MANAGED_BY_KOMMIT, MANAGED_BY_LABEL, WEBHOOK_TIMEOUT_SECONDS};

/// Attempts at merging an entry before giving up on repeated conflicts
const MERGE_ATTEMPTS: u32 = 5;

/// Namespace label every namespace carries with its own name
const NAMESPACE_NAME_LABEL: &str = "kubernetes.io/metadata.name";

/// Where the apiserver reaches the webhook server
#[derive(Clone, Debug, PartialEq)]
pub struct WebhookSettings {
    /// Name of the shared ValidatingWebhookConfiguration
    pub config_name: String,
    /// Namespace of the webhook Service
    pub service_namespace: String,
    /// Name of the webhook Service
    pub service_name: String,
    /// Call `https://<dev_host>:<port>` instead of the Service
    pub dev_mode: bool,
    /// Host the apiserver uses in dev mode
    pub dev_host: String,
    /// Port the webhook server listens on
    pub port: u16,
    /// PEM CA bundle the apiserver verifies the server with
    pub ca_bundle: Option<Vec<u8>>,
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            config_name: "kommit-remotesyncer-interceptor".to_string(),
            service_namespace: "kommit-system".to_string(),
            service_name: "kommit-webhook-service".to_string(),
            dev_mode: false,
            dev_host: "host.docker.internal".to_string(),
            port: crate::DEFAULT_WEBHOOK_PORT,
            ca_bundle: None,
        }
    }
}

/// Reads and writes the shared ValidatingWebhookConfiguration
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WebhookConfigStore: Send + Sync {
    /// Fetch the configuration, `None` when absent
    async fn get_config(&self, name: &str) -> Result<Option<ValidatingWebhookConfiguration>, Error>;
    /// Create the configuration
    async fn create_config(&self, config: &ValidatingWebhookConfiguration) -> Result<(), Error>;
    /// Replace the configuration; fails with a conflict on a stale resourceVersion
    async fn replace_config(&self, config: &ValidatingWebhookConfiguration) -> Result<(), Error>;
}

#[async_trait]
impl WebhookConfigStore for KubeClientImpl {
    async fn get_config(&self, name: &str) -> Result<Option<ValidatingWebhookConfiguration>, Error> {
        let api: Api<ValidatingWebhookConfiguration> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn create_config(&self, config: &ValidatingWebhookConfiguration) -> Result<(), Error> {
        let api: Api<ValidatingWebhookConfiguration> = Api::all(self.client.clone());
        api.create(&PostParams::default(), config).await?;
        Ok(())
    }

    async fn replace_config(&self, config: &ValidatingWebhookConfiguration) -> Result<(), Error> {
        let api: Api<ValidatingWebhookConfiguration> = Api::all(self.client.clone());
        api.replace(&config.name_any(), &PostParams::default(), config)
            .await?;
        Ok(())
    }
}

/// Name of a syncer's webhook entry
pub fn webhook_name(namespace: &str, syncer: &str) -> String {
    format!("{syncer}.{namespace}.{API_GROUP}")
}

/// Service reference, or in dev mode a URL, for `path`
fn client_config(settings: &WebhookSettings, path: &str) -> WebhookClientConfig {
    let ca_bundle = settings.ca_bundle.clone().map(ByteString);
    if settings.dev_mode {
        WebhookClientConfig {
            url: Some(format!(
                "https://{}:{}{path}",
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
                path: Some(path.to_string()),
                port: Some(443),
            }),
            ca_bundle,
            ..Default::default()
        }
    }
}

/// Build the webhook entry intercepting `syncer`'s scoped resources
pub fn build_webhook(syncer: &RemoteSyncer, settings: &WebhookSettings) -> ValidatingWebhook {
    let namespace = syncer.namespace().unwrap_or_default();
    let name = syncer.name_any();
    let path = webhook_path(&namespace, &name);
    let scoped = &syncer.spec.scoped_resources;

    let rules = scoped
        .rules
        .iter()
        .map(|rule| RuleWithOperations {
            api_groups: Some(rule.api_groups.clone()),
            api_versions: Some(rule.api_versions.clone()),
            resources: Some(rule.resources.clone()),
            operations: Some(
                rule.operations
                    .iter()
                    .map(|op| op.as_str().to_string())
                    .collect(),
            ),
            scope: Some("Namespaced".to_string()),
        })
        .collect();

    ValidatingWebhook {
        name: webhook_name(&namespace, &name),
        admission_review_versions: vec!["v1".to_string()],
        side_effects: "None".to_string(),
        failure_policy: Some("Fail".to_string()),
        timeout_seconds: Some(WEBHOOK_TIMEOUT_SECONDS),
        match_policy: Some(
            scoped
                .match_policy
                .map_or("Equivalent", |p| p.as_str())
                .to_string(),
        ),
        rules: Some(rules),
        namespace_selector: Some(LabelSelector {
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: NAMESPACE_NAME_LABEL.to_string(),
                operator: "In".to_string(),
                values: Some(vec![namespace]),
            }]),
            ..Default::default()
        }),
        object_selector: Some(scoped.object_selector.clone().unwrap_or_default()),
        client_config: client_config(settings, &path),
        ..Default::default()
    }
}

/// `webhook` with the fields the apiserver defaults on admission filled in
fn with_server_defaults(webhook: &ValidatingWebhook) -> ValidatingWebhook {
    let mut w = webhook.clone();
    w.failure_policy.get_or_insert_with(|| "Fail".to_string());
    w.match_policy.get_or_insert_with(|| "Equivalent".to_string());
    w.timeout_seconds.get_or_insert(10);
    w.namespace_selector.get_or_insert_with(LabelSelector::default);
    w.object_selector.get_or_insert_with(LabelSelector::default);
    for rule in w.rules.iter_mut().flatten() {
        rule.scope.get_or_insert_with(|| "*".to_string());
    }
    if let Some(service) = w.client_config.service.as_mut() {
        service.port.get_or_insert(443);
    }
    w
}

/// Whether the server's copy of an entry already says what `desired` says
fn same_entry(current: &ValidatingWebhook, desired: &ValidatingWebhook) -> bool {
    with_server_defaults(current) == with_server_defaults(desired)
}

/// Entries of `config` with `entry` put in place of its namesake
fn merged(mut config: ValidatingWebhookConfiguration, entry: &ValidatingWebhook) -> ValidatingWebhookConfiguration {
    let webhooks = config.webhooks.get_or_insert_with(Vec::new);
    match webhooks.iter_mut().find(|w| w.name == entry.name) {
        Some(existing) => *existing = entry.clone(),
        None => webhooks.push(entry.clone()),
    }
    config
}

/// Install or refresh one entry, creating the configuration if needed
pub async fn upsert_webhook(
    store: &dyn WebhookConfigStore,
    config_name: &str,
    entry: &ValidatingWebhook,
) -> Result<(), Error> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = match store.get_config(config_name).await? {
            Some(current) => {
                let unchanged = current
                    .webhooks
                    .as_ref()
                    .and_then(|ws| ws.iter().find(|w| w.name == entry.name))
                    .is_some_and(|w| same_entry(w, entry));
                if unchanged {
                    debug!(webhook = %entry.name, "Webhook entry up to date");
                    return Ok(());
                }
                store.replace_config(&merged(current, entry)).await
            }
            None => {
                let config = ValidatingWebhookConfiguration {
                    metadata: ObjectMeta {
                        name: Some(config_name.to_string()),
                        labels: Some(
                            [(MANAGED_BY_LABEL.to_string(), MANAGED_BY_KOMMIT.to_string())]
                                .into_iter()
                                .collect(),
                        ),
                        ..Default::default()
                    },
                    webhooks: Some(vec![entry.clone()]),
                };
                store.create_config(&config).await
            }
        };

        match result {
            Ok(()) => {
                info!(webhook = %entry.name, config = %config_name, "Installed webhook entry");
                return Ok(());
            }
            // 409 covers both a stale replace and a racing create
            Err(e) if e.is_conflict() && attempt < MERGE_ATTEMPTS => {
                warn!(webhook = %entry.name, attempt, "Webhook configuration conflict, retrying");
            }
            Err(e) => return Err(e),
        }
    }
}

/// Remove one entry; a missing configuration or entry is not an error
pub async fn remove_webhook(
    store: &dyn WebhookConfigStore,
    config_name: &str,
    entry_name: &str,
) -> Result<(), Error> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let Some(mut config) = store.get_config(config_name).await? else {
            return Ok(());
        };
        let webhooks = config.webhooks.get_or_insert_with(Vec::new);
        let before = webhooks.len();
        webhooks.retain(|w| w.name != entry_name);
        if webhooks.len() == before {
            return Ok(());
        }

        match store.replace_config(&config).await {
            Ok(()) => {
                info!(webhook = %entry_name, config = %config_name, "Removed webhook entry");
                return Ok(());
            }
            Err(e) if e.is_conflict() && attempt < MERGE_ATTEMPTS => {
                warn!(webhook = %entry_name, attempt, "Webhook configuration conflict, retrying");
            }
            Err(e) => return Err(e),
        }
    }
}

/// Name of the configuration holding kommit's own CRD validators
pub const CONFIGURATION_WEBHOOKS_NAME: &str = "kommit-configuration-validator";

fn crd_rule(resource: &str, operations: &[&str]) -> RuleWithOperations {
    RuleWithOperations {
        api_groups: Some(vec![API_GROUP.to_string()]),
        api_versions: Some(vec!["*".to_string()]),
        resources: Some(vec![resource.to_string()]),
        operations: Some(operations.iter().map(|o| o.to_string()).collect()),
        scope: Some("Namespaced".to_string()),
    }
}

/// Webhooks validating kommit's own CRDs, applied once at startup
pub fn build_configuration_webhooks(settings: &WebhookSettings) -> ValidatingWebhookConfiguration {
    let entry = |name: &str, path: &str, rule: RuleWithOperations, failure_policy: &str| {
        ValidatingWebhook {
            name: format!("{name}.{API_GROUP}"),
            admission_review_versions: vec!["v1".to_string()],
            side_effects: if failure_policy == "Ignore" {
                "NoneOnDryRun".to_string()
            } else {
                "None".to_string()
            },
            failure_policy: Some(failure_policy.to_string()),
            match_policy: Some("Equivalent".to_string()),
            timeout_seconds: Some(10),
            rules: Some(vec![rule]),
            client_config: client_config(settings, path),
            ..Default::default()
        }
    };

    ValidatingWebhookConfiguration {
        metadata: ObjectMeta {
            name: Some(CONFIGURATION_WEBHOOKS_NAME.to_string()),
            labels: Some(
                [(MANAGED_BY_LABEL.to_string(), MANAGED_BY_KOMMIT.to_string())]
                    .into_iter()
                    .collect(),
            ),
            ..Default::default()
        },
        webhooks: Some(vec![
            entry(
                "vremotesyncer",
                VALIDATE_SYNCER_PATH,
                crd_rule("remotesyncers", &["CREATE", "UPDATE"]),
                "Fail",
            ),
            entry(
                "vremoteuser",
                VALIDATE_USER_PATH,
                crd_rule("remoteusers", &["CREATE", "UPDATE"]),
                "Fail",
            ),
            entry(
                "vremoteuserbinding",
                VALIDATE_BINDING_PATH,
                crd_rule("remoteuserbindings", &["CREATE", "UPDATE"]),
                "Fail",
            ),
            entry(
                "aremoteuser",
                ASSOCIATE_USER_PATH,
                crd_rule("remoteusers", &["CREATE", "UPDATE", "DELETE"]),
                "Ignore",
            ),
        ]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{MatchPolicy, Operation, RemoteSyncerSpec, ScopedResources, ScopedRule};
    use kube::core::ErrorResponse;
    use std::sync::{Arc, Mutex};

    fn syncer() -> RemoteSyncer {
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
                        operations: vec![Operation::Create, Operation::Delete],
                    }],
                    match_policy: Some(MatchPolicy::Exact),
                    object_selector: None,
                },
                ..Default::default()
            },
        );
        s.metadata.namespace = Some("app".into());
        s
    }

    fn entry(name: &str) -> ValidatingWebhook {
        ValidatingWebhook {
            name: name.to_string(),
            side_effects: "None".into(),
            ..Default::default()
        }
    }

    fn config(entries: &[&str]) -> ValidatingWebhookConfiguration {
        ValidatingWebhookConfiguration {
            metadata: ObjectMeta {
                name: Some("kommit-remotesyncer-interceptor".into()),
                resource_version: Some("1".into()),
                ..Default::default()
            },
            webhooks: Some(entries.iter().map(|n| entry(n)).collect()),
        }
    }

    fn conflict() -> Error {
        Error::Kube(kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: "conflict".into(),
            reason: "Conflict".into(),
            code: 409,
        }))
    }

    #[test]
    fn entry_targets_the_syncer_path_through_the_service() {
        let settings = WebhookSettings {
            ca_bundle: Some(b"PEM".to_vec()),
            ..Default::default()
        };
        let w = build_webhook(&syncer(), &settings);

        assert_eq!(w.name, "configs.app.kommit.dev");
        assert_eq!(w.side_effects, "None");
        assert_eq!(w.failure_policy.as_deref(), Some("Fail"));
        assert_eq!(w.timeout_seconds, Some(30));
        assert_eq!(w.match_policy.as_deref(), Some("Exact"));
        assert_eq!(w.admission_review_versions, vec!["v1"]);

        let service = w.client_config.service.unwrap();
        assert_eq!(service.name, "kommit-webhook-service");
        assert_eq!(service.namespace, "kommit-system");
        assert_eq!(service.path.as_deref(), Some("/kommit.dev/validate/app/configs"));
        assert_eq!(service.port, Some(443));
        assert_eq!(w.client_config.ca_bundle, Some(ByteString(b"PEM".to_vec())));

        let rule = &w.rules.unwrap()[0];
        assert_eq!(
            rule.operations,
            Some(vec!["CREATE".to_string(), "DELETE".to_string()])
        );
        let ns = &w.namespace_selector.unwrap().match_expressions.unwrap()[0];
        assert_eq!(ns.key, "kubernetes.io/metadata.name");
        assert_eq!(ns.values, Some(vec!["app".to_string()]));
    }

    #[test]
    fn dev_mode_uses_a_url() {
        let settings = WebhookSettings {
            dev_mode: true,
            dev_host: "10.0.0.5".into(),
            port: 9443,
            ..Default::default()
        };
        let w = build_webhook(&syncer(), &settings);
        assert!(w.client_config.service.is_none());
        assert_eq!(
            w.client_config.url.as_deref(),
            Some("https://10.0.0.5:9443/kommit.dev/validate/app/configs")
        );
    }

    #[tokio::test]
    async fn absent_configuration_is_created() {
        let mut store = MockWebhookConfigStore::new();
        store.expect_get_config().returning(|_| Ok(None));
        store
            .expect_create_config()
            .withf(|c| c.webhooks.as_ref().map(Vec::len) == Some(1))
            .times(1)
            .returning(|_| Ok(()));

        upsert_webhook(&store, "kommit-remotesyncer-interceptor", &entry("a.app.kommit.dev"))
            .await
            .unwrap();
    }

    /// Story: two syncers reconciling at once both end up installed
    #[tokio::test]
    async fn story_merge_keeps_other_entries_and_retries_conflicts() {
        let replaced = Arc::new(Mutex::new(Vec::new()));
        let seen = replaced.clone();
        let mut store = MockWebhookConfigStore::new();
        let reads = Arc::new(Mutex::new(0));
        store.expect_get_config().returning(move |_| {
            let mut n = reads.lock().unwrap();
            *n += 1;
            // The second read sees the entry another reconciler added meanwhile
            Ok(Some(if *n == 1 {
                config(&["a.app.kommit.dev"])
            } else {
                config(&["a.app.kommit.dev", "b.app.kommit.dev"])
            }))
        });
        let mut writes = 0;
        store.expect_replace_config().returning(move |c| {
            writes += 1;
            if writes == 1 {
                return Err(conflict());
            }
            seen.lock().unwrap().push(c.clone());
            Ok(())
        });

        upsert_webhook(&store, "kommit-remotesyncer-interceptor", &entry("c.app.kommit.dev"))
            .await
            .unwrap();

        let written = replaced.lock().unwrap();
        let names: Vec<_> = written[0]
            .webhooks
            .as_ref()
            .unwrap()
            .iter()
            .map(|w| w.name.as_str())
            .collect();
        assert_eq!(names, vec!["a.app.kommit.dev", "b.app.kommit.dev", "c.app.kommit.dev"]);
    }

    #[tokio::test]
    async fn unchanged_entry_is_not_rewritten() {
        let mut store = MockWebhookConfigStore::new();
        store
            .expect_get_config()
            .returning(|_| Ok(Some(config(&["a.app.kommit.dev"]))));
        store.expect_replace_config().never();

        upsert_webhook(&store, "kommit-remotesyncer-interceptor", &entry("a.app.kommit.dev"))
            .await
            .unwrap();
    }

    /// Story: a steady-state reconcile leaves the configuration alone
    ///
    /// The apiserver hands back the entry with its defaults filled in; that
    /// copy still counts as current.
    #[tokio::test]
    async fn story_server_defaulted_entry_is_not_rewritten() {
        let mut s = syncer();
        s.spec.scoped_resources.match_policy = None;
        let built = build_webhook(&s, &WebhookSettings::default());

        let mut served = built.clone();
        served.match_policy = Some("Equivalent".into());
        served.object_selector = Some(LabelSelector::default());
        for rule in served.rules.iter_mut().flatten() {
            rule.scope = Some("Namespaced".into());
        }
        let stored = ValidatingWebhookConfiguration {
            metadata: ObjectMeta {
                name: Some("kommit-remotesyncer-interceptor".into()),
                resource_version: Some("7".into()),
                ..Default::default()
            },
            webhooks: Some(vec![served]),
        };

        let mut store = MockWebhookConfigStore::new();
        store
            .expect_get_config()
            .returning(move |_| Ok(Some(stored.clone())));
        store.expect_replace_config().never();

        upsert_webhook(&store, "kommit-remotesyncer-interceptor", &built)
            .await
            .unwrap();
    }

    #[test]
    fn unset_policy_and_selector_are_written_explicitly() {
        let mut s = syncer();
        s.spec.scoped_resources.match_policy = None;
        let w = build_webhook(&s, &WebhookSettings::default());
        assert_eq!(w.match_policy.as_deref(), Some("Equivalent"));
        assert_eq!(w.object_selector, Some(LabelSelector::default()));
    }

    #[test]
    fn changed_rules_are_not_hidden_by_defaulting() {
        let built = build_webhook(&syncer(), &WebhookSettings::default());
        let mut stale = built.clone();
        stale.rules = Some(vec![]);
        assert!(!same_entry(&stale, &built));
        assert!(same_entry(&built, &built));
    }

    #[tokio::test]
    async fn removal_keeps_other_entries() {
        let mut store = MockWebhookConfigStore::new();
        store
            .expect_get_config()
            .returning(|_| Ok(Some(config(&["a.app.kommit.dev", "b.app.kommit.dev"]))));
        store
            .expect_replace_config()
            .withf(|c| {
                c.webhooks.as_ref().unwrap().iter().map(|w| w.name.as_str()).collect::<Vec<_>>()
                    == vec!["b.app.kommit.dev"]
            })
            .times(1)
            .returning(|_| Ok(()));

        remove_webhook(&store, "kommit-remotesyncer-interceptor", "a.app.kommit.dev")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn removing_a_missing_entry_is_a_no_op() {
        let mut store = MockWebhookConfigStore::new();
        store
            .expect_get_config()
            .returning(|_| Ok(Some(config(&["b.app.kommit.dev"]))));
        store.expect_replace_config().never();

        remove_webhook(&store, "kommit-remotesyncer-interceptor", "a.app.kommit.dev")
            .await
            .unwrap();
    }

    #[test]
    fn configuration_webhooks_cover_every_validator() {
        let config = build_configuration_webhooks(&WebhookSettings::default());
        let webhooks = config.webhooks.unwrap();
        let paths: Vec<_> = webhooks
            .iter()
            .map(|w| w.client_config.service.as_ref().unwrap().path.clone().unwrap())
            .collect();
        assert_eq!(
            paths,
            vec![
                VALIDATE_SYNCER_PATH,
                VALIDATE_USER_PATH,
                VALIDATE_BINDING_PATH,
                ASSOCIATE_USER_PATH
            ]
        );
        let association = &webhooks[3];
        assert_eq!(association.failure_policy.as_deref(), Some("Ignore"));
        assert_eq!(association.side_effects, "NoneOnDryRun");
    }
}
