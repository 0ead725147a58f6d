//! Reconcilers for kommit CRDs
//!
//! - [`syncer`] installs each RemoteSyncer's interception path and webhook
//!   entry and runs its target patterns
//! - [`user`] reports whether a RemoteUser's Secret is usable
//! - [`user_binding`] reports which hosts a RemoteUserBinding can push to
//! - [`target`] reports whether a RemoteTarget's merge strategy is coherent
//!
//! All reconcilers share one [`Context`].

mod runner;
mod syncer;
mod target;
pub mod target_pattern;
mod user;
mod user_binding;
pub mod webhook_config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::error;

use crate::client::{
    BindingWriter, ClusterReader, KubeClientImpl, StatusWriter, SyncerStore, TargetWriter,
};
use crate::events::{EventPublisher, KubeEventPublisher, CONTROLLER_NAME};
use crate::git::Git2Engine;
use crate::pipeline::PipelineContext;
use crate::webhook::PathRegistry;
use crate::Error;

pub use runner::run_controllers;
pub use syncer::reconcile_syncer;
pub use target::reconcile_target;
pub use user::reconcile_user;
pub use user_binding::reconcile_user_binding;
pub use webhook_config::{WebhookConfigStore, WebhookSettings};

/// Requeue delay after a retryable failure
const RETRY_REQUEUE: Duration = Duration::from_secs(5);

/// Requeue delay after a failure that needs a configuration change
const SLOW_REQUEUE: Duration = Duration::from_secs(60);

/// Shared state for every reconciler
pub struct Context {
    /// RemoteSyncer reads, status and finalizers
    pub syncers: Arc<dyn SyncerStore>,
    /// Users, bindings, targets and Secrets
    pub reader: Arc<dyn ClusterReader>,
    /// RemoteUserBinding writes
    pub bindings: Arc<dyn BindingWriter>,
    /// Generated RemoteTarget writes
    pub targets: Arc<dyn TargetWriter>,
    /// Status writes for users, bindings and targets
    pub status: Arc<dyn StatusWriter>,
    /// Shared ValidatingWebhookConfiguration
    pub webhooks: Arc<dyn WebhookConfigStore>,
    /// Kubernetes Events
    pub events: Arc<dyn EventPublisher>,
    /// Paths served by the webhook server
    pub registry: Arc<PathRegistry>,
    /// Dependencies handed to every decision pipeline
    pub pipeline: Arc<PipelineContext>,
    /// How webhook entries reach the server
    pub settings: WebhookSettings,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a context for testing with mock clients
    ///
    /// Every trait object is supplied by the caller; the pipeline context
    /// shares the same reader and syncer store.
    #[cfg(test)]
    #[allow(clippy::too_many_arguments)]
    pub fn for_testing(
        syncers: Arc<dyn SyncerStore>,
        reader: Arc<dyn ClusterReader>,
        bindings: Arc<dyn BindingWriter>,
        targets: Arc<dyn TargetWriter>,
        status: Arc<dyn StatusWriter>,
        webhooks: Arc<dyn WebhookConfigStore>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        let pipeline = PipelineContext::new(
            reader.clone(),
            syncers.clone(),
            Arc::new(crate::git::MockGitPusher::new()),
            "kommit-system",
        );
        Self {
            syncers,
            reader,
            bindings,
            targets,
            status,
            webhooks,
            events,
            registry: Arc::new(PathRegistry::new()),
            pipeline: Arc::new(pipeline),
            settings: WebhookSettings::default(),
        }
    }
}

/// Builder for constructing [`Context`] instances
///
/// ```ignore
/// let ctx = Context::builder(client)
///     .settings(settings)
///     .git_cache_dir("/var/cache/kommit")
///     .registry(registry.clone())
///     .build();
/// ```
pub struct ContextBuilder {
    client: Client,
    settings: WebhookSettings,
    git_cache_dir: PathBuf,
    registry: Option<Arc<PathRegistry>>,
    events: Option<Arc<dyn EventPublisher>>,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            settings: WebhookSettings::default(),
            git_cache_dir: PathBuf::from("/tmp/kommit-git-cache"),
            registry: None,
            events: None,
        }
    }

    /// Set the webhook settings
    pub fn settings(mut self, settings: WebhookSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Set the directory Git clones are cached in
    pub fn git_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.git_cache_dir = dir.into();
        self
    }

    /// Share a path registry with the webhook server
    pub fn registry(mut self, registry: Arc<PathRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Override the event publisher
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        let kube = Arc::new(KubeClientImpl::new(self.client.clone()));
        let pipeline = PipelineContext::new(
            kube.clone(),
            kube.clone(),
            Arc::new(Git2Engine::new(self.git_cache_dir)),
            self.settings.service_namespace.clone(),
        );
        Context {
            syncers: kube.clone(),
            reader: kube.clone(),
            bindings: kube.clone(),
            targets: kube.clone(),
            status: kube.clone(),
            webhooks: kube,
            events: self
                .events
                .unwrap_or_else(|| Arc::new(KubeEventPublisher::new(self.client, CONTROLLER_NAME))),
            registry: self.registry.unwrap_or_default(),
            pipeline: Arc::new(pipeline),
            settings: self.settings,
        }
    }
}

/// Requeue delay for a failed reconcile
pub fn requeue_after(error: &Error) -> Duration {
    if error.is_retryable() {
        RETRY_REQUEUE
    } else {
        SLOW_REQUEUE
    }
}

/// Shared error policy: log, then requeue according to [`requeue_after`]
pub fn error_policy<K: ResourceExt>(object: Arc<K>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        name = %object.name_any(),
        namespace = ?object.namespace(),
        "reconciliation failed"
    );
    Action::requeue(requeue_after(error))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::client::{
        MockBindingWriter, MockClusterReader, MockStatusWriter, MockSyncerStore, MockTargetWriter,
    };
    use crate::events::NoopEventPublisher;
    use super::webhook_config::MockWebhookConfigStore;

    /// Mocks for every Context dependency, consumed by [`Mocks::into_context`]
    #[derive(Default)]
    pub(crate) struct Mocks {
        pub syncers: MockSyncerStore,
        pub reader: MockClusterReader,
        pub bindings: MockBindingWriter,
        pub targets: MockTargetWriter,
        pub status: MockStatusWriter,
        pub webhooks: MockWebhookConfigStore,
    }

    impl Mocks {
        pub(crate) fn into_context(self) -> Arc<Context> {
            Arc::new(Context::for_testing(
                Arc::new(self.syncers),
                Arc::new(self.reader),
                Arc::new(self.bindings),
                Arc::new(self.targets),
                Arc::new(self.status),
                Arc::new(self.webhooks),
                Arc::new(NoopEventPublisher),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{RemoteTarget, RemoteTargetSpec};
    use crate::git::GitError;

    fn target() -> Arc<RemoteTarget> {
        Arc::new(RemoteTarget::new(
            "t",
            RemoteTargetSpec {
                upstream_repository: "https://git.example.com/a/b.git".into(),
                upstream_branch: "main".into(),
                target_repository: "https://git.example.com/a/b.git".into(),
                target_branch: "main".into(),
                merge_strategy: None,
            },
        ))
    }

    /// Story: broken configuration is retried slowly, flaky infrastructure quickly
    #[test]
    fn story_error_policy_requeue_depends_on_error_kind() {
        let ctx = test_support::Mocks::default().into_context();

        let action = error_policy(target(), &Error::validation("bad"), ctx.clone());
        assert_eq!(action, Action::requeue(SLOW_REQUEUE));

        let action = error_policy(
            target(),
            &Error::Git(GitError::Transport("reset".into())),
            ctx,
        );
        assert_eq!(action, Action::requeue(RETRY_REQUEUE));
    }
}
