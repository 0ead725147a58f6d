//! Kubernetes access
//!
//! Every component talks to the apiserver through the traits below so tests
//! can substitute mocks. [`KubeClientImpl`] is the real implementation; the
//! webhook-configuration and SubjectAccessReview traits live next to their
//! callers and are implemented for it there.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::crd::{
    RemoteSyncer, RemoteTarget, RemoteTargetStatus, RemoteUser, RemoteUserBinding,
    RemoteUserBindingStatus, RemoteUserStatus,
};
use crate::{Error, MANAGED_BY_KOMMIT, MANAGED_BY_LABEL, SYNCER_FINALIZER, SYNCER_LABEL};

/// Read access to the objects identity resolution and the reconcilers need
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterReader: Send + Sync {
    /// All RemoteUserBindings in a namespace
    async fn list_user_bindings(&self, namespace: &str) -> Result<Vec<RemoteUserBinding>, Error>;

    /// A RemoteUser, `None` when absent
    async fn get_user(&self, namespace: &str, name: &str) -> Result<Option<RemoteUser>, Error>;

    /// All RemoteUsers in a namespace
    async fn list_users(&self, namespace: &str) -> Result<Vec<RemoteUser>, Error>;

    /// A RemoteTarget, `None` when absent
    async fn get_target(&self, namespace: &str, name: &str)
        -> Result<Option<RemoteTarget>, Error>;

    /// A Secret, `None` when absent
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error>;

    /// A ConfigMap, `None` when absent
    async fn get_config_map(&self, namespace: &str, name: &str)
        -> Result<Option<ConfigMap>, Error>;
}

/// RemoteSyncer reads and writes
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SyncerStore: Send + Sync {
    /// A RemoteSyncer, `None` when absent
    async fn get_syncer(&self, namespace: &str, name: &str)
        -> Result<Option<RemoteSyncer>, Error>;

    /// All RemoteSyncers in a namespace
    async fn list_syncers(&self, namespace: &str) -> Result<Vec<RemoteSyncer>, Error>;

    /// Replace the status subresource.
    ///
    /// The object's resourceVersion is sent along, so a concurrent writer
    /// makes this fail with a conflict (see [`Error::is_conflict`]).
    async fn replace_syncer_status(&self, syncer: &RemoteSyncer) -> Result<(), Error>;

    /// Add the cleanup finalizer
    async fn add_finalizer(&self, syncer: &RemoteSyncer) -> Result<(), Error>;

    /// Remove the cleanup finalizer
    async fn remove_finalizer(&self, syncer: &RemoteSyncer) -> Result<(), Error>;
}

/// RemoteUserBinding writes
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BindingWriter: Send + Sync {
    /// Create a binding
    async fn create_user_binding(&self, binding: &RemoteUserBinding) -> Result<(), Error>;

    /// Replace a binding's spec, with optimistic concurrency on resourceVersion
    async fn replace_user_binding(&self, binding: &RemoteUserBinding) -> Result<(), Error>;

    /// Delete a binding; absent bindings are not an error
    async fn delete_user_binding(&self, namespace: &str, name: &str) -> Result<(), Error>;
}

/// Writes for RemoteTargets generated by target patterns
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TargetWriter: Send + Sync {
    /// Targets a syncer's patterns generated, selected by label
    async fn list_generated_targets(
        &self,
        namespace: &str,
        syncer: &str,
    ) -> Result<Vec<RemoteTarget>, Error>;

    /// Create or update a target (server-side apply)
    async fn apply_target(&self, target: &RemoteTarget) -> Result<(), Error>;

    /// Delete a target; absent targets are not an error
    async fn delete_target(&self, namespace: &str, name: &str) -> Result<(), Error>;
}

/// Status subresource writes for users, bindings and targets
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StatusWriter: Send + Sync {
    /// Merge-patch a RemoteUser status
    async fn patch_user_status(
        &self,
        namespace: &str,
        name: &str,
        status: &RemoteUserStatus,
    ) -> Result<(), Error>;

    /// Merge-patch a RemoteUserBinding status
    async fn patch_user_binding_status(
        &self,
        namespace: &str,
        name: &str,
        status: &RemoteUserBindingStatus,
    ) -> Result<(), Error>;

    /// Merge-patch a RemoteTarget status
    async fn patch_target_status(
        &self,
        namespace: &str,
        name: &str,
        status: &RemoteTargetStatus,
    ) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
#[derive(Clone)]
pub struct KubeClientImpl {
    pub(crate) client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

const FIELD_MANAGER: &str = "kommit-controller";

#[async_trait]
impl ClusterReader for KubeClientImpl {
    async fn list_user_bindings(&self, namespace: &str) -> Result<Vec<RemoteUserBinding>, Error> {
        let api: Api<RemoteUserBinding> = self.api(namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn get_user(&self, namespace: &str, name: &str) -> Result<Option<RemoteUser>, Error> {
        let api: Api<RemoteUser> = self.api(namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_users(&self, namespace: &str) -> Result<Vec<RemoteUser>, Error> {
        let api: Api<RemoteUser> = self.api(namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn get_target(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<RemoteTarget>, Error> {
        let api: Api<RemoteTarget> = self.api(namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        let api: Api<Secret> = self.api(namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, Error> {
        let api: Api<ConfigMap> = self.api(namespace);
        Ok(api.get_opt(name).await?)
    }
}

#[async_trait]
impl SyncerStore for KubeClientImpl {
    async fn get_syncer(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<RemoteSyncer>, Error> {
        let api: Api<RemoteSyncer> = self.api(namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_syncers(&self, namespace: &str) -> Result<Vec<RemoteSyncer>, Error> {
        let api: Api<RemoteSyncer> = self.api(namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn replace_syncer_status(&self, syncer: &RemoteSyncer) -> Result<(), Error> {
        let namespace = syncer.namespace().unwrap_or_default();
        let api: Api<RemoteSyncer> = self.api(&namespace);
        let body = serde_json::to_vec(syncer)?;
        api.replace_status(&syncer.name_any(), &PostParams::default(), body)
            .await?;
        Ok(())
    }

    async fn add_finalizer(&self, syncer: &RemoteSyncer) -> Result<(), Error> {
        let namespace = syncer.namespace().unwrap_or_default();
        let api: Api<RemoteSyncer> = self.api(&namespace);
        let mut finalizers = syncer.finalizers().to_vec();
        if finalizers.iter().any(|f| f == SYNCER_FINALIZER) {
            return Ok(());
        }
        finalizers.push(SYNCER_FINALIZER.to_string());
        let patch = json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": syncer.resource_version(),
            }
        });
        api.patch(&syncer.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn remove_finalizer(&self, syncer: &RemoteSyncer) -> Result<(), Error> {
        let namespace = syncer.namespace().unwrap_or_default();
        let api: Api<RemoteSyncer> = self.api(&namespace);
        let finalizers: Vec<&String> = syncer
            .finalizers()
            .iter()
            .filter(|f| f.as_str() != SYNCER_FINALIZER)
            .collect();
        let patch = json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": syncer.resource_version(),
            }
        });
        match api
            .patch(&syncer.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl BindingWriter for KubeClientImpl {
    async fn create_user_binding(&self, binding: &RemoteUserBinding) -> Result<(), Error> {
        let namespace = binding.namespace().unwrap_or_default();
        let api: Api<RemoteUserBinding> = self.api(&namespace);
        api.create(&PostParams::default(), binding).await?;
        Ok(())
    }

    async fn replace_user_binding(&self, binding: &RemoteUserBinding) -> Result<(), Error> {
        let namespace = binding.namespace().unwrap_or_default();
        let api: Api<RemoteUserBinding> = self.api(&namespace);
        api.replace(&binding.name_any(), &PostParams::default(), binding)
            .await?;
        Ok(())
    }

    async fn delete_user_binding(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<RemoteUserBinding> = self.api(namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl TargetWriter for KubeClientImpl {
    async fn list_generated_targets(
        &self,
        namespace: &str,
        syncer: &str,
    ) -> Result<Vec<RemoteTarget>, Error> {
        let api: Api<RemoteTarget> = self.api(namespace);
        let selector =
            format!("{MANAGED_BY_LABEL}={MANAGED_BY_KOMMIT},{SYNCER_LABEL}={syncer}");
        Ok(api.list(&ListParams::default().labels(&selector)).await?.items)
    }

    async fn apply_target(&self, target: &RemoteTarget) -> Result<(), Error> {
        let namespace = target.namespace().unwrap_or_default();
        let api: Api<RemoteTarget> = self.api(&namespace);
        let params = PatchParams::apply(FIELD_MANAGER).force();
        api.patch(&target.name_any(), &params, &Patch::Apply(target))
            .await?;
        debug!(target = %target.name_any(), namespace = %namespace, "Applied RemoteTarget");
        Ok(())
    }

    async fn delete_target(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<RemoteTarget> = self.api(namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl StatusWriter for KubeClientImpl {
    async fn patch_user_status(
        &self,
        namespace: &str,
        name: &str,
        status: &RemoteUserStatus,
    ) -> Result<(), Error> {
        let api: Api<RemoteUser> = self.api(namespace);
        let patch = json!({ "status": status });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn patch_user_binding_status(
        &self,
        namespace: &str,
        name: &str,
        status: &RemoteUserBindingStatus,
    ) -> Result<(), Error> {
        let api: Api<RemoteUserBinding> = self.api(namespace);
        let patch = json!({ "status": status });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn patch_target_status(
        &self,
        namespace: &str,
        name: &str,
        status: &RemoteTargetStatus,
    ) -> Result<(), Error> {
        let api: Api<RemoteTarget> = self.api(namespace);
        let patch = json!({ "status": status });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}
