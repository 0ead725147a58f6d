//! Controller wiring
//!
//! Cross-resource watches are mapped through each controller's own store:
//! RemoteUserBindings requeue the patterned RemoteSyncers of their
//! namespace, basic-auth Secrets requeue the RemoteUsers naming them, and
//! RemoteUsers requeue the RemoteUserBindings referencing them.

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, ResourceExt};
use tracing::{debug, error, info};

use crate::crd::{RemoteSyncer, RemoteTarget, RemoteUser, RemoteUserBinding};
use crate::identity::BASIC_AUTH_SECRET_TYPE;

use super::target_pattern::has_patterns;
use super::{
    error_policy, reconcile_syncer, reconcile_target, reconcile_user, reconcile_user_binding,
    Context,
};

/// Run every reconciler until shutdown is signalled or one of them stops
pub async fn run_controllers(client: Client, ctx: Arc<Context>) {
    let syncers = Controller::new(Api::<RemoteSyncer>::all(client.clone()), WatcherConfig::default());
    let syncer_store = syncers.store();
    let syncer_controller = syncers
        .watches(
            Api::<RemoteUserBinding>::all(client.clone()),
            WatcherConfig::default(),
            move |binding| {
                let namespace = binding.namespace();
                syncer_store
                    .state()
                    .into_iter()
                    .filter(|s| s.namespace() == namespace && has_patterns(s))
                    .map(|s| ObjectRef::from_obj(&*s))
                    .collect::<Vec<_>>()
            },
        )
        .shutdown_on_signal()
        .run(reconcile_syncer, error_policy, ctx.clone())
        .for_each(|result| async move {
            match result {
                Ok(action) => debug!(?action, "RemoteSyncer reconciliation completed"),
                Err(e) => error!(error = ?e, "RemoteSyncer reconciliation error"),
            }
        });

    let users = Controller::new(Api::<RemoteUser>::all(client.clone()), WatcherConfig::default());
    let user_store = users.store();
    let user_controller = users
        .watches(
            Api::<Secret>::all(client.clone()),
            WatcherConfig::default().fields(&format!("type={BASIC_AUTH_SECRET_TYPE}")),
            move |secret| {
                let namespace = secret.namespace();
                let name = secret.name_any();
                user_store
                    .state()
                    .into_iter()
                    .filter(|u| u.namespace() == namespace && u.spec.secret_ref.name == name)
                    .map(|u| ObjectRef::from_obj(&*u))
                    .collect::<Vec<_>>()
            },
        )
        .shutdown_on_signal()
        .run(reconcile_user, error_policy, ctx.clone())
        .for_each(|result| async move {
            match result {
                Ok(action) => debug!(?action, "RemoteUser reconciliation completed"),
                Err(e) => error!(error = ?e, "RemoteUser reconciliation error"),
            }
        });

    let bindings = Controller::new(
        Api::<RemoteUserBinding>::all(client.clone()),
        WatcherConfig::default(),
    );
    let binding_store = bindings.store();
    let binding_controller = bindings
        .watches(
            Api::<RemoteUser>::all(client.clone()),
            WatcherConfig::default(),
            move |user| {
                let namespace = user.namespace();
                let name = user.name_any();
                binding_store
                    .state()
                    .into_iter()
                    .filter(|b| b.namespace() == namespace && b.references_user(&name))
                    .map(|b| ObjectRef::from_obj(&*b))
                    .collect::<Vec<_>>()
            },
        )
        .shutdown_on_signal()
        .run(reconcile_user_binding, error_policy, ctx.clone())
        .for_each(|result| async move {
            match result {
                Ok(action) => debug!(?action, "RemoteUserBinding reconciliation completed"),
                Err(e) => error!(error = ?e, "RemoteUserBinding reconciliation error"),
            }
        });

    let target_controller = Controller::new(Api::<RemoteTarget>::all(client), WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile_target, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => debug!(?action, "RemoteTarget reconciliation completed"),
                Err(e) => error!(error = ?e, "RemoteTarget reconciliation error"),
            }
        });

    info!("Starting kommit controllers");
    tokio::select! {
        _ = syncer_controller => info!("RemoteSyncer controller completed"),
        _ = user_controller => info!("RemoteUser controller completed"),
        _ = binding_controller => info!("RemoteUserBinding controller completed"),
        _ = target_controller => info!("RemoteTarget controller completed"),
    }
}
