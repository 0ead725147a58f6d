//! Custom Resource Definitions for kommit
//!
//! The `v1beta2` types are re-exported at this level and are what the rest of
//! the crate works with. [`v1beta1`] holds the legacy schemas served for
//! conversion.

mod syncer;
mod target;
mod types;
mod user;
mod user_binding;
pub mod v1beta1;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::core::crd::merge_crds;
use kube::CustomResourceExt;

pub use syncer::{
    BypassedObjectState, MatchPolicy, ObservedObjectState, Operation, PushedObjectState,
    RemoteSyncer, RemoteSyncerSpec, RemoteSyncerStatus, ScopedResources, ScopedRule, Strategy,
    TargetStrategy, UnauthorizedUserMode,
};
pub use target::{MergeStrategy, RemoteTarget, RemoteTargetSpec, RemoteTargetStatus};
pub use types::{
    conditions, dns_label, find_condition, set_condition, Condition, ConditionStatus, LocalRef,
    ObjectDescriptor, Subject, SubjectKind,
};
pub use user::{RemoteUser, RemoteUserSpec, RemoteUserStatus, SecretBoundStatus};
pub use user_binding::{
    GitUserHost, GlobalBindingStatus, HostBindingStatus, RemoteUserBinding,
    RemoteUserBindingSpec, RemoteUserBindingStatus,
};

/// Version objects are stored in and converted through
pub const HUB_VERSION: &str = "v1beta2";

/// Every CRD with all served versions merged, `v1beta2` stored
pub fn all_crds() -> Result<Vec<CustomResourceDefinition>, crate::Error> {
    let pairs = [
        (v1beta1::RemoteSyncer::crd(), RemoteSyncer::crd()),
        (v1beta1::RemoteUser::crd(), RemoteUser::crd()),
        (v1beta1::RemoteUserBinding::crd(), RemoteUserBinding::crd()),
        (v1beta1::RemoteTarget::crd(), RemoteTarget::crd()),
    ];
    pairs
        .into_iter()
        .map(|(legacy, hub)| {
            merge_crds(vec![legacy, hub], HUB_VERSION)
                .map_err(|e| crate::Error::internal(format!("failed to merge CRD versions: {e}")))
        })
        .collect()
}
