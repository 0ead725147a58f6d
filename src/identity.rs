//! Caller to Git identity resolution
//!
//! Maps the apiserver username of an admission request to the RemoteUser
//! whose credentials the commit is pushed with, and to the RemoteTargets the
//! commit lands on.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::core::{Selector, SelectorExt};
use kube::ResourceExt;
use thiserror::Error;
use tracing::debug;

use crate::client::ClusterReader;
use crate::crd::{
    LocalRef, RemoteSyncer, RemoteTarget, RemoteTargetSpec, RemoteUser, RemoteUserBinding,
    TargetStrategy, UnauthorizedUserMode,
};
use crate::git::{host_matches, same_repository, GitCredential};

/// Secret type a RemoteUser credential must have
pub const BASIC_AUTH_SECRET_TYPE: &str = "kubernetes.io/basic-auth";

/// Why a caller could not be mapped to a Git identity
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    /// No binding names the caller and the syncer blocks unbound callers
    #[error("no RemoteUserBinding for subject {0}")]
    UnboundSubject(String),
    /// Several bindings name the caller
    #[error("subject {subject} is bound by several RemoteUserBindings: {bindings}")]
    AmbiguousIdentity {
        /// Caller username
        subject: String,
        /// Comma-separated binding names
        bindings: String,
    },
    /// None of the caller's RemoteUsers is for the repository's host
    #[error("no RemoteUser for host {host}")]
    NoMatchingUser {
        /// Repository host
        host: String,
    },
    /// Several of the caller's RemoteUsers are for the repository's host
    #[error("several RemoteUsers for host {host}: {users}")]
    AmbiguousUser {
        /// Repository host
        host: String,
        /// Comma-separated user names
        users: String,
    },
    /// The RemoteUser's Secret is absent, of the wrong type or empty
    #[error("credential unavailable for RemoteUser {user}: {reason}")]
    CredentialMissing {
        /// RemoteUser name
        user: String,
        /// What is wrong with the Secret
        reason: String,
    },
    /// No RemoteTarget tracks the syncer's repository and branch
    #[error("no RemoteTarget matches {repository}@{branch}")]
    NoMatchingTarget {
        /// Syncer repository
        repository: String,
        /// Syncer branch
        branch: String,
    },
    /// OneTarget syncer but several RemoteTargets match
    #[error("several RemoteTargets match while targetStrategy is OneTarget: {0}")]
    AmbiguousTarget(String),
    /// The apiserver could not be queried
    #[error("lookup failed: {0}")]
    Lookup(String),
}

impl From<crate::Error> for IdentityError {
    fn from(e: crate::Error) -> Self {
        Self::Lookup(e.to_string())
    }
}

/// A caller mapped to a Git identity and its destinations
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedIdentity {
    /// RemoteUser whose credentials are used
    pub user_name: String,
    /// Git username from the Secret
    pub git_username: String,
    /// Author email
    pub email: String,
    /// Credential for the Git server
    pub credential: GitCredential,
    /// Branches the commit is pushed to
    pub targets: Vec<RemoteTarget>,
    /// True when the syncer's default user stood in for an unbound caller
    pub via_default_user: bool,
}

/// Whether `username` is one of the syncer's bypass subjects
pub fn is_bypassed(syncer: &RemoteSyncer, username: &str) -> bool {
    syncer
        .spec
        .bypass_interception_subjects
        .iter()
        .any(|s| s.matches_username(username))
}

/// Resolve the Git identity and targets for `username`
pub async fn resolve(
    reader: &dyn ClusterReader,
    syncer: &RemoteSyncer,
    username: &str,
) -> Result<ResolvedIdentity, IdentityError> {
    let namespace = syncer.namespace().unwrap_or_default();
    let repository = &syncer.spec.remote_repository;

    let bindings: Vec<RemoteUserBinding> = reader
        .list_user_bindings(&namespace)
        .await?
        .into_iter()
        .filter(|b| b.spec.subject.matches_username(username))
        .collect();

    let (user_refs, target_refs, via_default_user) = match bindings.as_slice() {
        [binding] => (
            binding.spec.remote_user_refs.clone(),
            binding.spec.remote_target_refs.clone(),
            false,
        ),
        [] => match (
            syncer.spec.default_unauthorized_user_mode,
            &syncer.spec.default_remote_user_ref,
        ) {
            (UnauthorizedUserMode::UseDefaultUser, Some(user)) => {
                debug!(subject = %username, user = %user.name, "Using default RemoteUser");
                (vec![user.clone()], Vec::new(), true)
            }
            _ => return Err(IdentityError::UnboundSubject(username.to_string())),
        },
        many => {
            return Err(IdentityError::AmbiguousIdentity {
                subject: username.to_string(),
                bindings: join_names(many.iter().map(|b| b.name_any())),
            })
        }
    };

    let user = select_user(reader, &namespace, repository, &user_refs).await?;
    let credential = load_credential(reader, &namespace, &user).await?;
    let targets = select_targets(reader, syncer, &namespace, &target_refs).await?;

    Ok(ResolvedIdentity {
        user_name: user.name_any(),
        git_username: credential.username.clone(),
        email: user.spec.email.clone(),
        credential,
        targets,
        via_default_user,
    })
}

async fn select_user(
    reader: &dyn ClusterReader,
    namespace: &str,
    repository: &str,
    refs: &[LocalRef],
) -> Result<RemoteUser, IdentityError> {
    let mut matching = Vec::new();
    for r in refs {
        match reader.get_user(namespace, &r.name).await? {
            Some(user) if host_matches(&user.spec.git_base_domain_fqdn, repository) => {
                matching.push(user)
            }
            Some(_) => {}
            None => debug!(user = %r.name, namespace = %namespace, "Referenced RemoteUser not found"),
        }
    }

    let host = crate::git::repository_host(repository).unwrap_or_else(|| repository.to_string());
    match matching.len() {
        0 => Err(IdentityError::NoMatchingUser { host }),
        1 => Ok(matching.remove(0)),
        _ => Err(IdentityError::AmbiguousUser {
            host,
            users: join_names(matching.iter().map(|u| u.name_any())),
        }),
    }
}

async fn load_credential(
    reader: &dyn ClusterReader,
    namespace: &str,
    user: &RemoteUser,
) -> Result<GitCredential, IdentityError> {
    let missing = |reason: &str| IdentityError::CredentialMissing {
        user: user.name_any(),
        reason: reason.to_string(),
    };

    let secret = reader
        .get_secret(namespace, &user.spec.secret_ref.name)
        .await?
        .ok_or_else(|| missing("secret not found"))?;
    if secret.type_.as_deref() != Some(BASIC_AUTH_SECRET_TYPE) {
        return Err(missing("secret is not of type kubernetes.io/basic-auth"));
    }
    let token = secret_value(&secret, "password").ok_or_else(|| missing("password is empty"))?;
    let username =
        secret_value(&secret, "username").ok_or_else(|| missing("username is empty"))?;
    Ok(GitCredential { username, token })
}

/// Non-empty UTF-8 value of a Secret key, from `data` or `stringData`
pub fn secret_value(secret: &Secret, key: &str) -> Option<String> {
    let from_data = secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .and_then(|v| String::from_utf8(v.0.clone()).ok());
    let value = from_data.or_else(|| secret.string_data.as_ref().and_then(|d| d.get(key).cloned()));
    value.filter(|v| !v.is_empty())
}

async fn select_targets(
    reader: &dyn ClusterReader,
    syncer: &RemoteSyncer,
    namespace: &str,
    binding_refs: &[LocalRef],
) -> Result<Vec<RemoteTarget>, IdentityError> {
    let spec = &syncer.spec;
    let refs: Vec<LocalRef> = if binding_refs.is_empty() {
        spec.default_remote_target_ref.iter().cloned().collect()
    } else {
        binding_refs.to_vec()
    };

    let mut candidates = Vec::new();
    if refs.is_empty() {
        if !spec.default_branch.is_empty() {
            candidates.push(implicit_target(syncer));
        }
    } else {
        for r in &refs {
            match reader.get_target(namespace, &r.name).await? {
                Some(target) => candidates.push(target),
                None => debug!(target = %r.name, namespace = %namespace, "Referenced RemoteTarget not found"),
            }
        }
    }

    let selector = spec.remote_target_selector.as_ref();
    let matching: Vec<RemoteTarget> = candidates
        .into_iter()
        .filter(|t| same_repository(&t.spec.upstream_repository, &spec.remote_repository))
        .filter(|t| t.spec.upstream_branch == spec.default_branch)
        .filter(|t| selector.map_or(true, |s| label_selector_matches(s, t.labels())))
        .collect();

    match (matching.len(), spec.target_strategy) {
        (0, _) => Err(IdentityError::NoMatchingTarget {
            repository: spec.remote_repository.clone(),
            branch: spec.default_branch.clone(),
        }),
        (1, _) | (_, TargetStrategy::MultipleTarget) => Ok(matching),
        (_, TargetStrategy::OneTarget) => Err(IdentityError::AmbiguousTarget(join_names(
            matching.iter().map(|t| t.name_any()),
        ))),
    }
}

/// The syncer's own repository and branch, used when nothing names a target
fn implicit_target(syncer: &RemoteSyncer) -> RemoteTarget {
    let spec = &syncer.spec;
    let mut target = RemoteTarget::new(
        &format!("{}-default", syncer.name_any()),
        RemoteTargetSpec {
            upstream_repository: spec.remote_repository.clone(),
            upstream_branch: spec.default_branch.clone(),
            target_repository: spec.remote_repository.clone(),
            target_branch: spec.default_branch.clone(),
            merge_strategy: None,
        },
    );
    target.metadata.namespace = syncer.namespace();
    target
}

pub(crate) fn label_selector_matches(
    selector: &LabelSelector,
    labels: &BTreeMap<String, String>,
) -> bool {
    let Ok(selector) = Selector::try_from(selector.clone()) else {
        return false;
    };
    selector.matches(labels)
}

fn join_names(names: impl Iterator<Item = String>) -> String {
    names.collect::<Vec<_>>().join(", ")
}
