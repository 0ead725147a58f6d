//! RemoteUserBinding reconciler
//!
//! Builds one `gitUserHosts` row per referenced RemoteUser and rolls them up
//! into `globalStatus`. A change of the roll-up is announced as an Event.

use std::collections::BTreeMap;
use std::sync::Arc;

use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument};

use crate::crd::{
    conditions, set_condition, Condition, ConditionStatus, GitUserHost, GlobalBindingStatus,
    HostBindingStatus, RemoteUser, RemoteUserBinding, RemoteUserBindingStatus, SecretBoundStatus,
};
use crate::events::{actions, reasons};
use crate::Error;

use super::Context;

fn row(name: &str, user: Option<&RemoteUser>) -> GitUserHost {
    match user {
        None => GitUserHost {
            remote_user_used: name.to_string(),
            secret_ref: None,
            git_fqdn: None,
            status: HostBindingStatus::NotBound,
        },
        Some(u) => {
            let bound = u
                .status
                .as_ref()
                .and_then(|s| s.secret_bound_status)
                .is_some_and(|s| s == SecretBoundStatus::SecretBound);
            GitUserHost {
                remote_user_used: name.to_string(),
                secret_ref: Some(u.spec.secret_ref.name.clone()),
                git_fqdn: Some(u.spec.git_base_domain_fqdn.clone()),
                status: if bound {
                    HostBindingStatus::Bound
                } else {
                    HostBindingStatus::NotBound
                },
            }
        }
    }
}

/// Hosts served by more than one bound RemoteUser, with the users
fn duplicate_hosts(rows: &[GitUserHost]) -> BTreeMap<String, Vec<String>> {
    let mut by_host: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for r in rows.iter().filter(|r| r.status == HostBindingStatus::Bound) {
        if let Some(host) = &r.git_fqdn {
            by_host
                .entry(host.to_lowercase())
                .or_default()
                .push(r.remote_user_used.clone());
        }
    }
    by_host.retain(|_, users| users.len() > 1);
    by_host
}

fn roll_up_reason(global: GlobalBindingStatus) -> &'static str {
    match global {
        GlobalBindingStatus::AllBound => reasons::ALL_BOUND,
        GlobalBindingStatus::PartiallyBound => reasons::PARTIALLY_BOUND,
        GlobalBindingStatus::NoneBound => reasons::NONE_BOUND,
    }
}

/// Reconcile a RemoteUserBinding
#[instrument(skip(binding, ctx), fields(binding = %binding.name_any(), namespace = ?binding.namespace()))]
pub async fn reconcile_user_binding(
    binding: Arc<RemoteUserBinding>,
    ctx: Arc<Context>,
) -> Result<Action, Error> {
    let namespace = binding.namespace().unwrap_or_default();

    let mut rows = Vec::with_capacity(binding.spec.remote_user_refs.len());
    for user_ref in &binding.spec.remote_user_refs {
        let user = ctx.reader.get_user(&namespace, &user_ref.name).await?;
        rows.push(row(&user_ref.name, user.as_ref()));
    }
    let global = GlobalBindingStatus::from_rows(&rows);
    let duplicates = duplicate_hosts(&rows);

    let previous = binding.status.clone().unwrap_or_default();
    let mut merged = previous.conditions.clone();
    let (status, message) = if !duplicates.is_empty() {
        (
            ConditionStatus::False,
            duplicates
                .iter()
                .map(|(host, users)| format!("host {host} is served by {}", users.join(", ")))
                .collect::<Vec<_>>()
                .join("; "),
        )
    } else if global == GlobalBindingStatus::AllBound {
        (ConditionStatus::True, "every RemoteUser is bound".to_string())
    } else {
        let unbound: Vec<&str> = rows
            .iter()
            .filter(|r| r.status == HostBindingStatus::NotBound)
            .map(|r| r.remote_user_used.as_str())
            .collect();
        (
            ConditionStatus::False,
            format!("not bound: {}", unbound.join(", ")),
        )
    };
    let reason = if duplicates.is_empty() {
        roll_up_reason(global)
    } else {
        reasons::DUPLICATE_HOST
    };
    set_condition(
        &mut merged,
        Condition::new(conditions::READY, status, reason, message.clone()),
    );

    let desired = RemoteUserBindingStatus {
        git_user_hosts: rows,
        global_status: Some(global),
        conditions: merged,
    };
    if desired == previous {
        debug!("RemoteUserBinding status unchanged");
        return Ok(Action::await_change());
    }

    ctx.status
        .patch_user_binding_status(&namespace, &binding.name_any(), &desired)
        .await?;
    info!(global_status = %global, "updated RemoteUserBinding status");

    if previous.global_status != Some(global) || !duplicates.is_empty() {
        let type_ = if duplicates.is_empty() && global == GlobalBindingStatus::AllBound {
            EventType::Normal
        } else {
            EventType::Warning
        };
        ctx.events
            .publish(
                &binding.object_ref(&()),
                type_,
                reason,
                actions::RECONCILE,
                Some(message),
            )
            .await;
    }

    Ok(Action::await_change())
}
