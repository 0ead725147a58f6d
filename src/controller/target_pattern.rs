//! RemoteTarget generation from RemoteSyncer annotations
//!
//! Two patterns are supported:
//!
//! - `kommit.dev/target-pattern.one-or-many-branches: "main,staging"` creates
//!   one RemoteTarget per listed branch and links each to every
//!   RemoteUserBinding of the namespace.
//! - `kommit.dev/target-pattern.user-specific: "one-user-one-branch"` creates
//!   one RemoteTarget per RemoteUserBinding whose branch is named after the
//!   binding's subject, linked to that binding only.
//!
//! Generated targets carry [`MANAGED_BY_LABEL`], [`TARGET_PATTERN_LABEL`] and
//! [`SYNCER_LABEL`]. Each pass applies the desired set, rewrites binding
//! references with one replace per binding, then deletes generated targets
//! that are no longer wanted.

use std::collections::{BTreeMap, BTreeSet};

use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};
use tracing::{debug, info};

use crate::crd::{
    dns_label, LocalRef, MergeStrategy, RemoteSyncer, RemoteTarget, RemoteTargetSpec,
    RemoteUserBinding,
};
use crate::{Error, MANAGED_BY_KOMMIT, MANAGED_BY_LABEL, SYNCER_LABEL, TARGET_PATTERN_LABEL};

use super::Context;

/// Comma separated branches, one target each
pub const ONE_OR_MANY_BRANCHES_ANNOTATION: &str = "kommit.dev/target-pattern.one-or-many-branches";

/// Merge strategy for branch pattern targets that differ from the upstream
pub const MERGE_STRATEGY_ANNOTATION: &str = "kommit.dev/target-pattern.merge-strategy";

/// Per-binding target pattern selector
pub const USER_SPECIFIC_ANNOTATION: &str = "kommit.dev/target-pattern.user-specific";

/// Only supported value of [`USER_SPECIFIC_ANNOTATION`]
pub const ONE_USER_ONE_BRANCH: &str = "one-user-one-branch";

const BRANCHES_PATTERN: &str = "one-or-many-branches";
const USER_PATTERN: &str = "user-specific";

/// Bindings a generated target is linked to
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Link {
    /// Every binding in the namespace
    AllBindings,
    /// One binding, by name
    Binding(String),
}

/// A target the patterns want to exist
#[derive(Clone, Debug)]
pub struct DesiredTarget {
    /// The generated object
    pub target: RemoteTarget,
    /// Which bindings reference it
    pub link: Link,
}

impl DesiredTarget {
    fn links(&self, binding: &str) -> bool {
        match &self.link {
            Link::AllBindings => true,
            Link::Binding(name) => name == binding,
        }
    }
}

/// True when the syncer carries any target pattern annotation
pub fn has_patterns(syncer: &RemoteSyncer) -> bool {
    let annotations = syncer.annotations();
    annotations.contains_key(ONE_OR_MANY_BRANCHES_ANNOTATION)
        || annotations.contains_key(USER_SPECIFIC_ANNOTATION)
}

/// True when the syncer asks for per-binding targets
pub fn uses_user_pattern(syncer: &RemoteSyncer) -> bool {
    syncer.annotations().contains_key(USER_SPECIFIC_ANNOTATION)
}

fn generated_target(
    syncer: &RemoteSyncer,
    name: String,
    pattern: &str,
    branch: &str,
    merge_strategy: MergeStrategy,
) -> RemoteTarget {
    let repository = syncer.spec.remote_repository.clone();
    let same_branch = branch == syncer.spec.default_branch;
    let owner = syncer.controller_owner_ref(&());
    RemoteTarget {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: syncer.namespace(),
            labels: Some(BTreeMap::from([
                (MANAGED_BY_LABEL.to_string(), MANAGED_BY_KOMMIT.to_string()),
                (TARGET_PATTERN_LABEL.to_string(), pattern.to_string()),
                (SYNCER_LABEL.to_string(), syncer.name_any()),
            ])),
            owner_references: owner.map(|o| vec![o]),
            ..Default::default()
        },
        spec: RemoteTargetSpec {
            upstream_repository: repository.clone(),
            upstream_branch: syncer.spec.default_branch.clone(),
            target_repository: repository,
            target_branch: branch.to_string(),
            merge_strategy: (!same_branch).then_some(merge_strategy),
        },
        status: None,
    }
}

/// Targets the syncer's annotations ask for, given the namespace's bindings
pub fn desired_targets(
    syncer: &RemoteSyncer,
    bindings: &[RemoteUserBinding],
) -> Result<Vec<DesiredTarget>, Error> {
    let annotations = syncer.annotations();
    let syncer_name = syncer.name_any();
    let merge_strategy = match annotations.get(MERGE_STRATEGY_ANNOTATION) {
        Some(raw) => raw.trim().parse::<MergeStrategy>()?,
        None => MergeStrategy::TryFastForwardOrDie,
    };

    let mut desired: Vec<DesiredTarget> = Vec::new();

    if let Some(raw) = annotations.get(ONE_OR_MANY_BRANCHES_ANNOTATION) {
        let branches: BTreeSet<&str> = raw
            .split(',')
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .collect();
        for branch in branches {
            let name = format!("{syncer_name}-{}", dns_label(branch));
            desired.push(DesiredTarget {
                target: generated_target(syncer, name, BRANCHES_PATTERN, branch, merge_strategy),
                link: Link::AllBindings,
            });
        }
    }

    if let Some(raw) = annotations.get(USER_SPECIFIC_ANNOTATION) {
        if raw.trim() != ONE_USER_ONE_BRANCH {
            return Err(Error::validation(format!(
                "{USER_SPECIFIC_ANNOTATION} must be {ONE_USER_ONE_BRANCH:?}, got {raw:?}"
            )));
        }
        for binding in bindings {
            let branch = dns_label(&binding.spec.subject.name);
            if branch.is_empty() {
                continue;
            }
            let name = format!("{syncer_name}-user-{}", dns_label(&binding.name_any()));
            desired.push(DesiredTarget {
                target: generated_target(syncer, name, USER_PATTERN, &branch, merge_strategy),
                link: Link::Binding(binding.name_any()),
            });
        }
    }

    // Same name from both patterns: the first one wins
    let mut seen = BTreeSet::new();
    desired.retain(|d| seen.insert(d.target.name_any()));
    Ok(desired)
}

/// References `binding` should carry once the generated set is `desired`
///
/// References to any name in `managed` that `desired` does not link to this
/// binding are dropped; hand-written references are kept in order.
fn relinked_refs(
    binding: &RemoteUserBinding,
    desired: &[DesiredTarget],
    managed: &BTreeSet<String>,
) -> Vec<LocalRef> {
    let binding_name = binding.name_any();
    let wanted: Vec<String> = desired
        .iter()
        .filter(|d| d.links(&binding_name))
        .map(|d| d.target.name_any())
        .collect();

    let mut refs: Vec<LocalRef> = binding
        .spec
        .remote_target_refs
        .iter()
        .filter(|r| !managed.contains(&r.name) || wanted.contains(&r.name))
        .cloned()
        .collect();
    for name in wanted {
        if !refs.iter().any(|r| r.name == name) {
            refs.push(LocalRef::new(name));
        }
    }
    refs
}

/// Bring generated targets and binding references in line with `desired`
async fn converge(ctx: &Context, syncer: &RemoteSyncer, desired: &[DesiredTarget]) -> Result<(), Error> {
    let namespace = syncer.namespace().unwrap_or_default();
    let syncer_name = syncer.name_any();

    // Setup
    for d in desired {
        ctx.targets.apply_target(&d.target).await?;
    }

    // Diff
    let existing = ctx
        .targets
        .list_generated_targets(&namespace, &syncer_name)
        .await?;
    let desired_names: BTreeSet<String> = desired.iter().map(|d| d.target.name_any()).collect();
    let managed: BTreeSet<String> = existing
        .iter()
        .map(|t| t.name_any())
        .chain(desired_names.iter().cloned())
        .collect();

    for binding in ctx.reader.list_user_bindings(&namespace).await? {
        let refs = relinked_refs(&binding, desired, &managed);
        if refs == binding.spec.remote_target_refs {
            continue;
        }
        let mut updated = binding;
        updated.spec.remote_target_refs = refs;
        ctx.bindings.replace_user_binding(&updated).await?;
        debug!(binding = %updated.name_any(), "Relinked generated targets");
    }

    // Remove
    for stale in existing.iter().filter(|t| !desired_names.contains(&t.name_any())) {
        ctx.targets.delete_target(&namespace, &stale.name_any()).await?;
        info!(target = %stale.name_any(), syncer = %syncer_name, "Deleted stale generated RemoteTarget");
    }
    Ok(())
}

/// Run the syncer's target patterns
pub async fn apply(ctx: &Context, syncer: &RemoteSyncer) -> Result<usize, Error> {
    let namespace = syncer.namespace().unwrap_or_default();
    let bindings = ctx.reader.list_user_bindings(&namespace).await?;
    let desired = desired_targets(syncer, &bindings)?;
    converge(ctx, syncer, &desired).await?;
    Ok(desired.len())
}

/// Remove every target the syncer's patterns generated
pub async fn teardown(ctx: &Context, syncer: &RemoteSyncer) -> Result<(), Error> {
    converge(ctx, syncer, &[]).await
}
