//! Per-syncer admission decision pipeline
//!
//! One [`DecisionPipeline`] exists per registered RemoteSyncer. Every
//! intercepted request runs through the same stages:
//!
//! 1. extract the object identity and caller
//! 2. let bypass subjects through
//! 3. resolve the caller's Git identity and targets
//! 4. render the object to YAML without its excluded fields
//! 5. push to every target under [`crate::PUSH_DEADLINE`]
//! 6. answer the apiserver according to the syncer's strategy
//! 7. record the outcome in the syncer status
//!
//! Failures at any stage deny the request; they are never surfaced as HTTP
//! errors.

pub mod render;
pub mod status;

use std::sync::Arc;
use std::time::Duration;

use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, Operation as AdmissionOperation};
use kube::ResourceExt;
use tracing::{debug, error, info, warn};

use crate::client::{ClusterReader, SyncerStore};
use crate::crd::{conditions, ObjectDescriptor, RemoteSyncer, RemoteTarget, Strategy};
use crate::git::lock::KeyedLocks;
use crate::git::{repository_host, FileAction, GitPusher, PushOutcome, PushRequest, TlsOptions};
use crate::identity::{self, secret_value, ResolvedIdentity};

/// Audit annotation carrying the Git host(s) pushed to
pub const AUDIT_REPO_FQDN: &str = "repo-fqdn";
/// Audit annotation carrying the file path(s) written
pub const AUDIT_REPO_PATH: &str = "repo-path";
/// Audit annotation carrying the commit hash(es)
pub const AUDIT_COMMIT_HASH: &str = "commit-hash";

/// Secret keys searched for a PEM CA bundle, in order
const CA_BUNDLE_KEYS: [&str; 2] = ["ca.crt", "tls.crt"];

/// Dependencies shared by every pipeline
pub struct PipelineContext {
    /// Reads bindings, users, targets, secrets and config maps
    pub reader: Arc<dyn ClusterReader>,
    /// Reads and writes syncer status
    pub syncers: Arc<dyn SyncerStore>,
    /// Commits and pushes
    pub pusher: Arc<dyn GitPusher>,
    /// Namespace the operator runs in, searched last for CA bundles
    pub operator_namespace: String,
    /// Budget for the push stage
    pub push_deadline: Duration,
    status_locks: KeyedLocks,
}

impl PipelineContext {
    /// Create a context with the default push deadline
    pub fn new(
        reader: Arc<dyn ClusterReader>,
        syncers: Arc<dyn SyncerStore>,
        pusher: Arc<dyn GitPusher>,
        operator_namespace: impl Into<String>,
    ) -> Self {
        Self {
            reader,
            syncers,
            pusher,
            operator_namespace: operator_namespace.into(),
            push_deadline: crate::PUSH_DEADLINE,
            status_locks: KeyedLocks::new(),
        }
    }

    /// Override the push deadline
    pub fn with_push_deadline(mut self, deadline: Duration) -> Self {
        self.push_deadline = deadline;
        self
    }
}

/// One successful push
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TargetPush {
    /// RemoteTarget name
    pub target: String,
    /// Host of the target repository
    pub fqdn: String,
    /// Commit and path
    pub outcome: PushOutcome,
}

/// Everything known about one intercepted request. Never persisted.
#[derive(Clone, Debug, Default)]
pub struct AdmissionDecision {
    /// AdmissionReview request UID
    pub uid: String,
    /// Object the request is about
    pub object: ObjectDescriptor,
    /// Admission operation (CREATE, UPDATE, DELETE, CONNECT)
    pub operation: String,
    /// Apiserver username of the caller
    pub username: String,
    /// Dry-run request
    pub dry_run: bool,
    /// Resolved Git identity and targets
    pub identity: Option<ResolvedIdentity>,
    /// Rendered YAML, absent for deletions
    pub yaml: Option<String>,
    /// Caller matched a bypass subject
    pub bypass: bool,
    /// Every stage succeeded
    pub process_pass: bool,
    /// The apiserver is told to admit the request
    pub webhook_pass: bool,
    /// Successful pushes, one per target
    pub pushes: Vec<TargetPush>,
    /// Condition reason for the outcome
    pub reason: &'static str,
    /// Diagnostic or summary text
    pub message: String,
}

impl AdmissionDecision {
    fn extract(request: &AdmissionRequest<DynamicObject>) -> Self {
        let name = if request.name.is_empty() {
            request
                .object
                .as_ref()
                .or(request.old_object.as_ref())
                .and_then(|o| o.metadata.name.clone())
                .unwrap_or_default()
        } else {
            request.name.clone()
        };

        Self {
            uid: request.uid.clone(),
            object: ObjectDescriptor {
                group: request.resource.group.clone(),
                version: request.resource.version.clone(),
                resource: request.resource.resource.clone(),
                name,
                namespace: request.namespace.clone(),
            },
            operation: operation_name(&request.operation).to_string(),
            username: request.user_info.username.clone().unwrap_or_default(),
            dry_run: request.dry_run,
            ..Default::default()
        }
    }

    fn fail(&mut self, reason: &'static str, message: impl Into<String>) {
        self.process_pass = false;
        self.reason = reason;
        self.message = message.into();
    }

    fn joined(&self, field: impl Fn(&TargetPush) -> &str) -> String {
        self.pushes.iter().map(field).collect::<Vec<_>>().join(",")
    }
}

fn operation_name(op: &AdmissionOperation) -> &'static str {
    match op {
        AdmissionOperation::Create => "CREATE",
        AdmissionOperation::Update => "UPDATE",
        AdmissionOperation::Delete => "DELETE",
        AdmissionOperation::Connect => "CONNECT",
    }
}

/// Decision pipeline bound to one RemoteSyncer
pub struct DecisionPipeline {
    ctx: Arc<PipelineContext>,
    syncer: RemoteSyncer,
}

impl DecisionPipeline {
    /// Bind a pipeline to a syncer snapshot
    pub fn new(ctx: Arc<PipelineContext>, syncer: RemoteSyncer) -> Self {
        Self { ctx, syncer }
    }

    /// The syncer this pipeline serves
    pub fn syncer(&self) -> &RemoteSyncer {
        &self.syncer
    }

    /// Decide on one admission request
    pub async fn review(&self, request: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
        let mut decision = AdmissionDecision::extract(request);
        let syncer_name = self.syncer.name_any();
        info!(
            syncer = %syncer_name,
            uid = %decision.uid,
            user = %decision.username,
            operation = %decision.operation,
            object = %decision.object,
            "Intercepted request"
        );

        self.decide(request, &mut decision).await;
        decision.webhook_pass = self.admits(&decision);

        if decision.process_pass || decision.bypass {
            info!(
                syncer = %syncer_name,
                uid = %decision.uid,
                allowed = decision.webhook_pass,
                commit = %decision.joined(|p| p.outcome.commit_hash.as_str()),
                "Request processed"
            );
        } else {
            warn!(
                syncer = %syncer_name,
                uid = %decision.uid,
                reason = decision.reason,
                message = %decision.message,
                "Request denied"
            );
        }

        self.persist_status(&decision).await;
        self.respond(request, &decision)
    }

    async fn decide(&self, request: &AdmissionRequest<DynamicObject>, decision: &mut AdmissionDecision) {
        if identity::is_bypassed(&self.syncer, &decision.username) {
            decision.bypass = true;
            decision.reason = conditions::REASON_BYPASSED;
            decision.message = format!("{} is a bypass subject", decision.username);
            return;
        }

        let resolved =
            match identity::resolve(self.ctx.reader.as_ref(), &self.syncer, &decision.username)
                .await
            {
                Ok(resolved) => resolved,
                Err(e) => {
                    decision.fail(conditions::REASON_IDENTITY_FAILED, e.to_string());
                    return;
                }
            };

        if decision.object.name.is_empty() {
            decision.fail(
                conditions::REASON_SERIALIZATION_FAILED,
                "object has no name; generateName is not supported",
            );
            return;
        }

        if FileAction::for_operation(&decision.operation) == FileAction::None {
            decision.identity = Some(resolved);
            decision.process_pass = true;
            decision.reason = conditions::REASON_NOTHING_TO_COMMIT;
            decision.message = format!(
                "{} {} changes nothing in Git; no commit was made",
                decision.operation, decision.object
            );
            return;
        }

        let yaml = match &request.object {
            Some(object) if decision.operation != "DELETE" => match self.render(object).await {
                Ok(yaml) => Some(yaml),
                Err(e) => {
                    decision.fail(conditions::REASON_SERIALIZATION_FAILED, e.to_string());
                    return;
                }
            },
            _ => None,
        };
        decision.yaml = yaml;

        if decision.dry_run {
            decision.identity = Some(resolved);
            decision.process_pass = true;
            decision.reason = conditions::REASON_PUSHED;
            decision.message = "dry run: nothing was committed".to_string();
            return;
        }

        let tls = self.tls_options().await;
        let pushes = tokio::time::timeout(
            self.ctx.push_deadline,
            self.push_all(&resolved, decision, &tls),
        )
        .await;
        decision.identity = Some(resolved);

        match pushes {
            Err(_) => decision.fail(
                conditions::REASON_TIMEOUT,
                format!(
                    "push did not complete within {}s",
                    self.ctx.push_deadline.as_secs_f32()
                ),
            ),
            Ok(Err(message)) => decision.fail(conditions::REASON_PUSH_FAILED, message),
            Ok(Ok(pushes)) => {
                decision.process_pass = true;
                decision.reason = conditions::REASON_PUSHED;
                decision.message = format!(
                    "{} {} committed as {}",
                    decision.operation,
                    decision.object,
                    pushes
                        .iter()
                        .map(|p| format!("{}@{}", p.outcome.commit_hash, p.target))
                        .collect::<Vec<_>>()
                        .join(", ")
                );
                decision.pushes = pushes;
            }
        }
    }

    async fn render(&self, object: &DynamicObject) -> Result<String, crate::Error> {
        let mut excluded = self.syncer.spec.excluded_fields.clone();
        if let Some(cm_ref) = &self.syncer.spec.excluded_fields_config_map_ref {
            let namespace = self.syncer.namespace().unwrap_or_default();
            match self.ctx.reader.get_config_map(&namespace, &cm_ref.name).await? {
                Some(cm) => excluded.extend(render::config_map_excluded_fields(&cm)?),
                None => warn!(
                    syncer = %self.syncer.name_any(),
                    config_map = %cm_ref.name,
                    "Excluded fields ConfigMap not found"
                ),
            }
        }
        render::render_yaml(object, &excluded)
    }

    async fn push_all(
        &self,
        resolved: &ResolvedIdentity,
        decision: &AdmissionDecision,
        tls: &TlsOptions,
    ) -> Result<Vec<TargetPush>, String> {
        let mut pushes = Vec::with_capacity(resolved.targets.len());
        for target in &resolved.targets {
            let request = self.push_request(resolved, target, decision, tls.clone());
            debug!(
                uid = %decision.uid,
                target = %target.name_any(),
                branch = %request.target_branch,
                path = %request.path(),
                "Pushing"
            );
            match self.ctx.pusher.push(request).await {
                Ok(outcome) => pushes.push(TargetPush {
                    target: target.name_any(),
                    fqdn: repository_host(&target.spec.target_repository).unwrap_or_default(),
                    outcome,
                }),
                Err(e) => {
                    return Err(format!(
                        "push to {} ({}) failed: {e}",
                        target.name_any(),
                        target.spec.target_branch
                    ))
                }
            }
        }
        Ok(pushes)
    }

    fn push_request(
        &self,
        resolved: &ResolvedIdentity,
        target: &RemoteTarget,
        decision: &AdmissionDecision,
        tls: TlsOptions,
    ) -> PushRequest {
        let spec = &target.spec;
        PushRequest {
            upstream_repository: spec.upstream_repository.clone(),
            upstream_branch: spec.upstream_branch.clone(),
            target_repository: spec.target_repository.clone(),
            target_branch: spec.target_branch.clone(),
            merge_strategy: if spec.is_same_branch() {
                None
            } else {
                spec.merge_strategy
            },
            author_name: resolved.git_username.clone(),
            author_email: resolved.email.clone(),
            credential: resolved.credential.clone(),
            object: decision.object.clone(),
            operation: decision.operation.clone(),
            content: decision.yaml.clone(),
            root_path: self.syncer.spec.root_path.clone(),
            tls,
        }
    }

    /// TLS settings for the syncer's Git server.
    ///
    /// The CA bundle comes from `caBundleSecretRef`, else from a Secret named
    /// `<host>-ca-cert` in the syncer namespace, else in the operator namespace.
    async fn tls_options(&self) -> TlsOptions {
        let spec = &self.syncer.spec;
        if spec.insecure_skip_tls_verify {
            return TlsOptions {
                insecure_skip_verify: true,
                ca_bundle: None,
            };
        }

        let namespace = self.syncer.namespace().unwrap_or_default();
        let mut candidates = Vec::new();
        if let Some(r) = &spec.ca_bundle_secret_ref {
            candidates.push((namespace.clone(), r.name.clone()));
        }
        if let Some(host) = repository_host(&spec.remote_repository) {
            let name = format!("{host}-ca-cert");
            candidates.push((namespace.clone(), name.clone()));
            candidates.push((self.ctx.operator_namespace.clone(), name));
        }

        for (ns, name) in candidates {
            match self.ctx.reader.get_secret(&ns, &name).await {
                Ok(Some(secret)) => {
                    if let Some(bundle) = CA_BUNDLE_KEYS.iter().find_map(|k| secret_value(&secret, k)) {
                        debug!(secret = %name, namespace = %ns, "Using CA bundle");
                        return TlsOptions {
                            insecure_skip_verify: false,
                            ca_bundle: Some(bundle),
                        };
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(secret = %name, namespace = %ns, error = %e, "CA bundle lookup failed"),
            }
        }
        TlsOptions::default()
    }

    fn admits(&self, decision: &AdmissionDecision) -> bool {
        if decision.bypass {
            return true;
        }
        decision.process_pass && self.syncer.spec.strategy == Strategy::CommitApply
    }

    fn respond(
        &self,
        request: &AdmissionRequest<DynamicObject>,
        decision: &AdmissionDecision,
    ) -> AdmissionResponse {
        let mut response = AdmissionResponse::from(request);

        if !decision.pushes.is_empty() {
            response.audit_annotations.insert(
                AUDIT_REPO_FQDN.to_string(),
                decision.joined(|p| p.fqdn.as_str()),
            );
            response.audit_annotations.insert(
                AUDIT_REPO_PATH.to_string(),
                decision.joined(|p| p.outcome.path.as_str()),
            );
            response.audit_annotations.insert(
                AUDIT_COMMIT_HASH.to_string(),
                decision.joined(|p| p.outcome.commit_hash.as_str()),
            );
        }

        if decision.webhook_pass {
            if decision.dry_run && !decision.bypass {
                response
                    .warnings
                    .get_or_insert_with(Vec::new)
                    .push(decision.message.clone());
            }
            return response;
        }
        if !decision.process_pass {
            return response.deny(decision.message.clone());
        }

        let message = match &self.syncer.spec.default_blocked_message {
            Some(m) if !m.is_empty() && !decision.dry_run => m.clone(),
            _ => format!(
                "{}. The change was not applied: {} only records changes in {}",
                decision.message,
                self.syncer.name_any(),
                self.syncer.spec.remote_repository
            ),
        };
        response.deny(message)
    }

    async fn persist_status(&self, decision: &AdmissionDecision) {
        let namespace = self.syncer.namespace().unwrap_or_default();
        let name = self.syncer.name_any();
        let _guard = self
            .ctx
            .status_locks
            .lock(&format!("{namespace}/{name}"))
            .await;
        if let Err(e) = status::persist(self.ctx.syncers.as_ref(), &namespace, &name, decision).await
        {
            error!(syncer = %name, namespace = %namespace, error = %e, "Failed to update syncer status");
        }
    }
}
