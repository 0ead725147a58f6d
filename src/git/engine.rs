//! libgit2-backed [`GitPusher`]
//!
//! Each (target repository, target branch) pair gets a bare cache repository
//! under the engine's cache root. A push:
//!
//! 1. fetches the target branch (and the upstream branch when it differs)
//! 2. picks the base commit according to the merge strategy
//! 3. builds the new tree in memory from the base tree plus the one file
//! 4. commits as the caller and pushes, forcing only after a hard reset and
//!    only if the remote tip is still the one fetched in step 1
//!
//! All libgit2 calls are blocking and run on `spawn_blocking` while the
//! branch lock is held.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use git2::{
    CertificateCheckStatus, Cred, CredentialType, Direction, ErrorClass, ErrorCode, FetchOptions,
    ObjectType, Oid, PushOptions, RemoteCallbacks, Repository, Signature, Tree,
};
use tracing::{debug, info, warn};

use super::lock::{branch_key, KeyedLocks};
use super::tls::CaBundle;
use super::{FileAction, GitError, GitPusher, PushOutcome, PushRequest};
use crate::crd::MergeStrategy;
use crate::retry::{retry_with_backoff_if, RetryConfig};

const ORIGIN: &str = "origin";
const UPSTREAM: &str = "upstream";
const FILE_MODE: i32 = 0o100644;
const TREE_MODE: i32 = 0o040000;
const MAX_CREDENTIAL_ATTEMPTS: u32 = 3;

/// Git push engine backed by libgit2
pub struct Git2Engine {
    cache_root: PathBuf,
    locks: KeyedLocks,
    retry: RetryConfig,
}

impl Git2Engine {
    /// Create an engine caching repositories under `cache_root`
    pub fn new(cache_root: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: cache_root.into(),
            locks: KeyedLocks::new(),
            retry: RetryConfig::git_transport(),
        }
    }

    /// Override the transport retry budget
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn cache_dir(&self, key: &str) -> PathBuf {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let readable: String = key
            .chars()
            .rev()
            .take(40)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect();
        self.cache_root
            .join(format!("{}-{:016x}", readable.trim_matches('-'), hasher.finish()))
    }
}

#[async_trait]
impl GitPusher for Git2Engine {
    async fn push(&self, request: PushRequest) -> Result<PushOutcome, GitError> {
        let key = branch_key(&request.target_repository, &request.target_branch);
        let _guard = self.locks.lock(&key).await;

        let dir = self.cache_dir(&key);
        let bundle = match request.tls.ca_bundle.as_deref() {
            Some(pem) => Some(CaBundle::from_pem(pem)?),
            None => None,
        };
        let request = Arc::new(request);
        let bundle = Arc::new(bundle);

        let outcome = retry_with_backoff_if(
            &self.retry,
            "git_push",
            || {
                let dir = dir.clone();
                let request = request.clone();
                let bundle = bundle.clone();
                async move {
                    tokio::task::spawn_blocking(move || {
                        push_blocking(&dir, &request, (*bundle).as_ref())
                    })
                    .await
                    .map_err(|e| GitError::Internal(format!("push task failed: {e}")))?
                }
            },
            GitError::is_transport,
        )
        .await?;

        info!(
            repository = %request.target_repository,
            branch = %request.target_branch,
            path = %outcome.path,
            commit = %outcome.commit_hash,
            "Pushed object to Git"
        );
        Ok(outcome)
    }
}

/// Base commit the new commit builds on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Base {
    commit: Option<Oid>,
    forced: bool,
}

fn push_blocking(
    dir: &Path,
    req: &PushRequest,
    bundle: Option<&CaBundle>,
) -> Result<PushOutcome, GitError> {
    let repo = open_cache(dir, &req.target_repository)?;

    fetch(&repo, ORIGIN, &req.target_branch, req, bundle)?;
    let target_tip = repo
        .refname_to_id(&format!("refs/remotes/{ORIGIN}/{}", req.target_branch))
        .ok();

    let same_branch = super::same_repository(&req.upstream_repository, &req.target_repository)
        && req.upstream_branch == req.target_branch;

    let base = if same_branch {
        Base {
            commit: target_tip,
            forced: false,
        }
    } else {
        ensure_remote(&repo, UPSTREAM, &req.upstream_repository)?;
        fetch(&repo, UPSTREAM, &req.upstream_branch, req, bundle)?;
        let upstream_tip = repo
            .refname_to_id(&format!("refs/remotes/{UPSTREAM}/{}", req.upstream_branch))
            .map_err(|_| {
                GitError::Internal(format!(
                    "upstream branch {} not found in {}",
                    req.upstream_branch, req.upstream_repository
                ))
            })?;
        resolve_base(&repo, target_tip, upstream_tip, req.merge_strategy)?
    };
    debug!(?base, ?target_tip, "Resolved base commit");

    let commit = commit_change(&repo, base.commit, req)?;
    if Some(commit) != target_tip {
        push_commit(&repo, req, commit, base.forced, target_tip, bundle)?;
    }

    Ok(PushOutcome {
        commit_hash: commit.to_string(),
        path: req.path(),
    })
}

fn open_cache(dir: &Path, url: &str) -> Result<Repository, GitError> {
    if dir.exists() {
        match Repository::open_bare(dir) {
            Ok(repo) => {
                ensure_remote(&repo, ORIGIN, url)?;
                return Ok(repo);
            }
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Discarding unreadable git cache");
                std::fs::remove_dir_all(dir)
                    .map_err(|e| GitError::Internal(format!("failed to clear git cache: {e}")))?;
            }
        }
    }
    std::fs::create_dir_all(dir)
        .map_err(|e| GitError::Internal(format!("failed to create git cache: {e}")))?;
    let repo = Repository::init_bare(dir)?;
    ensure_remote(&repo, ORIGIN, url)?;
    Ok(repo)
}

fn ensure_remote(repo: &Repository, name: &str, url: &str) -> Result<(), GitError> {
    match repo.find_remote(name) {
        Ok(remote) if remote.url() == Some(url) => Ok(()),
        Ok(_) => Ok(repo.remote_set_url(name, url)?),
        Err(_) => {
            repo.remote(name, url)?;
            Ok(())
        }
    }
}

fn callbacks<'a>(req: &'a PushRequest, bundle: Option<&'a CaBundle>) -> RemoteCallbacks<'a> {
    let mut cb = RemoteCallbacks::new();

    let mut attempts = 0;
    cb.credentials(move |_url, _username, allowed| {
        attempts += 1;
        if attempts > MAX_CREDENTIAL_ATTEMPTS {
            return Err(git2::Error::new(
                ErrorCode::Auth,
                ErrorClass::Http,
                "credentials rejected by the Git server",
            ));
        }
        if allowed.contains(CredentialType::USER_PASS_PLAINTEXT) {
            Cred::userpass_plaintext(&req.credential.username, &req.credential.token)
        } else {
            Cred::default()
        }
    });

    let insecure = req.tls.insecure_skip_verify;
    cb.certificate_check(move |cert, _host| {
        if insecure {
            return Ok(CertificateCheckStatus::CertificateOk);
        }
        if let (Some(bundle), Some(x509)) = (bundle, cert.as_x509()) {
            if bundle.trusts(x509.data()) {
                return Ok(CertificateCheckStatus::CertificateOk);
            }
        }
        Ok(CertificateCheckStatus::CertificatePassthrough)
    });

    cb
}

fn fetch(
    repo: &Repository,
    remote_name: &str,
    branch: &str,
    req: &PushRequest,
    bundle: Option<&CaBundle>,
) -> Result<(), GitError> {
    let mut remote = repo.find_remote(remote_name)?;
    let mut opts = FetchOptions::new();
    opts.remote_callbacks(callbacks(req, bundle));
    let spec = format!("+refs/heads/{branch}:refs/remotes/{remote_name}/{branch}");
    remote.fetch(&[spec.as_str()], Some(&mut opts), None)?;
    Ok(())
}

fn resolve_base(
    repo: &Repository,
    target: Option<Oid>,
    upstream: Oid,
    strategy: Option<MergeStrategy>,
) -> Result<Base, GitError> {
    // A missing target branch starts at the upstream tip
    let Some(target) = target else {
        return Ok(Base {
            commit: Some(upstream),
            forced: false,
        });
    };

    match strategy {
        None => Ok(Base {
            commit: Some(target),
            forced: false,
        }),
        Some(MergeStrategy::TryFastForwardOrDie) => fast_forward(repo, target, upstream),
        Some(MergeStrategy::TryHardResetOrDie) => hard_reset(repo, target, upstream),
        Some(MergeStrategy::TryFastForwardOrHardReset) => {
            match fast_forward(repo, target, upstream) {
                Err(GitError::NonFastForward(reason)) => {
                    debug!(%reason, "Fast-forward impossible, resetting onto upstream");
                    hard_reset(repo, target, upstream)
                }
                other => other,
            }
        }
    }
}

fn fast_forward(repo: &Repository, target: Oid, upstream: Oid) -> Result<Base, GitError> {
    if target == upstream || repo.graph_descendant_of(target, upstream)? {
        return Ok(Base {
            commit: Some(target),
            forced: false,
        });
    }
    if repo.graph_descendant_of(upstream, target)? {
        return Ok(Base {
            commit: Some(upstream),
            forced: false,
        });
    }
    Err(GitError::NonFastForward(format!(
        "target {target} has diverged from upstream {upstream}"
    )))
}

fn hard_reset(repo: &Repository, target: Oid, upstream: Oid) -> Result<Base, GitError> {
    let forced = target != upstream && !repo.graph_descendant_of(upstream, target)?;
    Ok(Base {
        commit: Some(upstream),
        forced,
    })
}

/// Insert (`blob = Some`) or remove (`blob = None`) the file at `parts` below
/// `tree`. Returns `None` when the resulting tree would be empty.
fn update_tree(
    repo: &Repository,
    tree: Option<&Tree<'_>>,
    parts: &[&str],
    blob: Option<Oid>,
) -> Result<Option<Oid>, git2::Error> {
    let Some((&head, rest)) = parts.split_first() else {
        return Ok(tree.map(|t| t.id()));
    };
    let mut builder = repo.treebuilder(tree)?;

    if rest.is_empty() {
        match blob {
            Some(id) => {
                builder.insert(head, id, FILE_MODE)?;
            }
            None => {
                if builder.get(head)?.is_some() {
                    builder.remove(head)?;
                }
            }
        }
    } else {
        let child_id = builder
            .get(head)?
            .filter(|e| e.kind() == Some(ObjectType::Tree))
            .map(|e| e.id());
        let child = child_id.map(|id| repo.find_tree(id)).transpose()?;
        match update_tree(repo, child.as_ref(), rest, blob)? {
            Some(id) => {
                builder.insert(head, id, TREE_MODE)?;
            }
            None => {
                if builder.get(head)?.is_some() {
                    builder.remove(head)?;
                }
            }
        }
    }

    if builder.is_empty() {
        return Ok(None);
    }
    builder.write().map(Some)
}

fn commit_change(repo: &Repository, base: Option<Oid>, req: &PushRequest) -> Result<Oid, GitError> {
    let parent = base.map(|id| repo.find_commit(id)).transpose()?;
    let base_tree = parent.as_ref().map(|c| c.tree()).transpose()?;

    let blob = match req.file_action() {
        FileAction::Write => {
            let content = req.content.as_deref().ok_or_else(|| {
                GitError::Internal(format!("no content to write for {}", req.object))
            })?;
            Some(repo.blob(content.as_bytes())?)
        }
        FileAction::Remove => None,
        FileAction::None => {
            return base.ok_or_else(|| {
                GitError::Internal(format!(
                    "branch {} does not exist and nothing is written",
                    req.target_branch
                ))
            });
        }
    };
    if base.is_none() && blob.is_none() {
        return Err(GitError::Internal(format!(
            "branch {} does not exist, nothing to remove",
            req.target_branch
        )));
    }

    let path = req.path();
    let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
    let tree_id = match update_tree(repo, base_tree.as_ref(), &parts, blob)? {
        Some(id) => id,
        None => repo.treebuilder(None)?.write()?,
    };

    if let (Some(parent), Some(tree)) = (&parent, &base_tree) {
        if tree.id() == tree_id {
            debug!(path = %path, "Tree unchanged, reusing base commit");
            return Ok(parent.id());
        }
    }

    let tree = repo.find_tree(tree_id)?;
    let signature = Signature::now(&req.author_name, &req.author_email)?;
    let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
    let oid = repo.commit(
        None,
        &signature,
        &signature,
        &req.commit_message(),
        &tree,
        &parents,
    )?;
    Ok(oid)
}

fn push_commit(
    repo: &Repository,
    req: &PushRequest,
    commit: Oid,
    forced: bool,
    expected_remote: Option<Oid>,
    bundle: Option<&CaBundle>,
) -> Result<(), GitError> {
    let local = format!("refs/heads/{}", req.target_branch);
    repo.reference(&local, commit, true, "kommit: prepare push")?;
    let mut remote = repo.find_remote(ORIGIN)?;

    if forced {
        let conn = remote.connect_auth(Direction::Push, Some(callbacks(req, bundle)), None)?;
        let current = conn
            .list()?
            .iter()
            .find(|head| head.name() == local)
            .map(|head| head.oid());
        drop(conn);
        if current != expected_remote {
            return Err(GitError::NonFastForward(format!(
                "remote branch {} moved since it was fetched",
                req.target_branch
            )));
        }
    }

    let mut rejection: Option<String> = None;
    {
        let mut cb = callbacks(req, bundle);
        cb.push_update_reference(|refname, status| {
            if let Some(msg) = status {
                rejection = Some(format!("{refname}: {msg}"));
            }
            Ok(())
        });
        let mut opts = PushOptions::new();
        opts.remote_callbacks(cb);
        let spec = if forced {
            format!("+{local}:{local}")
        } else {
            format!("{local}:{local}")
        };
        remote.push(&[spec.as_str()], Some(&mut opts))?;
    }

    match rejection {
        None => Ok(()),
        Some(msg) => {
            let lower = msg.to_lowercase();
            if lower.contains("fast-forward") || lower.contains("fetch first") {
                Err(GitError::NonFastForward(msg))
            } else {
                Err(GitError::PermissionDenied(msg))
            }
        }
    }
}
