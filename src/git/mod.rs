//! Git push engine
//!
//! Writes one YAML file per intercepted object into a repository and pushes
//! the resulting commit to the target branch with the caller's credentials.
//! The [`GitPusher`] trait is the seam the decision pipeline talks to;
//! [`engine::Git2Engine`] is the libgit2-backed implementation.

pub mod engine;
pub mod lock;
pub mod path;
pub mod tls;

use async_trait::async_trait;
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

use crate::crd::{MergeStrategy, ObjectDescriptor};

pub use engine::Git2Engine;
pub use path::object_path;

/// Git failure, classified by what the caller can do about it
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum GitError {
    /// Network, TLS or server-side transient failure. Retried.
    #[error("transport error: {0}")]
    Transport(String),
    /// Credentials rejected
    #[error("authentication failed: {0}")]
    Auth(String),
    /// Upstream and target could not be merged
    #[error("merge conflict: {0}")]
    MergeConflict(String),
    /// Target branch moved or diverged
    #[error("non-fast-forward: {0}")]
    NonFastForward(String),
    /// Credentials accepted but push not permitted
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// Anything else
    #[error("internal git error: {0}")]
    Internal(String),
}

impl GitError {
    /// Whether this failure is worth retrying
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

impl From<git2::Error> for GitError {
    fn from(e: git2::Error) -> Self {
        use git2::{ErrorClass, ErrorCode};

        let msg = e.message().to_string();
        match e.code() {
            ErrorCode::Auth => return Self::Auth(msg),
            ErrorCode::NotFastForward => return Self::NonFastForward(msg),
            ErrorCode::MergeConflict | ErrorCode::Conflict => return Self::MergeConflict(msg),
            ErrorCode::Certificate => return Self::Transport(msg),
            _ => {}
        }
        match e.class() {
            ErrorClass::Net | ErrorClass::Http | ErrorClass::Ssl | ErrorClass::Os => {
                let lower = msg.to_lowercase();
                if lower.contains("401") || lower.contains("authentication") {
                    Self::Auth(msg)
                } else if lower.contains("403") || lower.contains("permission") {
                    Self::PermissionDenied(msg)
                } else {
                    Self::Transport(msg)
                }
            }
            _ => Self::Internal(msg),
        }
    }
}

/// Admission operation as seen by the engine
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileAction {
    /// Write (create or overwrite) the object's file
    Write,
    /// Remove the object's file
    Remove,
    /// Leave the tree alone
    None,
}

impl FileAction {
    /// File action for an admission operation name
    pub fn for_operation(operation: &str) -> Self {
        match operation {
            "CREATE" | "UPDATE" => Self::Write,
            "DELETE" => Self::Remove,
            _ => Self::None,
        }
    }
}

/// Basic-auth credential for the Git server
#[derive(Clone, PartialEq, Eq)]
pub struct GitCredential {
    /// Git username
    pub username: String,
    /// Personal access token
    pub token: String,
}

impl std::fmt::Debug for GitCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitCredential")
            .field("username", &self.username)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// TLS verification settings for one push
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TlsOptions {
    /// Accept any server certificate
    pub insecure_skip_verify: bool,
    /// PEM bundle of extra trust anchors
    pub ca_bundle: Option<String>,
}

/// Everything the engine needs to commit and push one object
#[derive(Clone, Debug, PartialEq)]
pub struct PushRequest {
    /// Repository the syncer watches
    pub upstream_repository: String,
    /// Branch the syncer watches
    pub upstream_branch: String,
    /// Repository to push to
    pub target_repository: String,
    /// Branch to push to
    pub target_branch: String,
    /// How target catches up with upstream when they differ
    pub merge_strategy: Option<MergeStrategy>,
    /// Author/committer name
    pub author_name: String,
    /// Author/committer email
    pub author_email: String,
    /// Credential for the target server
    pub credential: GitCredential,
    /// Object being committed
    pub object: ObjectDescriptor,
    /// Admission operation name (CREATE, UPDATE, DELETE, CONNECT)
    pub operation: String,
    /// Serialized YAML, absent for deletions
    pub content: Option<String>,
    /// Directory under which objects are written
    pub root_path: String,
    /// TLS verification settings
    pub tls: TlsOptions,
}

impl PushRequest {
    /// What happens to the object's file for this request's operation
    pub fn file_action(&self) -> FileAction {
        FileAction::for_operation(&self.operation)
    }

    /// Path of the object's file inside the repository
    pub fn path(&self) -> String {
        object_path(&self.root_path, &self.object)
    }

    /// Commit message naming the operation and the object
    pub fn commit_message(&self) -> String {
        format!("{} {}", self.operation, self.object)
    }
}

/// Result of a successful push
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PushOutcome {
    /// Commit at the tip of the target branch after the push
    pub commit_hash: String,
    /// File written or removed
    pub path: String,
}

/// Pushes one object to one target branch
#[cfg_attr(test, automock)]
#[async_trait]
pub trait GitPusher: Send + Sync {
    /// Commit and push the object described by `request`
    async fn push(&self, request: PushRequest) -> Result<PushOutcome, GitError>;
}

/// Host part of a repository URL, without scheme, credentials, port or path
pub fn repository_host(url: &str) -> Option<String> {
    let rest = url.split_once("://").map(|(_, r)| r)?;
    let authority = rest.split('/').next().unwrap_or_default();
    let host_port = authority.rsplit('@').next().unwrap_or(authority);
    let host = match host_port.strip_prefix('[') {
        // IPv6 literal
        Some(v6) => v6.split(']').next().unwrap_or(v6),
        None => host_port.split(':').next().unwrap_or(host_port),
    };
    if host.is_empty() {
        None
    } else {
        Some(host.to_lowercase())
    }
}

/// Whether a RemoteUser's host designates the repository's server.
///
/// `fqdn` may carry a port (`git.local:3000`); it then has to match the URL's
/// authority exactly, otherwise the bare hosts are compared.
pub fn host_matches(fqdn: &str, url: &str) -> bool {
    let fqdn = fqdn.trim().to_lowercase();
    if fqdn.contains(':') {
        return url
            .split_once("://")
            .map(|(_, rest)| rest.split('/').next().unwrap_or_default())
            .map(|authority| authority.rsplit('@').next().unwrap_or(authority).to_lowercase())
            .is_some_and(|authority| authority == fqdn);
    }
    repository_host(url).is_some_and(|host| host == fqdn)
}

/// Repository URL with trailing `/` and `.git` removed, for comparisons
pub fn normalize_repository(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches('/');
    trimmed.strip_suffix(".git").unwrap_or(trimmed).to_string()
}

/// Whether two URLs designate the same repository
pub fn same_repository(a: &str, b: &str) -> bool {
    normalize_repository(a) == normalize_repository(b)
}

/// Whether a URL is accepted as a repository location: `^(https?|git)://[^ ]+$`
pub fn is_valid_repository_url(url: &str) -> bool {
    let Some((scheme, rest)) = url.split_once("://") else {
        return false;
    };
    matches!(scheme, "http" | "https" | "git") && !rest.is_empty() && !rest.contains(' ')
}
