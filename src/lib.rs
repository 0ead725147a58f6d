//! kommit - Kubernetes operator that turns resource changes into Git commits
//!
//! kommit programs a validating admission webhook per RemoteSyncer. When a
//! user changes an intercepted resource, the webhook resolves the user's Git
//! identity, serializes the object to YAML, pushes it to the configured
//! repository as that user, and then allows or denies the original request.
//!
//! # Modules
//!
//! - [`crd`] - RemoteSyncer, RemoteUser, RemoteUserBinding and RemoteTarget
//! - [`fieldpath`] - Field-path filter applied before serialization
//! - [`git`] - Git push engine (libgit2)
//! - [`identity`] - Caller to Git identity resolution
//! - [`pipeline`] - Per-request decision pipeline
//! - [`webhook`] - Admission and conversion HTTP server
//! - [`controller`] - Reconcilers
//! - [`conversion`] - Schema version conversion
//! - [`rbac`] - SubjectAccessReview checks
//! - [`client`] - Kubernetes access traits and their real implementation
//! - [`config`] - Operator configuration
//! - [`events`] - Kubernetes Event publishing
//! - [`error`] - Error types for the operator

pub mod client;
pub mod config;
pub mod controller;
pub mod conversion;
pub mod crd;
pub mod error;
pub mod events;
pub mod fieldpath;
pub mod git;
pub mod identity;
pub mod pipeline;
pub mod rbac;
pub mod retry;
pub mod webhook;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Well-known names
// =============================================================================

/// API group of every kommit CRD
pub const API_GROUP: &str = "kommit.dev";

/// Annotation on a RemoteUser opting into the default RemoteUserBinding
pub const ASSOCIATION_ANNOTATION: &str = "kommit.dev/associated-remote-userbinding";

/// Label marking objects kommit created and owns
pub const MANAGED_BY_LABEL: &str = "kommit.dev/managed-by";

/// [`MANAGED_BY_LABEL`] value on generated RemoteTargets
pub const MANAGED_BY_KOMMIT: &str = "kommit";

/// [`MANAGED_BY_LABEL`] value on default RemoteUserBindings
pub const MANAGED_BY_ASSOCIATION: &str = "kommit-association";

/// Label naming the RemoteSyncer a generated RemoteTarget belongs to
pub const SYNCER_LABEL: &str = "kommit.dev/syncer";

/// Label naming the pattern that generated a RemoteTarget
pub const TARGET_PATTERN_LABEL: &str = "kommit.dev/target-pattern";

/// Finalizer guarding webhook cleanup on RemoteSyncer deletion
pub const SYNCER_FINALIZER: &str = "kommit.dev/remotesyncer-cleanup";

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Default HTTPS port of the webhook server
pub const DEFAULT_WEBHOOK_PORT: u16 = 9443;

/// `timeoutSeconds` on every dynamic webhook entry (apiserver maximum)
pub const WEBHOOK_TIMEOUT_SECONDS: i32 = 30;

/// Deadline for the push stage, kept below [`WEBHOOK_TIMEOUT_SECONDS`]
pub const PUSH_DEADLINE: std::time::Duration = std::time::Duration::from_secs(25);
