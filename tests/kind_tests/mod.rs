//! Integration tests for kommit
//!
//! These tests require a Kubernetes cluster (kind) and tell the story of how
//! platform teams set up Git-backed interception.
//!
//! # Test Organization
//!
//! - `crd_operations`: Stories about creating and reading kommit resources
//!   through the Kubernetes API
//!
//! - `syncer_lifecycle`: Stories about the RemoteSyncer reconciler installing
//!   and removing its webhook entry and generated targets
//!
//! # Running These Tests
//!
//! ```bash
//! cargo test --test kind -- --ignored
//! ```

mod crd_operations;
mod helpers;
mod syncer_lifecycle;
