//! End-to-end integration tests for the kommit operator
//!
//! These tests require a Kubernetes cluster to run. They are ignored by default
//! and can be run with:
//!
//! ```bash
//! cargo test --test kind -- --ignored
//! ```
//!
//! The current kubeconfig context is used; the CRDs are installed if missing.

mod kind_tests;
