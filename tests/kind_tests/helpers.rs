//! Shared setup for cluster tests

use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, DeleteParams, ObjectMeta, Patch, PatchParams};
use kube::{Client, ResourceExt};

use kommit::crd::all_crds;

/// Connect to the current context and make sure the CRDs are present
pub async fn ensure_test_cluster() -> anyhow::Result<Client> {
    let client = Client::try_default().await?;
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply("kommit-integration-test").force();
    for crd in all_crds()? {
        let name = crd.name_any();
        crds.patch(&name, &params, &Patch::Apply(&crd)).await?;
    }
    // Give the apiserver a moment to start serving the new types
    tokio::time::sleep(Duration::from_secs(2)).await;
    Ok(client)
}

/// Create (or keep) a namespace for one test
pub async fn ensure_namespace(client: &Client, name: &str) -> anyhow::Result<()> {
    let api: Api<Namespace> = Api::all(client.clone());
    let ns = Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(BTreeMap::from([(
                "kommit.dev/integration-test".to_string(),
                "true".to_string(),
            )])),
            ..Default::default()
        },
        ..Default::default()
    };
    api.patch(
        name,
        &PatchParams::apply("kommit-integration-test").force(),
        &Patch::Apply(&ns),
    )
    .await?;
    Ok(())
}

/// Delete a test namespace, ignoring errors
pub async fn cleanup_namespace(client: &Client, name: &str) {
    let api: Api<Namespace> = Api::all(client.clone());
    let _ = api.delete(name, &DeleteParams::default()).await;
}
