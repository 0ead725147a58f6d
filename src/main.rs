//! kommit operator - commits intercepted Kubernetes changes to Git

use std::sync::Arc;

use clap::Parser;
use k8s_openapi::api::admissionregistration::v1::ValidatingWebhookConfiguration;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use kommit::client::KubeClientImpl;
use kommit::config::Args;
use kommit::controller::webhook_config::build_configuration_webhooks;
use kommit::controller::{run_controllers, Context, WebhookSettings};
use kommit::conversion::with_conversion_webhook;
use kommit::crd::all_crds;
use kommit::webhook::{self, PathRegistry, WebhookState};

const FIELD_MANAGER: &str = "kommit-controller";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.crd {
        for crd in all_crds()? {
            println!("---");
            print!("{}", serde_yaml::to_string(&crd)?);
        }
        return Ok(());
    }

    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("Failed to install the rustls crypto provider: {e:?}");
        std::process::exit(1);
    }

    init_tracing();

    let client = Client::try_default().await?;
    let settings = args.webhook_settings();
    if settings.ca_bundle.is_none() {
        tracing::warn!(cert_dir = %args.cert_dir.display(), "No CA bundle found; the apiserver must already trust the webhook certificate");
    }

    ensure_crds_installed(&client, &settings).await?;
    ensure_configuration_webhooks(&client, &settings).await?;

    let registry = Arc::new(PathRegistry::new());
    let kube = Arc::new(KubeClientImpl::new(client.clone()));
    let state = Arc::new(WebhookState::new(
        registry.clone(),
        kube.clone(),
        kube.clone(),
        kube,
    ));

    let ctx = Arc::new(
        Context::builder(client.clone())
            .settings(settings)
            .git_cache_dir(&args.git_cache_dir)
            .registry(registry)
            .build(),
    );

    tracing::info!(
        namespace = %args.namespace,
        port = args.webhook_port,
        dev_mode = args.dev_mode,
        "Starting kommit"
    );

    tokio::select! {
        result = webhook::serve(state, args.webhook_addr(), &args.cert_dir) => {
            result?;
            tracing::info!("Webhook server stopped");
        }
        _ = run_controllers(client, ctx) => {
            tracing::info!("Controllers stopped");
        }
    }

    tracing::info!("kommit shutting down");
    Ok(())
}

/// `RUST_LOG` filtering, JSON lines when `LOG_FORMAT=json`
fn init_tracing() {
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(EnvFilter::from_default_env());
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

/// Install every CRD with all served versions and the conversion webhook
async fn ensure_crds_installed(client: &Client, settings: &WebhookSettings) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for crd in all_crds()? {
        let crd = with_conversion_webhook(crd, settings);
        let name = crd.name_any();
        tracing::info!(crd = %name, "Installing CRD");
        crds.patch(&name, &params, &Patch::Apply(&crd))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to install CRD {name}: {e}"))?;
    }

    tracing::info!("All kommit CRDs installed/updated");
    Ok(())
}

/// Install the webhooks validating kommit's own resources
async fn ensure_configuration_webhooks(client: &Client, settings: &WebhookSettings) -> anyhow::Result<()> {
    let config = build_configuration_webhooks(settings);
    let name = config.name_any();
    let api: Api<ValidatingWebhookConfiguration> = Api::all(client.clone());
    api.patch(&name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&config))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to install {name}: {e}"))?;

    tracing::info!(config = %name, "Configuration webhooks installed");
    Ok(())
}
