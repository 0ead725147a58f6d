//! Operator configuration
//!
//! Every setting is a command-line flag with an environment fallback, so the
//! same binary runs from a Deployment manifest or a developer shell.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use clap::Parser;
use tracing::{debug, warn};

use crate::controller::WebhookSettings;

/// kommit - commit Kubernetes resource changes to Git as the calling user
#[derive(Parser, Debug, Clone)]
#[command(name = "kommit", version, about, long_about = None)]
pub struct Args {
    /// Print the CRD manifests and exit
    #[arg(long)]
    pub crd: bool,

    /// Namespace the operator runs in
    #[arg(long, env = "MANAGER_NAMESPACE", default_value = "kommit-system")]
    pub namespace: String,

    /// Point webhooks at a URL on the developer's machine instead of the Service
    #[arg(long, env = "DEV_MODE", default_value_t = false)]
    pub dev_mode: bool,

    /// Host the apiserver reaches the webhook server through in dev mode
    #[arg(long, env = "DEV_WEBHOOK_HOST", default_value = "host.docker.internal")]
    pub dev_webhook_host: String,

    /// Name of the shared ValidatingWebhookConfiguration
    #[arg(
        long,
        env = "DYNAMIC_WEBHOOK_NAME",
        default_value = "kommit-remotesyncer-interceptor"
    )]
    pub webhook_config_name: String,

    /// Directory holding `tls.crt`, `tls.key` and optionally `ca.crt`
    #[arg(
        long,
        env = "WEBHOOK_CERT_DIR",
        default_value = "/tmp/k8s-webhook-server/serving-certs"
    )]
    pub cert_dir: PathBuf,

    /// HTTPS port of the webhook server
    #[arg(long, env = "WEBHOOK_PORT", default_value_t = crate::DEFAULT_WEBHOOK_PORT)]
    pub webhook_port: u16,

    /// Service fronting the webhook server
    #[arg(long, env = "WEBHOOK_SERVICE_NAME", default_value = "kommit-webhook-service")]
    pub webhook_service: String,

    /// Where repository clones are cached
    #[arg(long, env = "GIT_CACHE_DIR", default_value = "/tmp/kommit-git-cache")]
    pub git_cache_dir: PathBuf,
}

impl Args {
    /// Address the webhook server binds
    pub fn webhook_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.webhook_port))
    }

    /// Webhook settings with the CA bundle found in the cert directory
    pub fn webhook_settings(&self) -> WebhookSettings {
        WebhookSettings {
            config_name: self.webhook_config_name.clone(),
            service_namespace: self.namespace.clone(),
            service_name: self.webhook_service.clone(),
            dev_mode: self.dev_mode,
            dev_host: self.dev_webhook_host.clone(),
            port: self.webhook_port,
            ca_bundle: load_ca_bundle(&self.cert_dir),
        }
    }
}

/// PEM bundle the apiserver should trust: `ca.crt`, else the serving `tls.crt`
pub fn load_ca_bundle(cert_dir: &Path) -> Option<Vec<u8>> {
    for file in ["ca.crt", "tls.crt"] {
        let path = cert_dir.join(file);
        match std::fs::read(&path) {
            Ok(bytes) if !bytes.is_empty() => {
                debug!(path = %path.display(), "Loaded webhook CA bundle");
                return Some(bytes);
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Could not read CA bundle"),
        }
    }
    None
}
