use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "kubetemplater-operator")]
#[command(about = "Reconciliation engine for the KubeTemplate custom resource")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check cluster connectivity and permissions
    Check,

    /// Manage the KubeTemplate and KubeTemplatePolicy CRDs
    Crd {
        #[command(subcommand)]
        action: CrdAction,
    },

    /// Run the reconciliation engine (controllers + worker pool)
    Operator {
        /// Namespace the operator itself runs in (where KubeTemplatePolicy
        /// objects and the webhook's TLS secret live).
        #[arg(long, env = "OPERATOR_NAMESPACE", default_value = "kubetemplater-system")]
        namespace: String,
    },

    /// Manage the validating admission webhook
    Webhook {
        #[command(subcommand)]
        action: WebhookAction,
    },
}

#[derive(Subcommand)]
pub enum CrdAction {
    /// Print the CRD YAML to stdout
    Generate,

    /// Install the CRDs into the connected cluster
    Install,
}

#[derive(Subcommand)]
pub enum WebhookAction {
    /// Start the admission webhook HTTPS server
    Serve {
        #[arg(long, default_value = "0.0.0.0:8443")]
        addr: String,
        /// Name of the Secret holding `tls.crt`/`tls.key`, hot-reloaded on change
        #[arg(long, default_value = "kubetemplater-webhook")]
        tls_secret_name: String,
        #[arg(long, env = "OPERATOR_NAMESPACE", default_value = "kubetemplater-system")]
        namespace: String,
    },
    /// Generate self-signed TLS certificates for development
    CertGenerate {
        #[arg(long, default_value = "kubetemplater-webhook")]
        service_name: String,
        #[arg(long, default_value = "kubetemplater-system")]
        namespace: String,
        #[arg(long, default_value = ".")]
        output_dir: String,
    },
    /// Print the ValidatingWebhookConfiguration YAML
    InstallConfig {
        #[arg(long, default_value = "kubetemplater-webhook")]
        service_name: String,
        #[arg(long, default_value = "kubetemplater-system")]
        namespace: String,
        #[arg(long)]
        ca_bundle_path: String,
    },
}
