mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, CrdAction, Commands, WebhookAction};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Check => commands::check::run().await?,
        Commands::Crd { action } => match action {
            CrdAction::Generate => commands::crd::generate()?,
            CrdAction::Install => commands::crd::install().await?,
        },
        Commands::Operator { namespace } => commands::operator::run(namespace).await?,
        Commands::Webhook { action } => match action {
            WebhookAction::Serve {
                addr,
                tls_secret_name,
                namespace,
            } => commands::webhook::serve(&addr, &tls_secret_name, &namespace).await?,
            WebhookAction::CertGenerate {
                service_name,
                namespace,
                output_dir,
            } => commands::webhook::generate_certs(&service_name, &namespace, &output_dir)?,
            WebhookAction::InstallConfig {
                service_name,
                namespace,
                ca_bundle_path,
            } => commands::webhook::install_config(&service_name, &namespace, &ca_bundle_path)?,
        },
    }

    Ok(())
}
