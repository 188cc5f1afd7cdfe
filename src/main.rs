use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Terraform provider for PostgreSQL.
///
/// Normally launched by Terraform, which talks to it over gRPC. Run with
/// `--debug` to start it by hand and attach Terraform via
/// `TF_REATTACH_PROVIDERS`.
#[derive(Parser)]
#[command(name = "terraform-provider-postgresql", version, about, long_about = None)]
struct Cli {
    /// Serve without the plugin handshake and print reattach instructions
    #[arg(long)]
    debug: bool,
}

/// Log filter variable; Terraform forwards it to provider processes.
const LOG_ENV: &str = "TF_LOG_PROVIDER_POSTGRESQL";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // stdout carries the handshake, so logs go to stderr.
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(false)
        .init();

    pgprovider::plugin::server::serve(cli.debug).await
}
