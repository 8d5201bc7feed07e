//! OCI registry server
//!
//! Run with: cargo run -p registry --features cli -- --config registry.toml

use std::net::SocketAddr;

use camino::Utf8PathBuf;
use clap::Parser;
use eyre::WrapErr;
use registry::config::RegistryConfig;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<Utf8PathBuf>,

    /// Address to listen on, overriding the configuration
    #[arg(short, long)]
    listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => {
            let text = tokio::fs::read_to_string(path)
                .await
                .wrap_err_with(|| format!("reading {path}"))?;
            RegistryConfig::from_toml(&text).wrap_err_with(|| format!("parsing {path}"))?
        }
        None => RegistryConfig::default(),
    };
    if let Some(listen) = args.listen {
        config.listen = listen;
    }

    let addr = config.listen;
    let app = config
        .into_builder()
        .await
        .wrap_err("configuring registry")?
        .build()
        .wrap_err("building registry")?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("binding {addr}"))?;

    tracing::info!("OCI Registry listening on http://{}", addr);
    tracing::info!("Try: curl http://{}/v2/", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
