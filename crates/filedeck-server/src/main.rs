//! filedeck server binary
//!
//! Serves file-manager commands as newline-delimited JSON on stdin/stdout.
//!
//! ## Usage
//!
//! ```bash
//! # Volumes from a config file
//! filedeck-server --config filedeck.toml
//!
//! # Quick local mounts
//! filedeck-server --volume ~/Documents --volume /srv/share
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::BufReader;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use filedeck_kernel::{Dispatcher, KernelConfig, VolumeConfig};

/// File-manager command server over stdio.
#[derive(Parser, Debug)]
#[command(name = "filedeck-server")]
#[command(about = "Serve filedeck commands as newline-delimited JSON on stdio")]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Staging directory for uploads, thumbnails and scratch files
    #[arg(long)]
    staging_dir: Option<PathBuf>,

    /// Mount a local directory as a volume (repeatable)
    #[arg(long = "volume", value_name = "ROOT")]
    volumes: Vec<PathBuf>,
}

impl Args {
    fn kernel_config(&self) -> Result<KernelConfig> {
        let mut config = match &self.config {
            Some(path) => KernelConfig::load(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => KernelConfig::default(),
        };
        if let Some(dir) = &self.staging_dir {
            config.staging_dir = Some(dir.clone());
        }
        for root in &self.volumes {
            let root = std::fs::canonicalize(root)
                .with_context(|| format!("volume root {}", root.display()))?;
            config
                .volumes
                .push(VolumeConfig::local(root.to_string_lossy()));
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("Server error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let config = args.kernel_config()?;
    if config.volumes.is_empty() {
        tracing::warn!("no volumes configured; only netmount will be useful");
    }
    let dispatcher = Dispatcher::from_config(config)
        .await
        .context("building dispatcher")?;
    tracing::info!(
        volumes = dispatcher.volumes().len(),
        staging = %dispatcher.staging().root().display(),
        "filedeck server ready on stdio"
    );

    let stdin = BufReader::new(tokio::io::stdin());
    filedeck_server::serve(Arc::new(dispatcher), stdin, tokio::io::stdout()).await?;
    tracing::info!("input closed, shutting down");
    Ok(())
}
