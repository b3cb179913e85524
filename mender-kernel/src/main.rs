/**
 * MENDER KERNEL - Entry point of the self-healing coordinator
 *
 * ROLE: loads configuration (.env, YAML, MENDER_* overrides), picks the
 * fixer backend, starts every listener and runs until Ctrl-C.
 */

use anyhow::{Context, Result};
use mender_kernel::config::load_config;
use mender_kernel::{start, CommandFixer, Fixer, UnconfiguredFixer};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mender_kernel=info")),
        )
        .init();

    let config = load_config().await.context("failed to load configuration")?;

    let fixer: Arc<dyn Fixer> = match config.remediation.fixer.command.as_deref() {
        Some(line) if !line.trim().is_empty() => {
            let fixer = CommandFixer::from_command_line(line).context("invalid fixer command")?;
            info!(program = %fixer.program(), "using command fixer");
            Arc::new(fixer)
        }
        _ => {
            warn!("no fixer command configured, remediation jobs will fail");
            Arc::new(UnconfiguredFixer)
        }
    };

    let mut kernel = start(&config, fixer).await.context("failed to start kernel")?;

    tokio::select! {
        _ = kernel.wait() => warn!("a listener stopped, shutting down"),
        res = tokio::signal::ctrl_c() => {
            res.context("cannot listen for ctrl-c")?;
            info!("shutdown requested");
        }
    }
    kernel.shutdown();
    Ok(())
}
