mod cli;
mod shutdown;

use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use faunaproc_core::config::Config;
use faunaproc_engine::{Dispatcher, ShutdownSignal};

use crate::cli::Cli;
use crate::shutdown::spawn_ctrl_c_handler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let mut config = Config::load(cli.config_file.as_deref())?;
    if let Some(api_url) = cli.api_url() {
        config.api_url = api_url;
    }
    if let Some(user) = cli.user.clone() {
        config.api_user = user;
    }
    if let Some(password) = cli.password.clone() {
        config.api_password = password;
    }

    info!(
        api = %config.api_url,
        "starting faunaproc {}",
        env!("CARGO_PKG_VERSION")
    );

    let dispatcher = Dispatcher::connect(Arc::new(config)).await?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::mpsc::unbounded_channel::<ShutdownSignal>();
    spawn_ctrl_c_handler(shutdown_tx);

    dispatcher.run(shutdown_rx).await
}
