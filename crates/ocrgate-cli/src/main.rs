use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing_subscriber::EnvFilter;

use ocrgate_backends::builtin_catalog;
use ocrgate_core::RecognitionOptions;
use ocrgate_pipeline::Dispatcher;

mod cli;
mod config;

use cli::{Cli, Command};
use config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();

    tracing::info!("ocrgate v{}", env!("CARGO_PKG_VERSION"));

    let config = match &cli.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::from_preset(cli.preset),
    };
    let dispatcher = Arc::new(Dispatcher::from_config(
        config.gateway,
        builtin_catalog(&config.backends),
    )?);

    let outcome = tokio::select! {
        outcome = run(cli.command, dispatcher.clone()) => outcome,
        _ = shutdown_signal() => {
            tracing::warn!("interrupted; abandoning in-flight requests");
            Ok(())
        }
    };

    dispatcher.shutdown().await;
    outcome
}

async fn run(command: Command, dispatcher: Arc<Dispatcher>) -> anyhow::Result<()> {
    match command {
        Command::Process {
            input,
            backend,
            kind,
            format,
            pages,
            language,
            timeout,
        } => {
            let options = RecognitionOptions {
                pages: pages.as_deref().map(cli::parse_pages).transpose()?,
                language,
                timeout_secs: timeout,
                ..RecognitionOptions::default()
            };
            cli::process_file(&dispatcher, &input, &backend, kind, format, options).await?;
        }
        Command::Batch {
            input_dir,
            output_dir,
            backend,
            format,
            concurrency,
        } => {
            let summary = cli::run_batch(
                dispatcher,
                &input_dir,
                &output_dir,
                &backend,
                format,
                concurrency,
            )
            .await?;
            if summary.failed > 0 {
                anyhow::bail!("{} of the files failed", summary.failed);
            }
        }
        Command::Backends { warmup } => {
            if warmup {
                dispatcher.warmup().await;
            }
            println!("{}", serde_json::to_string_pretty(&dispatcher.health())?);
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
}
