mod cli;
mod commands;
mod output;

use appforge::{EngineConfig, Error as ForgeError};
use clap::Parser;
use cli::{Cli, Commands};
use output::{CliOutput, OutputSink, QuietOutput, UserOutput};
use std::sync::Arc;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        if let Some(forge_error) = e.downcast_ref::<ForgeError>() {
            eprintln!("Error: {}", forge_error);
            if let ForgeError::StepFailure(failure) = forge_error {
                if !failure.stderr.trim().is_empty() {
                    eprintln!("\n{}", failure.stderr.trim_end());
                }
            }
            if let Some(suggestion) = forge_error.suggestion() {
                eprintln!("\nHint: {}", suggestion);
            }
        } else {
            eprintln!("Error: {:#}", e);
        }
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let out: Arc<dyn UserOutput> = if cli.quiet {
        Arc::new(QuietOutput)
    } else {
        Arc::new(CliOutput)
    };

    let root = EngineConfig::resolve_root(cli.root.clone());
    let config = EngineConfig::load(&root)?;
    tracing::debug!("Managed root: {}", root.display());

    let engine = appforge::Engine::builder()
        .config(config)
        .progress_sink(Arc::new(OutputSink(out.clone())))
        .build()
        .await?;

    let result = match cli.command {
        Commands::Install { name, source } => {
            commands::run_install(&engine, &name, &source, out.as_ref()).await
        }
        Commands::Run { name } => commands::run_run(&engine, &name, out.as_ref()).await,
        Commands::Stop { name } => commands::run_stop(&engine, &name, out.as_ref()).await,
        Commands::Uninstall { name } => {
            commands::run_uninstall(&engine, &name, out.as_ref()).await
        }
        Commands::Status { name, json } => {
            commands::run_status(&engine, name.as_deref(), json, out.as_ref()).await
        }
        Commands::Facts => commands::run_facts(&engine).await,
        Commands::Logs { name, tail, follow } => {
            commands::run_logs(&engine, &name, tail, follow).await
        }
        Commands::Exec { script } => commands::run_exec(&engine, &script, out.as_ref()).await,
    };

    engine.shutdown();
    result
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
