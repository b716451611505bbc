//! Hark CLI entry point.

use clap::Parser;
use hark::cli::{commands, Cli, Commands, Output};
use hark::config::Settings;
use hark::error::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => {}
        Err(e) => {
            Output::error(&format!("[{}] {}", e.tag(), e));
            std::process::exit(e.exit_code());
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    // Load configuration (applies environment overrides).
    let settings = match &cli.config {
        Some(path) => Settings::load_from(Some(&std::path::PathBuf::from(path)))?,
        None => Settings::load()?,
    };

    // Initialize logging: -v flags win over the configured level.
    let log_level = match cli.verbose {
        0 => settings.general.log_level.clone(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    };

    tracing_subscriber::registry()
        .with(EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| format!("hark={}", log_level)),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    // Ensure the data layout exists before any component opens it.
    std::fs::create_dir_all(settings.data_root())?;

    match &cli.command {
        Commands::Process {
            urls,
            fake_asr,
            language,
        } => {
            commands::run_process(urls, *fake_asr, language.as_deref(), settings).await?;
        }

        Commands::Query {
            text,
            top_k,
            variant,
        } => {
            commands::run_query(text, *top_k, variant.as_deref(), settings).await?;
        }

        Commands::Status => {
            commands::run_status(settings).await?;
        }

        Commands::Evaluate {
            cases,
            variants,
            k,
            output,
        } => {
            commands::run_evaluate(cases, variants.as_deref(), *k, output.as_deref(), settings)
                .await?;
        }

        Commands::IngestJob { urls } => {
            commands::run_ingest_job(urls, settings).await?;
        }

        Commands::RunIngestion { all, watch } => {
            commands::run_ingestion(*all, *watch, settings).await?;
        }

        Commands::Dashboard => {
            commands::run_dashboard(settings).await?;
        }

        Commands::Serve { host, port } => {
            commands::run_serve(host, *port, settings).await?;
        }
    }

    Ok(())
}
