use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use racefeed_sync::{maybe_build_scheduler, Pipeline, PipelineConfig};
use tokio::sync::Mutex;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "racefeed")]
#[command(about = "Race event feed pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Crawl every enabled source into bronze.
    Crawl,
    /// Normalize pending bronze rows, or one bronze file, into silver.
    Silver {
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Publish the gold feed from the silver table.
    Gold,
    /// Crawl, silver and gold in one run.
    Run,
    /// Serve the feed over HTTP.
    Serve,
    /// Run the pipeline on the configured cron until interrupted.
    Schedule,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let json = std::env::var("RACEFEED_LOG_JSON").is_ok_and(|v| v == "1" || v == "true");
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init();
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("serializing summary")?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let today = Local::now().date_naive();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Serve => return racefeed_web::serve_from_env().await,
        Commands::Schedule => {
            let mut config = PipelineConfig::from_env();
            config.scheduler_enabled = true;
            let pipeline = Arc::new(Mutex::new(Pipeline::new(config).await?));
            let mut sched = maybe_build_scheduler(pipeline.clone())
                .await?
                .context("scheduler not configured")?;
            sched.start().await.context("starting scheduler")?;
            info!("scheduler started; waiting for ctrl-c");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
            pipeline.lock().await.close().await;
            return Ok(());
        }
        command => {
            let pipeline = Pipeline::new(PipelineConfig::from_env()).await?;
            let outcome = match command {
                Commands::Crawl => pipeline.run_crawl(today).await.and_then(|s| print_json(&s)),
                Commands::Silver { file: Some(path) } => pipeline
                    .run_silver_file(&path, today)
                    .await
                    .and_then(|s| print_json(&s)),
                Commands::Silver { file: None } => {
                    pipeline.run_silver(today).await.and_then(|s| print_json(&s))
                }
                Commands::Gold => pipeline.run_gold(today).await.and_then(|s| print_json(&s)),
                _ => pipeline.run_once(today).await.and_then(|s| print_json(&s)),
            };
            pipeline.close().await;
            outcome?;
        }
    }

    Ok(())
}
