use std::sync::Arc;

use anyhow::Result;
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use horoscopo_gen::{ChatCompletionGenerator, GenerationJob, JobConfig};
use horoscopo_store::PgForecastStore;

#[derive(Debug, Parser)]
#[command(name = "horoscopo-cli")]
#[command(about = "Daily horoscope generation service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the HTTP trigger (and the cron scheduler, if enabled).
    Serve,
    /// Run one generation pass and exit.
    RunOnce {
        /// Target day (YYYY-MM-DD); defaults to today (UTC).
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Apply pending database migrations.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            horoscopo_web::serve_from_env().await?;
        }
        Commands::RunOnce { date } => {
            let config = JobConfig::from_env()?;
            let store = Arc::new(PgForecastStore::connect(&config.database_url).await?);
            let generator = Arc::new(ChatCompletionGenerator::new(&config)?);
            let job = GenerationJob::new(store, generator);

            let day = date.unwrap_or_else(|| Utc::now().date_naive());
            let summary = job.run(day).await?;
            println!(
                "run complete: run_id={} day={} count={}",
                summary.run_id,
                summary.day,
                summary.outcome.count()
            );
        }
        Commands::Migrate => {
            let config = JobConfig::from_env()?;
            let store = PgForecastStore::connect(&config.database_url).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
    }

    Ok(())
}
