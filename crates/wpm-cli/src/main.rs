use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use wpm_core::EntityKind;

#[derive(Debug, Parser)]
#[command(name = "wpm-cli")]
#[command(about = "Webflow to Payload migration command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the migration, optionally restricted to one entity type
    /// (contributors, projects, faqs, posts, updates, matching-donors).
    Migrate {
        #[arg(long)]
        entity: Option<EntityKind>,
    },
    /// Print briefs for recent migration runs.
    Report {
        #[arg(long, default_value_t = 3)]
        runs: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Migrate { entity: None }) {
        Commands::Migrate { entity } => {
            let config = wpm_sync::MigrationConfig::from_env()?;
            let pipeline = wpm_sync::MigrationPipeline::new(config)?;
            let summary = match entity {
                Some(kind) => pipeline.run_entities(&[kind]).await?,
                None => pipeline.run_once().await?,
            };
            println!(
                "migration {}: run_id={} entities={} failed_records={}",
                summary.status,
                summary.run_id,
                summary.entities.len(),
                summary.total_failed()
            );
        }
        Commands::Report { runs } => {
            let report = wpm_sync::report_recent_markdown(runs, None)?;
            println!("{report}");
        }
    }

    Ok(())
}
