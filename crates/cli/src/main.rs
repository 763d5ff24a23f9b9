use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tagpipe_core::interner::{self, HashManager, TagManager};
use tagpipe_core::merger::Merger;
use tagpipe_core::scanner::Scanner;
use tagpipe_core::weighter::Weighter;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            interners,
            scanner,
            merger,
            weighter,
        } => run(interners, scanner, merger, weighter).await,
        Commands::Migrate { database } => migrate(&database).await,
    }
}

#[derive(Parser)]
#[command(name = "tagpipe")]
#[command(about = "Tag-driven image pipeline", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the configured pipeline stages until interrupted
    Run {
        /// Interner configuration path (file or directory)
        #[arg(long, default_value = "conf/interners")]
        interners: String,
        /// Scanner configuration path; omit to skip the stage
        #[arg(long)]
        scanner: Option<String>,
        /// Merger configuration path; omit to skip the stage
        #[arg(long)]
        merger: Option<String>,
        /// Weighter configuration path; omit to skip the stage
        #[arg(long)]
        weighter: Option<String>,
    },
    /// Apply the reference store schema to a database
    Migrate {
        /// Database path or sqlite URL
        database: String,
    },
}

async fn run(
    interners: String,
    scanner: Option<String>,
    merger: Option<String>,
    weighter: Option<String>,
) -> Result<()> {
    if scanner.is_none() && merger.is_none() && weighter.is_none() {
        anyhow::bail!("nothing to run: pass at least one of --scanner/--merger/--weighter");
    }

    let cancel = CancellationToken::new();
    let iconf = interner::load_conf(std::path::Path::new(&interners)).await?;
    let tm = TagManager::connect(&iconf).await?;
    let hm = HashManager::connect(&iconf).await?;

    let mut scanner_stage = None;
    if let Some(path) = scanner {
        let stage = Scanner::new(
            path,
            Arc::clone(&tm) as Arc<dyn tagpipe_core::tags::TagSource>,
            Arc::clone(&hm) as Arc<dyn interner::HashSource>,
            cancel.clone(),
        )
        .await?;
        stage.start();
        info!("scanner running");
        scanner_stage = Some(stage);
    }

    let mut merger_stage = None;
    if let Some(path) = merger {
        let stage = Merger::new(
            path,
            Arc::clone(&tm) as Arc<dyn tagpipe_core::tags::TagSource>,
            cancel.clone(),
        )
        .await?;
        stage.start().await?;
        info!("merger running");
        merger_stage = Some(stage);
    }

    let mut weighter_stage = None;
    if let Some(path) = weighter {
        let stage = Weighter::new(
            path,
            Arc::clone(&tm) as Arc<dyn tagpipe_core::tags::TagSource>,
            cancel.clone(),
        )
        .await?;
        stage.start().await?;
        info!("weighter running");
        weighter_stage = Some(stage);
    }

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, shutting down");
    cancel.cancel();
    if let Some(stage) = &scanner_stage {
        stage.close();
    }
    if let Some(stage) = &merger_stage {
        stage.close();
    }
    if let Some(stage) = &weighter_stage {
        stage.close();
    }
    tm.close();
    hm.close();
    // Give in-flight transactions a moment to roll back and pools to
    // drain before the process exits.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    Ok(())
}

async fn migrate(database: &str) -> Result<()> {
    let pool = storage::connect(database).await?;
    storage::migrate(&pool).await?;
    println!("schema applied to {database}");
    Ok(())
}
