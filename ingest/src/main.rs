mod config;
mod content;
mod db;
mod error;
#[cfg(test)]
mod test_utils;

use clap::{Parser, Subcommand};
use std::{env, path::PathBuf, sync::Arc};
use tracing_subscriber::EnvFilter;

use crate::content::manager::{AddFileOptions, ContentManager};
use crate::db::{Database, SqliteCatalog};

#[derive(Parser, Debug)]
#[command(name = "ingest", about = "Media catalog ingestion service")]
struct Args {
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Keep the catalog in sync with the configured autoscan directories.
    Serve,
    /// Import a file or directory tree once.
    Import {
        path: PathBuf,
        #[arg(long)]
        no_recursive: bool,
        #[arg(long)]
        hidden: bool,
    },
    /// Remove a catalog object and its subtree.
    Remove {
        id: i64,
        /// Resolve a reference to its real object and remove every reference.
        #[arg(long)]
        all: bool,
    },
    /// Create a container chain such as `/Audio/Artists/AC\/DC`.
    Chain {
        chain: String,
        #[arg(long, value_name = "CLASS")]
        class: Option<String>,
    },
    /// Print the effective settings.
    Settings,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let args = Args::parse();
    let config_path = args
        .config
        .or_else(|| env::var(config::CONFIG_PATH_ENV).ok().map(PathBuf::from));
    let settings = config::Settings::load(config_path)?;
    let command = args.command.unwrap_or(Command::Serve);
    if let Command::Settings = command {
        print!("{}", settings.to_toml()?);
        return Ok(());
    }

    let db: Arc<dyn Database> = Arc::new(SqliteCatalog::open(&settings.database.path).await?);
    let manager = ContentManager::start(db, settings.content_options()).await?;

    let result = run(&manager, &settings, command).await;
    manager.shutdown().await?;
    result
}

async fn run(
    manager: &ContentManager,
    settings: &config::Settings,
    command: Command,
) -> anyhow::Result<()> {
    match command {
        Command::Settings => print!("{}", settings.to_toml()?),
        Command::Serve => {
            for dir in settings.autoscan_directories() {
                manager.set_autoscan_directory(dir).await?;
            }
            tracing::info!(
                autoscans = manager.autoscan_directories().len(),
                "watching autoscan directories"
            );
            tokio::signal::ctrl_c().await?;
            tracing::info!("shutting down");
        }
        Command::Import {
            path,
            no_recursive,
            hidden,
        } => {
            let path = if path.is_absolute() {
                path
            } else {
                env::current_dir()?.join(path)
            };
            let options = AddFileOptions {
                recursive: !no_recursive,
                hidden: hidden || manager.default_add_options().hidden,
                low_priority: false,
            };
            manager.add_file(&path, options, false).await?;
            manager.load_accounting(false).await?;
            tracing::info!(
                path = %path.display(),
                total_files = manager.accounting().total_files,
                "import finished"
            );
        }
        Command::Remove { id, all } => {
            manager.remove_object(id, all, false).await?;
            tracing::info!(id, "object removed");
        }
        Command::Chain { chain, class } => {
            let id = manager.add_container_chain(&chain, class.as_deref()).await?;
            println!("{id}");
        }
    }
    Ok(())
}
