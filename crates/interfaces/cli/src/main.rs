mod prompt;
mod telemetry;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use explorer_config::AppConfig;
use explorer_store::Document;
use explorer_sync::{DisableOptions, FixedFolder, FolderPicker, SyncController, SyncError};

use crate::prompt::PromptPicker;

const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

#[derive(Debug, Parser)]
#[command(
    name = "explorer",
    version,
    about = "Project catalog with optional shared-folder sync"
)]
struct Cli {
    /// Configuration file.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Show the persisted sync settings and document locations.
    Status,
    /// Move the catalog to a shared folder.
    Enable {
        /// Shared folder; prompted for when omitted.
        #[arg(long)]
        folder: Option<PathBuf>,
        /// Document to seed an empty shared folder with (defaults to the
        /// current catalog).
        #[arg(long)]
        seed: Option<PathBuf>,
    },
    /// Return to the local catalog.
    Disable {
        /// Keep the local catalog as it is instead of copying the shared one.
        #[arg(long)]
        no_copy: bool,
    },
    /// Print the catalog from the active location.
    Read,
    /// Replace the catalog with the JSON array in FILE.
    Write {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
    /// Write the catalog to PATH.
    Export {
        #[arg(value_name = "PATH")]
        path: PathBuf,
    },
    /// Replace the catalog with the (possibly hand-edited) document at PATH.
    Import {
        #[arg(value_name = "PATH")]
        path: PathBuf,
    },
    /// Follow sync events as JSON lines until interrupted.
    Watch,
}

/// Exit status for input the controller rejected before touching any state.
const EXIT_REJECTED: i32 = 2;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match run(cli).await {
        Err(err) if is_rejection(&err) => {
            eprintln!("error: {err}");
            std::process::exit(EXIT_REJECTED);
        }
        other => other,
    }
}

/// Validation failures are the user's to fix; everything else is a bug or
/// an environment problem and keeps its full error chain.
fn is_rejection(err: &anyhow::Error) -> bool {
    err.downcast_ref::<SyncError>()
        .is_some_and(SyncError::is_validation)
}

async fn run(cli: Cli) -> Result<()> {
    let config_exists = cli.config.exists();
    let config = AppConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if !config_exists {
        config
            .save_to(&cli.config)
            .with_context(|| format!("writing default config to {}", cli.config.display()))?;
    }
    let _log_guard = telemetry::init(&config)?;

    match cli.command.unwrap_or(Commands::Status) {
        Commands::Status => {
            let controller = SyncController::new(&config, Arc::new(FixedFolder::cancelled()));
            let settings = controller.get_sync_settings();
            println!("── sync status ──────────────────────────────────────");
            println!("  enabled        : {}", if settings.enabled { "yes" } else { "no" });
            println!("  shared folder  : {}", display_or_none(&settings.folder_path));
            println!("  local document : {}", config.local_document_path().display());
            println!("  settings file  : {}", config.settings_path().display());
        }
        Commands::Enable { folder, seed } => {
            let picker: Arc<dyn FolderPicker> = match folder {
                Some(folder) => Arc::new(FixedFolder::new(folder)),
                None => Arc::new(PromptPicker),
            };
            let controller = start(&config, picker).await?;
            let seed = resolve_seed(&controller, seed.as_deref()).await?;
            let outcome = controller.enable_sync(&seed).await?;
            if outcome.cancelled {
                println!("enabling sync cancelled");
            } else {
                println!("sync enabled: {}", outcome.folder_path);
            }
        }
        Commands::Disable { no_copy } => {
            let controller = start(&config, Arc::new(FixedFolder::cancelled())).await?;
            let outcome = controller
                .disable_sync(DisableOptions {
                    copy_to_local: !no_copy,
                })
                .await?;
            println!("sync disabled (last folder: {})", display_or_none(&outcome.folder_path));
        }
        Commands::Read => {
            let controller = start(&config, Arc::new(FixedFolder::cancelled())).await?;
            println!("{}", controller.read_document().await?);
        }
        Commands::Write { file } => {
            let raw = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let value: Value = serde_json::from_str(&raw)
                .with_context(|| format!("{} is not valid JSON", file.display()))?;
            let controller = start(&config, Arc::new(FixedFolder::cancelled())).await?;
            let target = controller.write_document_json(value).await?;
            println!("document written ({target:?})");
        }
        Commands::Export { path } => {
            let controller = start(&config, Arc::new(FixedFolder::cancelled())).await?;
            let document = controller.load_document().await?;
            controller.export_document(&document, &path).await?;
            println!("{} records exported to {}", document.len(), path.display());
        }
        Commands::Import { path } => {
            let controller = start(&config, Arc::new(FixedFolder::cancelled())).await?;
            let document = controller.import_document(&path).await?;
            println!("{} records imported from {}", document.len(), path.display());
        }
        Commands::Watch => run_watch(&config).await?,
    }

    Ok(())
}

/// Build the controller and resume any persisted sync session.
async fn start(config: &AppConfig, picker: Arc<dyn FolderPicker>) -> Result<Arc<SyncController>> {
    let controller = SyncController::new(config, picker);
    let mode = controller.initialize().await?;
    info!(?mode, "controller ready");
    Ok(controller)
}

async fn resolve_seed(controller: &SyncController, seed: Option<&Path>) -> Result<Document> {
    if let Some(path) = seed {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading seed {}", path.display()))?;
        return Document::parse_lenient(&raw).with_context(|| format!("parsing seed {}", path.display()));
    }

    match controller.load_document().await {
        Ok(document) => Ok(document),
        Err(SyncError::DocumentMissing(path)) => {
            warn!(path = %path.display(), "no local catalog yet; seeding with an empty one");
            Ok(Document::default())
        }
        Err(err) => Err(err.into()),
    }
}

async fn run_watch(config: &AppConfig) -> Result<()> {
    let controller = SyncController::new(config, Arc::new(FixedFolder::cancelled()));
    let mut events = controller.subscribe();
    let mode = controller.initialize().await?;
    info!(?mode, "watching for sync events; press Ctrl-C to stop");

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => println!("{}", serde_json::to_string(&event)?),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event consumer lagging"),
                Err(RecvError::Closed) => break,
            },
            _ = &mut shutdown => {
                info!("interrupted");
                break;
            }
        }
    }
    Ok(())
}

fn display_or_none(value: &str) -> &str {
    if value.is_empty() { "(none)" } else { value }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enable_accepts_folder_and_seed() {
        let cli = Cli::try_parse_from([
            "explorer", "enable", "--folder", "/mnt/team", "--seed", "seed.json",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Enable { folder, seed }) => {
                assert_eq!(folder, Some(PathBuf::from("/mnt/team")));
                assert_eq!(seed, Some(PathBuf::from("seed.json")));
            }
            other => panic!("unexpected command: {other:?}"),
        }
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_PATH));
    }

    #[test]
    fn disable_defaults_to_copying() {
        let cli = Cli::try_parse_from(["explorer", "disable"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Disable { no_copy: false })));
    }

    #[test]
    fn config_flag_is_global() {
        let cli = Cli::try_parse_from(["explorer", "read", "--config", "other.toml"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("other.toml"));
    }

    #[test]
    fn only_validation_errors_count_as_rejections() {
        let rejected = anyhow::Error::from(SyncError::NotADirectory(PathBuf::from("/tmp/file")));
        assert!(is_rejection(&rejected));

        let missing = anyhow::Error::from(SyncError::DocumentMissing(PathBuf::from("data.json")));
        assert!(!is_rejection(&missing));
        assert!(!is_rejection(&anyhow::anyhow!("disk on fire")));
    }

    #[test]
    fn write_requires_a_file() {
        assert!(Cli::try_parse_from(["explorer", "write"]).is_err());
    }
}
