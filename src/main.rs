use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use localmind::catalog::{CatalogClient, HubCatalog, ModelQuery};
use localmind::config::Config;
use localmind::download::{format_bytes, DownloadEvent, DownloadOrchestrator, HubTransfer};
use localmind::inference::OpenAiEngine;
use localmind::models::{split_identifier, ModelDescriptor, RecommendedModel};
use localmind::session::{ChatSession, SessionEvent};
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "localmind")]
#[command(about = "Download, manage and chat with local language models", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// List installed models (default)
    List,
    /// Search the remote catalog
    Search {
        /// Only models from this collection
        #[arg(long)]
        collection: Option<String>,
        /// Free-text filter on model identifiers
        #[arg(long)]
        query: Option<String>,
    },
    /// List the catalog's collections
    Collections,
    /// Download a model (Ctrl-C cancels)
    Download { id: String },
    /// Delete an installed model
    Delete { id: String },
    /// Chat with an installed model
    Chat { id: String },
    /// Show the built-in recommended models
    Recommended,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load().context("Failed to load configuration")?;

    match cli.command {
        None | Some(Commands::List) => list(&config).await,
        Some(Commands::Search { collection, query }) => search(&config, collection, query).await,
        Some(Commands::Collections) => collections(&config).await,
        Some(Commands::Download { id }) => download(&config, &id).await,
        Some(Commands::Delete { id }) => delete(&config, &id).await,
        Some(Commands::Chat { id }) => chat(&config, &id).await,
        Some(Commands::Recommended) => {
            recommended();
            Ok(())
        }
    }
}

async fn orchestrator(config: &Config) -> anyhow::Result<DownloadOrchestrator> {
    let root = config.models_dir()?;
    let transfer = HubTransfer::new(
        root.clone(),
        &config.storage.manifest_file,
        config.download.min_free_space_mb,
    )?;
    let orchestrator =
        DownloadOrchestrator::new(Arc::new(transfer), root, &config.storage, &config.download);

    let installed = orchestrator
        .reconcile()
        .await
        .context("Failed to scan the models directory")?;
    tracing::debug!("{installed} installed model(s)");
    Ok(orchestrator)
}

/// Reject malformed identifiers, pointing at a curated model if one is close
fn check_identifier(id: &str) -> anyhow::Result<()> {
    if split_identifier(id).is_some() {
        return Ok(());
    }
    match RecommendedModel::suggest(id) {
        Some(suggestion) => bail!("Invalid model identifier '{id}'. Did you mean '{suggestion}'?"),
        None => bail!("Invalid model identifier '{id}', expected organization/name"),
    }
}

async fn list(config: &Config) -> anyhow::Result<()> {
    let orchestrator = orchestrator(config).await?;
    let inventory = orchestrator.snapshot();
    let installed = inventory.installed();

    if installed.is_empty() {
        println!("No models installed in {}", orchestrator.storage_root().display());
        println!("Try: localmind download {}", RecommendedModel::recommended().id);
        return Ok(());
    }

    for model in installed {
        let size = model.size_bytes().map_or_else(|| "-".to_string(), format_bytes);
        println!("{:<60} {size:>10}", model.id());
    }
    Ok(())
}

async fn search(
    config: &Config,
    collection: Option<String>,
    query: Option<String>,
) -> anyhow::Result<()> {
    let catalog = HubCatalog::new(&config.catalog)?;
    let orchestrator = orchestrator(config).await?;

    let query = ModelQuery {
        collection,
        search: query,
    };
    let models = catalog.list_models(&query).await?;
    orchestrator.set_available(models.clone());

    for model in &models {
        let status = orchestrator
            .status_of(&model.id)
            .map_or_else(String::new, |s| s.to_string());
        println!(
            "{:<60} {:>9} downloads {:>6} likes  {status}",
            model.id, model.downloads, model.likes
        );
    }
    println!("{} model(s)", models.len());
    Ok(())
}

async fn collections(config: &Config) -> anyhow::Result<()> {
    let catalog = HubCatalog::new(&config.catalog)?;
    for collection in catalog.list_collections().await? {
        println!("{}  ({} models)", collection.id, collection.model_ids.len());
        println!("    {}", collection.title);
        if let Some(description) = &collection.description {
            println!("    {description}");
        }
    }
    Ok(())
}

async fn download(config: &Config, id: &str) -> anyhow::Result<()> {
    check_identifier(id)?;
    let orchestrator = orchestrator(config).await?;

    let descriptor = RecommendedModel::find(id)
        .map_or_else(|| ModelDescriptor::from_id(id), RecommendedModel::to_descriptor);

    let mut events = orchestrator.subscribe();
    if !orchestrator.request_download(&descriptor)? {
        println!("{id} is already installed");
        return Ok(());
    }

    let bar = ProgressBar::new(1000);
    bar.set_style(
        ProgressStyle::with_template("{msg} [{bar:40.cyan/blue}] {percent}% ({elapsed})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    );
    bar.set_message(id.to_string());

    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                // Already finished if this fails
                orchestrator.cancel(id).ok();
                bar.abandon_with_message(format!("{id} cancelled"));
                return Ok(());
            }
            event = events.recv() => event,
        };

        let event = match event {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => bail!("Download of {id} was abandoned"),
        };
        if event.model_id() != Some(id) {
            continue;
        }

        match event {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            DownloadEvent::Progress { progress, .. } => bar.set_position((progress * 1000.0) as u64),
            DownloadEvent::Installed { path, .. } => {
                bar.finish_with_message(format!("{id} installed"));
                println!("{}", path.display());
                return Ok(());
            }
            DownloadEvent::Failed { error, .. } => {
                bar.abandon_with_message(format!("{id} failed"));
                bail!("{error}");
            }
            DownloadEvent::Cancelled { .. } => {
                bar.abandon_with_message(format!("{id} cancelled"));
                return Ok(());
            }
            _ => {}
        }
    }
}

async fn delete(config: &Config, id: &str) -> anyhow::Result<()> {
    check_identifier(id)?;
    let orchestrator = orchestrator(config).await?;
    orchestrator.delete(id).await?;
    println!("Deleted {id}");
    Ok(())
}

async fn chat(config: &Config, id: &str) -> anyhow::Result<()> {
    check_identifier(id)?;
    let orchestrator = orchestrator(config).await?;
    let Some(model) = orchestrator.get(id).filter(|m| m.status().is_installed()) else {
        bail!("{id} is not installed. Download it first: localmind download {id}");
    };

    let engine = OpenAiEngine::new(&config.inference)?;
    let session = ChatSession::new(Arc::new(engine), &config.generation);
    session
        .load_model(&model)
        .await
        .with_context(|| format!("Failed to load {id}"))?;

    println!("Chatting with {id}. Commands: /clear, /stats, /quit. Ctrl-C stops a reply.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        session.set_input(line);
        let input = session.input();

        match input.trim() {
            "/quit" => break,
            "/clear" => {
                session.clear();
                println!("Conversation cleared");
            }
            "/stats" => println!("{}", session.metrics()),
            _ => {
                let mut events = session.subscribe();
                if session.send(&input)? {
                    stream_reply(&session, &mut events).await?;
                }
            }
        }
    }

    Ok(())
}

/// Print assistant text as it arrives until the generation ends
async fn stream_reply(
    session: &ChatSession,
    events: &mut broadcast::Receiver<SessionEvent>,
) -> anyhow::Result<()> {
    let mut printed = 0;
    let mut stdout = std::io::stdout();

    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                session.stop();
                println!("\n[stopped]");
                return Ok(());
            }
            event = events.recv() => event,
        };

        match event {
            Ok(SessionEvent::Updated { content }) => {
                if let Some(delta) = content.get(printed..) {
                    write!(stdout, "{delta}")?;
                    stdout.flush()?;
                }
                printed = content.len();
            }
            Ok(SessionEvent::Finished) => {
                println!();
                return Ok(());
            }
            Ok(SessionEvent::Stopped) => {
                println!("\n[stopped]");
                return Ok(());
            }
            Ok(SessionEvent::Failed { error }) => {
                eprintln!("\n{error}");
                return Ok(());
            }
            Ok(SessionEvent::Started) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => return Ok(()),
        }
    }
}

fn recommended() {
    println!("Recommended models:\n");
    for model in RecommendedModel::all_ids().into_iter().filter_map(RecommendedModel::find) {
        let marker = if model.recommended { " (recommended)" } else { "" };
        println!(
            "  {:<50} {:>5} {:>6} MB  {}{marker}",
            model.id, model.parameters, model.size_mb, model.description
        );
    }
    println!("\nDownload with: localmind download <id>");
}
