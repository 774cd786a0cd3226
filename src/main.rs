use std::env;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fingate::operator::ConsoleOperator;
use fingate::storage::{FileStore, Identity, TemplateStore};
use fingate::{config, poller, BitwiseMatcher, CancelToken, Coordinator, Mode, Settings, SpoolSource};
use log::info;

#[derive(Parser)]
#[command(name = "fingate")]
#[command(version, about = "Fingerprint gate - enroll and verify fingerprints against a template store")]
struct Cli {
    /// Config file (defaults to the compiled-in path)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding the identity store
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// Spool directory the scanner drops captures into
    #[arg(long, global = true)]
    spool: Option<PathBuf>,

    /// Append logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify presented fingers against enrolled identities
    Verify,
    /// Enroll new identities from three presses of the same finger
    Enroll,
    /// List enrolled identities
    List {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Remove one enrolled identity
    Remove {
        /// Identity id as shown by `list`
        id: String,
    },
    /// Remove all enrolled identities
    Purge,
    /// Open config file in editor
    Config {
        /// Write the default config instead of opening an editor
        #[arg(long)]
        init: bool,
    },
}

fn init_logging(log_file: Option<&Path>) -> Result<()> {
    let mut builder = env_logger::builder();
    builder
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .format_target(false)
        .format_timestamp(None);
    if let Some(path) = log_file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening log file {}", path.display()))?;
        builder
            .format_timestamp_secs()
            .target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.init();
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_file.as_deref())?;

    let cfg = config::load_config(cli.config.as_deref())?;
    let store = match &cli.store {
        Some(dir) => FileStore::open(dir.clone()),
        None => FileStore::open_default(),
    };

    match cli.command {
        Commands::Verify => run_gate(&cfg, cli.spool, store, Mode::Verify),
        Commands::Enroll => run_gate(&cfg, cli.spool, store, Mode::Enroll),
        Commands::List { json } => list(&store, json),
        Commands::Remove { id } => remove(&store, &id),
        Commands::Purge => purge(&store),
        Commands::Config { init } => open_config(&cfg, cli.config.as_deref(), init),
    }
}

fn run_gate(cfg: &config::Config, spool: Option<PathBuf>, store: FileStore, mode: Mode) -> Result<()> {
    let spool = spool.unwrap_or_else(|| cfg.spool_dir.clone());
    info!("Opening capture spool: {}", spool.display());
    let mut source = SpoolSource::open(&spool).context("Failed to open capture source")?;

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        info!("Received signal, initiating graceful shutdown...");
        handler_token.cancel();
    })
    .context("Failed to install signal handler")?;

    let coordinator = Coordinator::new(
        mode,
        BitwiseMatcher,
        store,
        ConsoleOperator::stdio(),
        Settings::from(cfg),
        cancel.clone(),
    );

    match mode {
        Mode::Verify => info!("Verification mode. Place your finger on the scanner..."),
        Mode::Enroll => info!("Enrollment mode. Place your finger on the scanner..."),
    }
    info!("Press Ctrl+C to stop.");

    let stats = poller::run(&mut source, &coordinator, &cancel, cfg.poll_interval())
        .context("Capture loop failed")?;
    info!("Processed {} capture(s)", stats.admitted);
    Ok(())
}

#[derive(serde::Serialize)]
struct Listing<'a> {
    id: &'a str,
    enrolled_at: u64,
    attributes: &'a fingate::storage::Attributes,
    template_len: usize,
}

impl<'a> From<&'a Identity> for Listing<'a> {
    fn from(identity: &'a Identity) -> Self {
        Self {
            id: &identity.id,
            enrolled_at: identity.enrolled_at,
            attributes: &identity.attributes,
            template_len: identity.template.len(),
        }
    }
}

fn list(store: &FileStore, json: bool) -> Result<()> {
    let records = store.list_all().context("Failed to load identities")?;
    if json {
        let listing: Vec<Listing> = records.iter().map(Listing::from).collect();
        println!("{}", serde_json::to_string_pretty(&listing)?);
        return Ok(());
    }
    if records.is_empty() {
        info!("No enrolled identities in {}", store.path().display());
        return Ok(());
    }
    for identity in &records {
        let attrs: Vec<String> = identity
            .attributes
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        println!("{}  {}", identity.id, attrs.join(" "));
    }
    Ok(())
}

fn remove(store: &FileStore, id: &str) -> Result<()> {
    if store.remove(id).context("Failed to remove identity")? {
        info!("✓ Removed identity {}", id);
        Ok(())
    } else {
        anyhow::bail!("No identity with id {}", id)
    }
}

fn purge(store: &FileStore) -> Result<()> {
    info!("Purging enrolled identities in {}", store.path().display());

    store.purge().context("Failed to purge identities")?;

    info!("✓ All identities purged");
    Ok(())
}

fn open_config(cfg: &config::Config, path: Option<&Path>, init: bool) -> Result<()> {
    let config_path = path.unwrap_or(&config::CONFIG_PATH);

    if init {
        config::save_config(cfg, Some(config_path))?;
        info!("Wrote config to {}", config_path.display());
        return Ok(());
    }

    let editor = env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());

    info!("Opening config file: {:?}", config_path);

    let status = std::process::Command::new(editor)
        .arg(config_path)
        .status()
        .context("Failed to open editor")?;

    if !status.success() {
        anyhow::bail!("Editor exited with non-zero status");
    }

    Ok(())
}
