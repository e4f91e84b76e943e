use std::env;
use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use once_cell::sync::OnceCell;
use tracing_subscriber::{fmt, EnvFilter};

use crate::app::StateProjection;
use crate::config::{ConfigLoader, CONFIG_ENV, DATA_ENV};
use crate::repository::CounterRepository;
use crate::storage;

pub mod commands;

use self::commands::{
    EditArgs, IdArgs, ListArgs, NewArgs, NoteArgs, ProgressArgs, ResetArgs, UpcomingArgs,
    WatchArgs,
};

#[derive(Parser, Debug)]
#[command(
    name = "countdown",
    version,
    about = "Countdown counters with goals, notes and history"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Override the config file location (takes precedence over COUNTDOWN_CONFIG)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override the data directory (takes precedence over COUNTDOWN_DATA)
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Minimum log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a counter
    New(NewArgs),
    /// List counters, optionally filtered (e.g. `party cat:family is:fav`)
    List(ListArgs),
    /// Show one counter with its notes and history
    Show(IdArgs),
    /// Change fields of a counter
    Edit(EditArgs),
    /// Toggle the favorite flag
    Fav(IdArgs),
    /// Move a counter to the archive
    Archive(IdArgs),
    /// Bring a counter back from the archive
    Unarchive(IdArgs),
    /// Delete a counter permanently
    Delete(IdArgs),
    /// Set, increment or decrement goal progress
    Progress(ProgressArgs),
    /// Add or remove notes
    Note(NoteArgs),
    /// List categories in use
    Categories,
    /// Soonest future counters
    Upcoming(UpcomingArgs),
    /// Print a filtered list again every time the data changes
    Watch(WatchArgs),
    /// Delete every counter
    Reset(ResetArgs),
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    if let Some(path) = &cli.config {
        env::set_var(CONFIG_ENV, path);
    }
    if let Some(path) = &cli.data_dir {
        env::set_var(DATA_ENV, path);
    }

    let loader = ConfigLoader::discover()?;
    loader.paths().ensure_directories()?;
    init_tracing(&cli.log_level)
        .with_context(|| format!("initialising logging at level {}", cli.log_level))?;
    let config = loader.load_or_init()?;
    let storage = storage::init(loader.paths(), &config.storage)
        .context("opening counter database")?;
    let repository = CounterRepository::new(storage);

    let output = match cli.command {
        Commands::New(args) => commands::new_counter(&repository, args)?,
        Commands::List(args) => commands::list_counters(&repository, args)?,
        Commands::Show(args) => commands::show_counter(&repository, args)?,
        Commands::Edit(args) => commands::edit_counter(&repository, args)?,
        Commands::Fav(args) => commands::toggle_favorite(&repository, args)?,
        Commands::Archive(args) => commands::set_archived(&repository, args, true)?,
        Commands::Unarchive(args) => commands::set_archived(&repository, args, false)?,
        Commands::Delete(args) => commands::delete_counter(&repository, args)?,
        Commands::Progress(args) => {
            let projection = StateProjection::new(repository, &config)?;
            commands::change_progress(&projection, args)?
        }
        Commands::Note(args) => commands::handle_note_command(&repository, args)?,
        Commands::Categories => commands::list_categories(&repository)?,
        Commands::Upcoming(args) => {
            commands::upcoming(&repository, args, config.widget.upcoming_limit)?
        }
        Commands::Watch(args) => {
            let stdout = io::stdout();
            commands::watch(&repository, args, &mut stdout.lock())?;
            String::new()
        }
        Commands::Reset(args) => commands::reset(&repository, args)?,
    };
    print!("{output}");
    Ok(())
}

fn init_tracing(level: &str) -> Result<()> {
    static INIT: OnceCell<()> = OnceCell::new();
    INIT.get_or_try_init(|| {
        let env_filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("warn"));
        fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .try_init()
            .map_err(|err| anyhow::anyhow!(err))
    })
    .map(|_| ())
}
