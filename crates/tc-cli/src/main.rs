use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use tc_core::{LogNotifier, Moment};
use tracing_subscriber::EnvFilter;

use tc_cli::commands::{credits, detect, enroll, recurring, session, slots, status, waitlist};
use tc_cli::{Cli, Commands, Config};

/// Load config and open database, ensuring the parent directory exists.
fn open_database(config_path: Option<&Path>) -> Result<(tc_db::Database, Config)> {
    let config = Config::load_from(config_path).context("failed to load configuration")?;
    tracing::debug!(?config, "loaded configuration");

    if let Some(parent) = config.database_path.parent() {
        std::fs::create_dir_all(parent).context("failed to create database directory")?;
    }

    let db = tc_db::Database::open(&config.database_path)
        .with_context(|| format!("failed to open {}", config.database_path.display()))?;
    Ok((db, config))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
    };
    // Logs go to stderr; stdout carries command output.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();

    let Some(command) = &cli.command else {
        use clap::CommandFactory;
        Cli::command().print_help()?;
        println!();
        return Ok(());
    };

    let (mut db, config) = open_database(cli.config.as_deref())?;
    let notifier = LogNotifier;
    let now = Moment::now();
    let mut out = std::io::stdout().lock();

    match command {
        Commands::Credits(action) => credits::run(&mut out, &mut db, action, now.utc)?,
        Commands::Enroll(action) => enroll::run(&mut out, &mut db, action, now.utc)?,
        Commands::Session(action) => {
            session::run(&mut out, &mut db, action, &config, &notifier, &now)?;
        }
        Commands::Detect => detect::run(&mut out, &mut db, &config, &notifier, &now)?,
        Commands::Cleanup => detect::cleanup(&mut out, &mut db, &now)?,
        Commands::Slots(action) => {
            slots::run(&mut out, &mut db, action, &config, &notifier, &now)?;
        }
        Commands::Recurring(action) => recurring::run(&mut out, &mut db, action, &now)?,
        Commands::Waitlist(action) => waitlist::run(&mut out, &mut db, action, &notifier, &now)?,
        Commands::Status => status::run(&mut out, &db, &config.database_path, &now)?,
    }

    Ok(())
}
