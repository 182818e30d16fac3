pub mod daemon_path;
pub mod process;
pub mod report;

use std::{
    env,
    io::{self, Write},
    path::PathBuf,
};

use anyhow::Result;
use clap::{Parser, Subcommand};
use process::{restart_daemon, stop_daemon};
use report::{process_report_command, ReportCommand};
use tracing::level_filters::LevelFilter;

use crate::{
    daemon::{
        settings::EngineSettings, start_daemon, storage::AggregationStore, DATABASE_FILE,
    },
    utils::logging::{enable_logging, CLI_PREFIX},
};

#[derive(Parser, Debug)]
#[command(name = "Activetime", version, long_about = None)]
#[command(about = "Tracks how long your computer spends on each application", long_about = None)]
struct Args {
    #[command(subcommand)]
    commands: Commands,
    #[arg(long, help = "Enable logging")]
    log: bool,
}

#[derive(Subcommand, Debug)]
#[command(version, about, long_about = None)]
enum Commands {
    #[command(about = "Starts the recording daemon")]
    Init {
        #[arg(
            long,
            help = "Application directory. By default tries to save into $XDG_STATE_HOME or $HOME/.local/state"
        )]
        dir: Option<PathBuf>,
    },
    #[command(about = "Stop a currently running daemon")]
    Stop {},
    #[command(
        about = "Run the daemon directly in the current console. Used for creating a daemon internally and for debugging"
    )]
    Serve {
        #[arg(
            long,
            help = "Application directory. By default tries to save into $XDG_STATE_HOME or $HOME/.local/state"
        )]
        dir: Option<PathBuf>,
        #[arg(long, help = "Sampling interval in seconds, clamped to 1..=60")]
        interval: Option<u64>,
    },
    #[command(about = "Show how recorded time was spent")]
    Report {
        #[command(flatten)]
        command: ReportCommand,
    },
    #[command(about = "Manage the list of marked programs")]
    Marked {
        #[command(subcommand)]
        command: MarkedCommands,
    },
    #[command(about = "Delete all recorded data and reclaim disk space")]
    Clean {
        #[arg(long, help = "Skip the confirmation prompt")]
        yes: bool,
    },
    #[command(about = "Show database information")]
    Status {},
}

#[derive(Subcommand, Debug)]
enum MarkedCommands {
    Add { program: String },
    Remove { program: String },
    List {},
}

pub async fn run_cli() -> Result<()> {
    let args = Args::parse();

    let logging_level = if args.log {
        Some(LevelFilter::TRACE)
    } else {
        Some(LevelFilter::WARN)
    };
    enable_logging(
        CLI_PREFIX,
        &create_application_default_path()?,
        logging_level,
        args.log,
    )?;

    match args.commands {
        Commands::Init { .. } => {
            restart_daemon()?;
            Ok(())
        }
        Commands::Stop {} => {
            stop_daemon();
            Ok(())
        }
        Commands::Serve { dir, interval } => {
            let dir = dir.map_or_else(create_application_default_path, Ok)?;
            let settings = interval
                .map(EngineSettings::with_interval_secs)
                .unwrap_or_default();
            start_daemon(dir, settings).await?;
            Ok(())
        }
        Commands::Report { command } => process_report_command(command).await,
        Commands::Marked { command } => process_marked_command(command).await,
        Commands::Clean { yes } => process_clean_command(yes).await,
        Commands::Status {} => process_status_command().await,
    }
}

async fn process_marked_command(command: MarkedCommands) -> Result<()> {
    let store = open_store()?;
    match command {
        MarkedCommands::Add { program } => {
            store.add_marked_program(&program).await?;
        }
        MarkedCommands::Remove { program } => {
            store.remove_marked_program(&program).await?;
        }
        MarkedCommands::List {} => {
            for program in store.list_marked_programs().await? {
                println!("{program}");
            }
        }
    }
    Ok(())
}

async fn process_clean_command(confirmed: bool) -> Result<()> {
    if !confirmed {
        print!("This permanently deletes all recorded data. Type 'yes' to continue: ");
        io::stdout().flush()?;
        let mut answer = String::new();
        io::stdin().read_line(&mut answer)?;
        if answer.trim() != "yes" {
            println!("Aborted");
            return Ok(());
        }
    }
    open_store()?.clean_data().await?;
    println!("All recorded data was deleted");
    Ok(())
}

async fn process_status_command() -> Result<()> {
    let store = open_store()?;
    let size = store.file_size().await?;
    let programs = store.list_foreground_programs().await?;
    let marked = store.list_marked_programs().await?;
    println!("Database: {} ({} bytes)", store.path().display(), size);
    println!("Tracked programs: {}", programs.len());
    println!("Marked programs: {}", marked.len());
    Ok(())
}

fn open_store() -> Result<AggregationStore> {
    Ok(AggregationStore::new(
        create_application_default_path()?.join(DATABASE_FILE),
    )?)
}

pub fn create_application_default_path() -> Result<PathBuf> {
    let path = {
        #[cfg(windows)]
        {
            let mut path =
                PathBuf::from(env::var("APPDATA").expect("APPDATA should be present on Windows"));
            path.push("activetime");
            path
        }
        #[cfg(not(windows))]
        {
            let mut path = env::var("XDG_STATE_HOME")
                .map(PathBuf::from)
                .or_else(|_| {
                    env::var("HOME").map(|home| {
                        let mut path = PathBuf::from(home);
                        path.push(".local/state");
                        path
                    })
                })
                .expect("Couldn't find neither XDG_STATE_HOME nor HOME");
            path.push("activetime");
            path
        }
    };

    match std::fs::create_dir_all(&path) {
        Ok(_) => Ok(path),
        Err(v) if v.kind() == io::ErrorKind::AlreadyExists => Ok(path),
        Err(v) => Err(v.into()),
    }
}
