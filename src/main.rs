//! linearcast - linear TV channel synthesizer
//! Builds interleaved channel playlists and a guide from a Kodi video library

// Use mimalloc for faster memory allocation (Linux, macOS)
#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use clap::{Parser, Subcommand, ValueEnum};
use linearcast::commands::{parse_source, ChannelEdit, CommandOutcome, Commands};
use linearcast::config::AppConfig;
use linearcast::models::{LimitType, Source, SourceRole};
use linearcast::orchestrator::{run_loop, run_pass, Session, Shutdown};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::thread;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "linearcast")]
#[command(version, about = "Linear TV channels from a Kodi video library")]
struct Cli {
    /// Config file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Errors only
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Regenerate channels periodically until 'q' is entered
    Run {
        /// Single pass, then exit
        #[arg(long)]
        once: bool,
    },
    /// Create a channel
    ///
    /// Sources are KIND:ORIGIN:PATH[@OPTIONS], KIND episodes|movies, ORIGIN
    /// playlist|folder, OPTIONS a comma list of LOW[-HIGH][xCOUNT] and shuffle.
    Create {
        name: String,
        #[arg(long)]
        number: Option<u32>,
        #[arg(long, value_enum, default_value_t = LimitArg::Time)]
        limit: LimitArg,
        /// Base source
        #[arg(long, value_parser = base_source)]
        base: Source,
        /// Additional source, repeatable
        #[arg(long = "add", value_parser = additional_source)]
        additional: Vec<Source>,
    },
    /// Change a channel; sources are replaced as a whole when --base is given
    Edit {
        number: u32,
        #[arg(long)]
        name: Option<String>,
        #[arg(long = "renumber")]
        new_number: Option<u32>,
        #[arg(long, value_enum)]
        limit: Option<LimitArg>,
        #[arg(long, value_parser = base_source)]
        base: Option<Source>,
        #[arg(long = "add", value_parser = additional_source, requires = "base")]
        additional: Vec<Source>,
        #[arg(long, conflicts_with = "resume")]
        pause: bool,
        #[arg(long)]
        resume: bool,
    },
    /// Delete one channel, or every channel with --all
    Delete {
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        number: Option<u32>,
        #[arg(long)]
        all: bool,
    },
    /// Rebuild playlists from scratch (all channels when no number is given)
    Regenerate { number: Option<u32> },
    /// Drop what has played and top up (all channels when no number is given)
    Update { number: Option<u32> },
    /// Measure durations of video files in folder sources
    Rescan {
        folder: Option<PathBuf>,
        /// Ignore the rescan interval
        #[arg(long)]
        force: bool,
    },
    /// Copy state and outputs into a timestamped backup folder
    Backup { dest: Option<PathBuf> },
    /// Copy a backup folder back into place
    Restore { dir: PathBuf },
    /// List channels
    List,
    /// Show the guide
    Guide { number: Option<u32> },
}

#[derive(Clone, Copy, ValueEnum)]
enum LimitArg {
    Time,
    Items,
}

impl From<LimitArg> for LimitType {
    fn from(arg: LimitArg) -> Self {
        match arg {
            LimitArg::Time => LimitType::Time,
            LimitArg::Items => LimitType::ItemCount,
        }
    }
}

fn base_source(spec: &str) -> Result<Source, String> {
    parse_source(spec, SourceRole::Base)
}

fn additional_source(spec: &str) -> Result<Source, String> {
    parse_source(spec, SourceRole::Additional)
}

fn init_logging(verbose: bool, quiet: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else if quiet {
        EnvFilter::new("error")
    } else {
        EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into())
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

/// y/N question on the terminal
fn confirm(question: &str) -> bool {
    eprint!("{} [y/N] ", question);
    let _ = io::stderr().flush();
    let mut answer = String::new();
    if io::stdin().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    let config_path = cli.config.unwrap_or_else(AppConfig::default_path);
    match execute(cli.command, &config_path) {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn execute(command: Command, config_path: &Path) -> linearcast::Result<ExitCode> {
    let config = AppConfig::load_from(config_path)?;
    let mut commands = Commands::open(config.clone())?.with_prompt(confirm);
    let outcome = match command {
        Command::Run { once } => return run(&config, config_path, once),
        Command::Create { name, number, limit, base, additional } => {
            let sources = std::iter::once(base).chain(additional).collect();
            commands.create_channel(&name, number, limit.into(), sources)?
        }
        Command::Edit { number, name, new_number, limit, base, additional, pause, resume } => {
            let edit = ChannelEdit {
                name,
                number: new_number,
                limit_type: limit.map(Into::into),
                sources: base.map(|b| std::iter::once(b).chain(additional).collect()),
                paused: match (pause, resume) {
                    (true, _) => Some(true),
                    (_, true) => Some(false),
                    _ => None,
                },
            };
            commands.edit_channel(number, edit)?
        }
        Command::Delete { all: true, .. } => commands.delete_all()?,
        Command::Delete { number: Some(number), .. } => commands.delete_channel(number)?,
        Command::Delete { number: None, .. } => CommandOutcome::failed("Give a channel number or --all"),
        Command::Regenerate { number: Some(number) } => commands.regenerate_channel(number)?,
        Command::Regenerate { number: None } => commands.regenerate_all()?,
        Command::Update { number: Some(number) } => commands.update_channel(number)?,
        Command::Update { number: None } => commands.update_all()?,
        Command::Rescan { folder, force } => commands.rescan_durations(folder.as_deref(), force)?,
        Command::Backup { dest } => commands.backup(dest.as_deref())?,
        Command::Restore { dir } => commands.restore(&dir)?,
        Command::List => commands.list()?,
        Command::Guide { number } => commands.guide(number)?,
    };

    if outcome.success {
        println!("{}", outcome.status);
        Ok(ExitCode::SUCCESS)
    } else {
        eprintln!("{}", outcome.status);
        Ok(ExitCode::FAILURE)
    }
}

fn run(config: &AppConfig, config_path: &Path, once: bool) -> linearcast::Result<ExitCode> {
    let mut session = Session::open(config)?;
    let (stop, shutdown) = Shutdown::channel();
    if once {
        let summary = run_pass(config, &mut session, &shutdown)?;
        summary.log();
        return Ok(if summary.failures.is_empty() { ExitCode::SUCCESS } else { ExitCode::FAILURE });
    }

    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if matches!(line.trim(), "q" | "quit") {
                let _ = stop.send(());
                break;
            }
        }
    });
    info!("Running, enter 'q' to stop");
    run_loop(|| AppConfig::load_from(config_path), &mut session, &shutdown)?;
    Ok(ExitCode::SUCCESS)
}
