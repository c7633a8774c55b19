mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::{
    config::ConfigSubcommand, feature::FeatureSubcommand, learned::LearnedSubcommand,
    task::TaskSubcommand,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "flowguard",
    about = "Workflow guard for coding assistants: check tool calls against the feature workflow and suggest next steps",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: auto-detect from .flowguard/ or .git/)
    #[arg(long, global = true, env = "FLOWGUARD_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize flowguard in the current project
    Init,

    /// Evaluate one tool invocation (exit 0 allow, 1 block, 2 warn)
    Evaluate {
        /// Lifecycle phase: pre, post or on-stop
        #[arg(long, default_value = "pre")]
        phase: String,

        /// Invocation JSON file, or `-` for stdin
        #[arg(long, default_value = "-")]
        invocation: PathBuf,
    },

    /// Rank the most likely next commands
    Suggest {
        /// Command to rank successors of (default: last command this session)
        #[arg(long)]
        after: Option<String>,

        /// Local hour to score with, 0-23 (default: now)
        #[arg(long)]
        hour: Option<u32>,
    },

    /// Show workflow state
    State,

    /// Inspect features
    Feature {
        #[command(subcommand)]
        subcommand: FeatureSubcommand,
    },

    /// Inspect task ledgers
    Task {
        #[command(subcommand)]
        subcommand: TaskSubcommand,
    },

    /// Inspect or reset learned command transitions
    Learned {
        #[command(subcommand)]
        subcommand: LearnedSubcommand,
    },

    /// Show or validate settings
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Init => cmd::init::run(&root),
        Commands::Evaluate { phase, invocation } => {
            // Hook callers read the exit code; our own failures must not block.
            match cmd::evaluate::run(&root, &phase, &invocation, cli.json) {
                Ok(code) => std::process::exit(code),
                Err(e) => {
                    eprintln!("warning: flowguard could not evaluate: {e:#}");
                    std::process::exit(2);
                }
            }
        }
        Commands::Suggest { after, hour } => {
            cmd::suggest::run(&root, after.as_deref(), hour, cli.json)
        }
        Commands::State => cmd::state::run(&root, cli.json),
        Commands::Feature { subcommand } => cmd::feature::run(&root, subcommand, cli.json),
        Commands::Task { subcommand } => cmd::task::run(&root, subcommand, cli.json),
        Commands::Learned { subcommand } => cmd::learned::run(&root, subcommand, cli.json),
        Commands::Config { subcommand } => cmd::config::run(&root, subcommand, cli.json),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
