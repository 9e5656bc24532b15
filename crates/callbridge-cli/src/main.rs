//! callbridge CLI - run directives against an engine session.

mod engine;
mod run;
mod shell;

use clap::{Args, Parser, Subcommand};

use callbridge_core::BootstrapMode;

#[derive(Parser)]
#[command(name = "callbridge")]
#[command(about = "Run directives against a callbridge engine")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// How to reach the engine and how the session behaves.
#[derive(Args, Debug, Clone)]
pub struct EngineArgs {
    /// Run the reference engine on a thread of this process
    #[arg(long, conflicts_with = "engine")]
    in_process: bool,

    /// Path to the engine binary (default: discover callbridge-engine)
    #[arg(long)]
    engine: Option<String>,

    /// Run inbound calls on the waiting goal's thread
    #[arg(long)]
    no_threaded_callbacks: bool,

    /// How the first goal reaches the engine
    #[arg(long, value_parser = parse_bootstrap)]
    bootstrap: Option<BootstrapMode>,

    /// Config file (default: <config dir>/callbridge/config.json)
    #[arg(long)]
    config: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run directives in order and print their results
    Run {
        /// Directives to run, without a trailing '.'
        #[arg(required = true)]
        directives: Vec<String>,

        /// Output variables, e.g. "[X, Y]"
        #[arg(short, long)]
        outputs: Option<String>,

        #[command(flatten)]
        engine: EngineArgs,
    },

    /// Read directives from stdin, one per line ("directive => [Vars]")
    Shell {
        #[command(flatten)]
        engine: EngineArgs,
    },
}

fn parse_bootstrap(s: &str) -> Result<BootstrapMode, String> {
    s.parse().map_err(|e: callbridge_core::Error| e.to_string())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    // Helper to format callbridge-core errors with recovery hints
    let format_error = |err: anyhow::Error| -> anyhow::Error {
        if let Some(core_err) = err.downcast_ref::<callbridge_core::Error>() {
            anyhow::anyhow!("{}", core_err.with_hint())
        } else {
            err
        }
    };

    match cli.command {
        Commands::Run {
            directives,
            outputs,
            engine,
        } => run::execute(&directives, outputs.as_deref(), &engine).map_err(format_error)?,

        Commands::Shell { engine } => shell::execute(&engine).map_err(format_error)?,
    }

    Ok(())
}
