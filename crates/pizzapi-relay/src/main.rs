use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use log::LevelFilter;

use pizzapi_relay::server;
use pizzapi_relay::settings::RelaySettings;

const APP_NAME: &str = "pizzapi-relay";

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.common);

    match cli.command {
        Command::Serve(cmd) => async_serve(cli.common, cmd),
        Command::Completions { shell } => {
            let mut command = Cli::command();
            clap_complete::generate(shell, &mut command, APP_NAME, &mut io::stdout());
            Ok(())
        }
    }
}

#[tokio::main]
async fn async_serve(common: CommonOpts, cmd: ServeCommand) -> Result<()> {
    let mut settings = RelaySettings::load(common.config.as_ref())?;
    if let Some(port) = cmd.port {
        settings.port = port;
    }
    server::serve(settings).await
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "PizzaPi relay - streams agent sessions to browsers.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the relay server
    Serve(ServeCommand),
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Args)]
struct ServeCommand {
    /// Port to listen on (overrides PORT)
    #[arg(long)]
    port: Option<u16>,
}

fn init_logging(common: &CommonOpts) {
    let level = if common.trace {
        LevelFilter::Trace
    } else if common.debug || common.verbose >= 2 {
        LevelFilter::Debug
    } else if common.quiet {
        LevelFilter::Error
    } else if common.verbose == 1 {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}
