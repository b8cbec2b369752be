mod cli;

use clap::Parser;
use clap::error::ErrorKind;
use cli::Cli;
use tracing_subscriber::EnvFilter;
use xremap::connection::{ServerError, ShutdownSignal, X11Connection};
use xremap::dispatch::{DispatchPolicy, Dispatcher};
use xremap::remap::{Config, ConfigError, RuleHandler};

/// Anything that stops the remapper before or while running.
#[derive(Debug, thiserror::Error)]
enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Server(#[from] ServerError),
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            e.exit()
        }
        Err(e) => {
            let _ = e.print();
            std::process::exit(1);
        }
    };

    std::process::exit(exit_code(run(cli)));
}

/// Load rules, connect and run the event loop until a termination signal.
///
/// Returns the signal number. Everything after the display is opened is
/// owned by the dispatcher, whose drop releases grabs before the
/// connection closes.
fn run(cli: Cli) -> Result<i32, StartupError> {
    let config = Config::load(&cli.config)?;
    let handler = RuleHandler::from_config(&config)?;

    let mut conn = X11Connection::open(cli.display.as_deref())?;
    conn.watch_shutdown(ShutdownSignal::install()?);
    tracing::info!(screen = conn.screen_num(), "connected to display");

    let mut dispatcher = Dispatcher::new(conn, handler, DispatchPolicy::from(&config))?;
    dispatcher.start()?;
    Ok(dispatcher.run()?)
}

fn exit_code(result: Result<i32, StartupError>) -> i32 {
    match result {
        Ok(signal) => 128 + signal,
        Err(e) => {
            tracing::error!(error = %e, "xremap failed");
            eprintln!("xremap: {e}");
            1
        }
    }
}
