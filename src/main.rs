mod environment;
mod login;
mod session;
mod utils;

use std::{process::ExitCode, sync::Mutex, time::Duration};

use anyhow::{Context, Result};
use pico_args::Arguments;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use environment::EnvParser;
use login::{
    context::VtNumber,
    interrupt::InterruptController,
    orchestrator::Terminal,
    tty,
};
use session::metadata::SessionDirs;
use utils::config::Config;

const DEFAULT_CONFIG: &str = "/etc/kindle/config.toml";

// Keeps a failing daemon from spinning on the VT
const RETRY_DELAY: Duration = Duration::from_secs(2);

fn init_logging(config: &Config, verbose: bool) -> Result<()> {
    let default_level = if verbose { LevelFilter::DEBUG } else { LevelFilter::INFO };
    let filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    let file_layer = match &config.log_path {
        Some(path) => {
            let file = fs_err::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .context("Failed to open log file")?;

            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(Mutex::new(file))
                    .with_ansi(false),
            )
        }
        None => None,
    };

    let stderr_layer = file_layer
        .is_none()
        .then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .init();

    Ok(())
}

fn list_sessions() {
    for (id, definition) in SessionDirs::default().all() {
        println!(
            "{id}\t{} ({})",
            definition.name,
            definition.kind.serialize().to_string_lossy()
        );
    }
}

/// The line printed to stderr for a failed login, when the log does not already go there
fn console_diagnostic(terminal: &Terminal, logs_to_file: bool) -> Option<String> {
    match terminal {
        Terminal::Failure(_) if logs_to_file => Some(format!("kindle: {terminal}")),
        _ => None,
    }
}

fn report(terminal: &Terminal, config: &Config) {
    match terminal {
        Terminal::Success | Terminal::Interrupted => info!("{terminal}"),
        Terminal::Failure(failure) => error!(stage = failure.stage(), "{terminal}"),
    }

    if let Some(line) = console_diagnostic(terminal, config.log_path.is_some()) {
        eprintln!("{line}");
    }
}

async fn serve(
    config: &Config,
    username: Option<String>,
    requested_session: Option<String>,
) -> Result<Terminal> {
    let interrupts = InterruptController::new();
    interrupts.install()?;

    if !config.daemon_mode {
        return Ok(login::login(config, &interrupts, username, requested_session).await);
    }

    tty::take_over(VtNumber::from(config.tty)).context("Failed to take over the terminal")?;

    loop {
        let terminal =
            login::login(config, &interrupts, username.clone(), requested_session.clone()).await;
        report(&terminal, config);

        if matches!(terminal, Terminal::Interrupted) || interrupts.is_interrupted() {
            return Ok(Terminal::Interrupted);
        }
        if matches!(terminal, Terminal::Failure(_))
            && interrupts.race(tokio::time::sleep(RETRY_DELAY)).await.is_none()
        {
            return Ok(Terminal::Interrupted);
        }
    }
}

fn main() -> Result<ExitCode> {
    let mut args = Arguments::from_env();

    let mut config = Config::from_args(&mut args, DEFAULT_CONFIG)?;

    if args.contains("--list") {
        list_sessions();
        return Ok(ExitCode::SUCCESS);
    }

    config.daemon_mode |= args.contains(["-d", "--daemon"]);
    let verbose = args.contains("-v");
    let username: Option<String> = args.opt_value_from_str(["-u", "--user"])?;
    let requested_session: Option<String> = args.opt_value_from_str(["-s", "--session"])?;

    let remaining = args.finish();
    if !remaining.is_empty() {
        anyhow::bail!("Unexpected arguments: {remaining:?}");
    }

    init_logging(&config, verbose)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start the async runtime")?;

    let terminal = runtime.block_on(serve(&config, username, requested_session))?;
    if !config.daemon_mode {
        report(&terminal, &config);
    }

    Ok(ExitCode::from(terminal.exit_code()))
}
