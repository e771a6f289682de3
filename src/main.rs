use anyhow::Result;
use archon::config::{ConfigArgs, DaemonConfig};
use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Parser)]
#[command(name = "archond", about = "archon — local agent-control daemon", version)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// HTTP port
    #[arg(long, env = "ARCHON_PORT")]
    port: Option<u16>,

    /// Data directory for session/item/approval stores
    #[arg(long, env = "ARCHON_DATA_DIR")]
    data_dir: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "ARCHON_LOG")]
    log: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "ARCHON_LOG_FILE")]
    log_file: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the daemon (default when no subcommand given).
    ///
    /// Examples:
    ///   archond serve
    ///   archond
    Serve,
    /// Write a starter config.toml to ~/.archon/config.toml.
    ///
    /// Safe to re-run: refuses to overwrite an existing file.
    ///
    /// Examples:
    ///   archond init
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = args.log.clone().unwrap_or_else(|| "info".to_string());
    let _log_guard = setup_logging(&log_level, args.log_file.as_deref());

    match args.command {
        Some(Command::Init) => run_init(),
        None | Some(Command::Serve) => {
            run_server(ConfigArgs { port: args.port, data_dir: args.data_dir, log: args.log }).await
        }
    }
}

/// Initialize the tracing subscriber. If `log_file` is set, logs go to both
/// stdout and a daily-rolling file. Returns a `WorkerGuard` that must stay
/// alive for the process lifetime.
///
/// Falls back to stdout-only logging with a warning if the log directory
/// cannot be created — never panics.
fn setup_logging(log_level: &str, log_file: Option<&std::path::Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    if let Some(path) = log_file {
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let filename = path.file_name().unwrap_or_else(|| std::ffi::OsStr::new("archond.log"));

        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!("warn: could not create log directory '{}': {e} — falling back to stdout", dir.display());
            tracing_subscriber::fmt().with_env_filter(log_level).compact().init();
            return None;
        }

        let appender = tracing_appender::rolling::daily(dir, filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(log_level))
            .with(tracing_subscriber::fmt::layer().compact())
            .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
            .init();

        Some(guard)
    } else {
        tracing_subscriber::fmt().with_env_filter(log_level).compact().init();
        None
    }
}

fn run_init() -> Result<()> {
    let Some(dir) = archon::config::home_archon_dir() else {
        anyhow::bail!("cannot determine home directory to place ~/.archon/config.toml");
    };
    let path = dir.join("config.toml");
    if path.exists() {
        println!("Already initialized: {}", path.display());
        return Ok(());
    }
    archon::config::write_starter_config(&path)?;
    println!("Wrote starter config: {}", path.display());
    Ok(())
}

async fn run_server(args: ConfigArgs) -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "archond starting");

    let config = DaemonConfig::load(args);
    info!(data_dir = %config.data_dir.display(), port = config.port, "config loaded");

    for binary in &["claude", "codex", "opencode"] {
        let available = std::process::Command::new(binary)
            .arg("--version")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .is_ok();
        if available {
            info!(binary = %binary, "provider CLI found");
        } else {
            tracing::warn!(binary = %binary, "provider CLI not found on PATH — sessions using this provider will fail");
        }
    }

    let state = archon::AppState::build(config).await?;
    let port = state.config.port;
    archon::http::serve(state, port).await
}
