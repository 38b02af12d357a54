use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use fleetd::{auth, config::FleetConfig, server, AppContext};
use tracing::info;

#[derive(Parser)]
#[command(
    name = "fleetd",
    about = "Fleet Host — always-on control plane for AI coding agent fleets",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// WebSocket server port
    #[arg(long, env = "FLEETD_PORT")]
    port: Option<u16>,

    /// Data directory for config, the JWT secret, and the SQLite database
    #[arg(long, env = "FLEETD_DATA_DIR")]
    data_dir: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "FLEETD_LOG")]
    log: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "FLEETD_LOG_FILE")]
    log_file: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the control plane (default when no subcommand given).
    ///
    /// Examples:
    ///   fleetd serve
    ///   fleetd
    Serve,
    /// Mint tokens signed with this install's JWT secret.
    ///
    /// Agents and dashboards authenticate with these; pass the access token
    /// as `?token=` on the WebSocket URL or in the connect message.
    ///
    /// Examples:
    ///   fleetd token --user u-1 --email dev@example.com
    ///   fleetd token --user ci --email ci@example.com --role viewer --refresh
    Token {
        #[arg(long)]
        user: String,
        #[arg(long)]
        email: String,
        /// One of: admin, operator, viewer
        #[arg(long, default_value = "operator")]
        role: String,
        /// Also print a long-lived refresh token
        #[arg(long)]
        refresh: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Init once — must happen before any tracing calls.
    let log_level = args.log.clone().unwrap_or_else(|| "info".to_string());
    let _file_guard = setup_logging(&log_level, args.log_file.as_deref());

    match args.command {
        Some(Command::Token {
            user,
            email,
            role,
            refresh,
        }) => {
            let config = FleetConfig::resolve(args.port, args.data_dir, args.log);
            mint_token(&config, &user, &email, &role, refresh)?;
        }
        None | Some(Command::Serve) => {
            let config = FleetConfig::resolve(args.port, args.data_dir, args.log);
            run_server(config).await?;
        }
    }

    Ok(())
}

async fn run_server(config: FleetConfig) -> Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.port,
        data_dir = %config.data_dir.display(),
        "fleetd starting"
    );
    let ctx = AppContext::new(config).await.context("initialize")?;
    ctx.start_background();
    server::run(ctx).await
}

fn mint_token(config: &FleetConfig, user: &str, email: &str, role: &str, refresh: bool) -> Result<()> {
    let role = match role {
        "admin" => auth::Role::Admin,
        "operator" => auth::Role::Operator,
        "viewer" => auth::Role::Viewer,
        other => anyhow::bail!("unknown role {other:?} (admin, operator, viewer)"),
    };
    let secret = match &config.jwt_secret {
        Some(secret) => secret.clone(),
        None => auth::get_or_create_secret(&config.data_dir)?,
    };
    let verifier = auth::AuthVerifier::new(&secret);
    let principal = auth::Principal {
        user_id: user.to_string(),
        email: email.to_string(),
        role,
    };
    let (access, expires_at) = verifier.issue_access(&principal);
    println!("access token (expires {expires_at}):");
    println!("{access}");
    if refresh {
        println!();
        println!("refresh token:");
        println!("{}", verifier.issue_refresh(&principal));
    }
    Ok(())
}

/// Initialize the tracing subscriber.
/// If `log_file` is set, logs go to both stdout and a daily-rolling file.
/// Returns a `WorkerGuard` that must stay alive for the process lifetime.
///
/// If the log directory cannot be created, falls back to stdout-only logging
/// with a warning — never panics.
fn setup_logging(
    log_level: &str,
    log_file: Option<&std::path::Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    if let Some(path) = log_file {
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let filename = path
            .file_name()
            .unwrap_or_else(|| std::ffi::OsStr::new("fleetd.log"));

        // Ensure the directory exists before tracing-appender tries to open it.
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!(
                "warn: could not create log directory '{}': {e} — falling back to stdout",
                dir.display()
            );
            tracing_subscriber::fmt()
                .with_env_filter(log_level)
                .compact()
                .init();
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
        tracing_subscriber::fmt()
            .with_env_filter(log_level)
            .compact()
            .init();
        None
    }
}
