use clap::{Args, Parser, Subcommand, ValueEnum};
use pages::config::OutputFormat;
use pages::{IndexCache, PageRegistry, StaticPagesConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tokio::task::JoinSet;

mod config;
mod telemetry;

use config::{ConfigLoadError, Overrides};

#[derive(Parser)]
#[command(
    name = "pagesrv",
    about = "A static pages server for hosting your own sites"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    globals: GlobalArgs,
}

#[derive(Args, Debug, Clone)]
struct GlobalArgs {
    /// Path to the config file
    #[arg(short = 'c', long = "config", global = true)]
    config: Option<PathBuf>,

    /// Proxy listener port
    #[arg(short = 'p', long = "port", global = true)]
    port: Option<u16>,

    /// Bind host for both listeners
    #[arg(short = 's', long = "server", global = true)]
    server: Option<String>,

    /// Enable debug logging
    #[arg(short = 'd', long = "debug", global = true)]
    debug: bool,

    /// Log output format
    #[arg(short = 'o', long = "out", global = true, value_enum)]
    out: Option<OutFormat>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutFormat {
    Short,
    Long,
}

impl From<OutFormat> for OutputFormat {
    fn from(format: OutFormat) -> Self {
        match format {
            OutFormat::Short => OutputFormat::Short,
            OutFormat::Long => OutputFormat::Long,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Serves the static pages application
    #[command(after_help = "Example: pagesrv serve --api --proxy")]
    Serve(ServeArgs),
    /// Prints version and build information
    Version,
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Serve the ingest API
    #[arg(long)]
    api: bool,

    /// Serve the reverse proxy
    #[arg(long)]
    proxy: bool,
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigLoadError),

    #[error(
        "unable to start: you need to specify at least one of the following options: --api, --proxy"
    )]
    NoFrontEnd,

    #[error("failed to create runtime: {0}")]
    Runtime(#[from] std::io::Error),

    #[error("a front-end terminated unexpectedly")]
    FrontEndFailed,
}

fn main() {
    if let Err(error) = cli() {
        eprintln!("{error}");
        std::process::exit(1);
    }
}

fn cli() -> Result<(), CliError> {
    let cli = Cli::parse();

    match cli.command {
        Command::Version => {
            print_version();
            Ok(())
        }
        Command::Serve(serve_args) => {
            if !serve_args.api && !serve_args.proxy {
                return Err(CliError::NoFrontEnd);
            }

            let overrides = to_overrides(&cli.globals);
            let config = config::load(&overrides)?;

            telemetry::init_tracing(&config.output);
            telemetry::init_statsd_recorder("pagesrv", config.metrics.as_ref());

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            runtime.block_on(serve(config, overrides, serve_args))
        }
    }
}

fn to_overrides(globals: &GlobalArgs) -> Overrides {
    Overrides {
        config: globals.config.clone(),
        port: globals.port,
        host: globals.server.clone(),
        debug: globals.debug,
        format: globals.out.map(OutputFormat::from),
    }
}

/// Runs the configured front-ends until SIGINT/SIGTERM.
///
/// SIGHUP re-reads the config, rebuilds the tenant registry, and restarts
/// the listeners; bind addresses are not hot-swappable so a restart is the
/// reload. The index cache lives across reloads.
async fn serve(
    mut config: StaticPagesConfig,
    overrides: Overrides,
    serve_args: ServeArgs,
) -> Result<(), CliError> {
    let cache = Arc::new(IndexCache::new());

    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    loop {
        let registry = Arc::new(PageRegistry::from_pages(config.pages.clone()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut front_ends: JoinSet<Result<(), String>> = JoinSet::new();

        if serve_args.api {
            let config = config.clone();
            let registry = registry.clone();
            let cache = cache.clone();
            let shutdown = shutdown_rx.clone();
            front_ends.spawn(async move {
                api::run(&config, registry, cache, shutdown)
                    .await
                    .map_err(|error| error.to_string())
            });
        }

        if serve_args.proxy {
            let config = config.clone();
            let registry = registry.clone();
            let cache = cache.clone();
            let shutdown = shutdown_rx.clone();
            front_ends.spawn(async move {
                proxy::run(&config, registry, cache, shutdown)
                    .await
                    .map_err(|error| error.to_string())
            });
        }
        drop(shutdown_rx);

        let reload = tokio::select! {
            _ = sighup.recv() => true,
            _ = sigint.recv() => false,
            _ = sigterm.recv() => false,
            joined = front_ends.join_next() => {
                if let Some(Ok(Err(error))) = joined {
                    tracing::error!(error = %error, "front-end failed");
                }
                let _ = shutdown_tx.send(true);
                while front_ends.join_next().await.is_some() {}
                return Err(CliError::FrontEndFailed);
            }
        };

        let _ = shutdown_tx.send(true);
        while front_ends.join_next().await.is_some() {}

        if !reload {
            tracing::info!("shutting down");
            return Ok(());
        }

        tracing::info!("config file reload requested");
        match config::load(&overrides) {
            Ok(reloaded) => config = reloaded,
            Err(error) => {
                tracing::error!(error = %error, "reload failed, keeping previous configuration");
            }
        }
    }
}

fn print_version() {
    println!("pagesrv {}", env!("CARGO_PKG_VERSION"));
    println!("  date:    {}", option_env!("PAGESRV_BUILD_DATE").unwrap_or("unknown"));
    println!("  commit:  {}", option_env!("PAGESRV_BUILD_COMMIT").unwrap_or("unknown"));
    println!("  builder: {}", option_env!("PAGESRV_BUILT_BY").unwrap_or("unknown"));
}
