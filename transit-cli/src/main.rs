//! Transit CLI
//!
//! Command-line interface for tracking transfers, running end-to-end transfer
//! tests and forwarding broker events to a document index.

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, Level};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use transit_broker::{ConnectionManager, StompConnector};
use transit_core::{
    BrokerConfig, Config, IngestHandler, Listener, RucioCli, RunContext, RunError,
    ShutdownSignal, TrackingRun, TransferTest,
};
use transit_ingest::{HttpIndex, IngestSink};
use transit_tracker::{RunOutcome, RunReport, WatchSet};

/// Exit status for timed-out or interrupted tracking runs
const EXIT_UNRESOLVED: u8 = 2;

#[derive(Parser)]
#[command(name = "transit")]
#[command(about = "Transit - transfer event tracking and ingestion for the storage event bus", long_about = None)]
#[command(version)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Commands,
}

/// Options shared by every subcommand; they override the config file
#[derive(Args, Debug, Default)]
struct CommonArgs {
    /// YAML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Broker host
    #[arg(long, global = true)]
    host: Option<String>,

    /// Broker port
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Broker virtual host
    #[arg(long, global = true)]
    vhost: Option<String>,

    /// Topic to subscribe to
    #[arg(long, global = true)]
    topic: Option<String>,

    /// Subscription identifier reused on reconnect
    #[arg(long, global = true)]
    subscription_id: Option<String>,

    /// Client certificate (PEM)
    #[arg(long, env = "BROKER_CERT", global = true)]
    cert: Option<PathBuf>,

    /// Client private key (PEM)
    #[arg(long, env = "BROKER_KEY", global = true)]
    key: Option<PathBuf>,

    /// CA bundle used to verify the broker
    #[arg(long, global = true)]
    ca_cert: Option<PathBuf>,

    /// Connect over plain TCP
    #[arg(long, global = true)]
    no_tls: bool,

    /// Request a durable subscription
    #[arg(long, global = true)]
    durable: bool,

    /// Log level
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Seconds between completion checks
    #[arg(long, global = true)]
    poll_interval: Option<u64>,

    /// Overall deadline in seconds
    #[arg(long, global = true)]
    timeout: Option<u64>,

    /// Events per index flush
    #[arg(long, global = true)]
    chunk_size: Option<usize>,
}

#[derive(Subcommand)]
enum Commands {
    /// Track transfers of existing files until they resolve or time out
    Watch {
        /// File name to track; repeat for several
        #[arg(short, long = "name", required = true)]
        names: Vec<String>,

        /// Scope of the tracked files
        #[arg(short, long)]
        scope: Option<String>,

        /// Comma-separated destinations
        #[arg(short, long, value_delimiter = ',', required = true)]
        destinations: Vec<String>,
    },

    /// Upload generated files, replicate them and track the transfers
    TransferTest {
        /// Location the files are uploaded to
        #[arg(long)]
        source: Option<String>,

        /// Comma-separated destinations
        #[arg(short, long, value_delimiter = ',')]
        destinations: Vec<String>,

        /// Number of files to generate
        #[arg(long)]
        files: Option<usize>,

        /// Size of each file in bytes
        #[arg(long)]
        file_size: Option<usize>,

        /// Directory for generated files
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Account the control-plane commands run as
        #[arg(long)]
        account: Option<String>,

        /// Scope for uploads and the dataset
        #[arg(short, long)]
        scope: Option<String>,

        /// Replicas per destination rule
        #[arg(long)]
        copies: Option<u32>,

        /// Lifetime of files and rules in seconds
        #[arg(long)]
        lifetime: Option<u64>,

        /// Control-plane client executable
        #[arg(long)]
        rucio: Option<PathBuf>,
    },

    /// Forward transfer and deletion events to a document index until Ctrl-C
    Ingest {
        /// Index base URL
        #[arg(long)]
        index_url: Option<String>,

        /// Index user
        #[arg(long)]
        index_user: Option<String>,

        /// Index password
        #[arg(long, env = "INDEX_PASSWORD", hide_env_values = true)]
        index_password: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_logging(&cli.common.log_level) {
        eprintln!("{e:#}");
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            if let Some(report) = e.downcast_ref::<RunError>().and_then(RunError::report) {
                println!("{report}");
            }
            error!(error = %format!("{e:#}"), "Fatal error");
            ExitCode::FAILURE
        }
    }
}

fn setup_logging(level: &str) -> Result<()> {
    let level = level.parse::<Level>().unwrap_or(Level::INFO);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default().add_directive(LevelFilter::from_level(level).into()));

    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow::anyhow!("Failed to set tracing subscriber: {}", e))?;

    Ok(())
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = load_config(&cli.common)?;

    match cli.command {
        Commands::Watch {
            names,
            scope,
            destinations,
        } => {
            let scope = scope.unwrap_or_else(|| config.transfer.scope.clone());
            watch(config, &scope, &names, &destinations).await
        }
        Commands::TransferTest {
            source,
            destinations,
            files,
            file_size,
            data_dir,
            account,
            scope,
            copies,
            lifetime,
            rucio,
        } => {
            let transfer = &mut config.transfer;
            override_with(&mut transfer.source, source);
            if !destinations.is_empty() {
                transfer.destinations = destinations;
            }
            override_with(&mut transfer.files, files);
            override_with(&mut transfer.file_size, file_size);
            if data_dir.is_some() {
                transfer.data_dir = data_dir;
            }
            override_with(&mut transfer.account, account);
            override_with(&mut transfer.scope, scope);
            override_with(&mut transfer.copies, copies);
            override_with(&mut transfer.lifetime_secs, lifetime);
            override_with(&mut transfer.program, rucio);
            transfer_test(config).await
        }
        Commands::Ingest {
            index_url,
            index_user,
            index_password,
        } => {
            override_with(&mut config.ingest.index_url, index_url);
            if index_user.is_some() {
                config.ingest.username = index_user;
            }
            if index_password.is_some() {
                config.ingest.password = index_password;
            }
            ingest(config).await
        }
    }
}

fn override_with<T>(field: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *field = value;
    }
}

/// Read the config file (if any) and apply command-line overrides
fn load_config(args: &CommonArgs) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => {
            info!(path = %path.display(), "Loading configuration");
            Config::load(path)?
        }
        None => Config::default(),
    };

    let broker = &mut config.broker;
    override_with(&mut broker.host, args.host.clone());
    override_with(&mut broker.port, args.port);
    override_with(&mut broker.vhost, args.vhost.clone());
    override_with(&mut broker.topic, args.topic.clone());
    if args.subscription_id.is_some() {
        broker.subscription_id = args.subscription_id.clone();
    }
    override_with(&mut broker.cert, args.cert.clone());
    override_with(&mut broker.key, args.key.clone());
    override_with(&mut broker.ca_cert, args.ca_cert.clone());
    if args.no_tls {
        broker.tls = false;
    }
    if args.durable {
        broker.durable = true;
    }

    override_with(&mut config.tracker.poll_interval_secs, args.poll_interval);
    override_with(&mut config.tracker.timeout_secs, args.timeout);
    override_with(&mut config.ingest.chunk_size, args.chunk_size);

    config.broker.validate()?;
    Ok(config)
}

fn build_listener(config: &BrokerConfig) -> Result<Listener<StompConnector>> {
    let connector = StompConnector::new(config.connection_params())?;
    let manager = ConnectionManager::new(connector, config.reconnect_policy());
    Ok(Listener::new(manager, config.subscription()))
}

fn shutdown_on_ctrl_c(shutdown: ShutdownSignal) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, shutting down");
            shutdown.trigger();
        }
    });
}

fn report_exit(report: &RunReport) -> ExitCode {
    println!("{report}");
    match report.outcome {
        Some(RunOutcome::Resolved) => ExitCode::SUCCESS,
        _ => ExitCode::from(EXIT_UNRESOLVED),
    }
}

async fn watch(
    config: Config,
    scope: &str,
    names: &[String],
    destinations: &[String],
) -> Result<ExitCode> {
    info!(
        scope,
        files = names.len(),
        destinations = ?destinations,
        "Starting watch"
    );

    let watch = WatchSet::product(scope, names, destinations);
    let ctx = RunContext::new();
    shutdown_on_ctrl_c(ctx.shutdown().clone());

    let listener = build_listener(&config.broker)?;
    let run = TrackingRun::start(listener, &watch, config.tracker.poller(), ctx)?;
    let report = run.finish().await?;
    Ok(report_exit(&report))
}

async fn transfer_test(config: Config) -> Result<ExitCode> {
    let transfer = config.transfer.clone();
    info!(
        source = %transfer.source,
        destinations = ?transfer.destinations,
        files = transfer.files,
        file_size = transfer.file_size,
        "Starting transfer test"
    );

    let control = RucioCli::new(transfer.program.clone(), transfer.account.clone());
    let test = TransferTest::new(transfer, control);

    let ctx = RunContext::new();
    shutdown_on_ctrl_c(ctx.shutdown().clone());

    let listener = build_listener(&config.broker)?;
    let report = test.run(listener, config.tracker.poller(), ctx).await?;
    Ok(report_exit(&report))
}

async fn ingest(config: Config) -> Result<ExitCode> {
    let index = HttpIndex::new(config.ingest.index_config())?;
    info!(
        index_url = %config.ingest.index_url,
        chunk_size = config.ingest.chunk_size,
        "Starting ingestion"
    );

    let mut handler = IngestHandler::new(IngestSink::new(index, config.ingest.chunk_size));
    let ctx = RunContext::new();
    shutdown_on_ctrl_c(ctx.shutdown().clone());

    let mut listener = build_listener(&config.broker)?;
    let stats = listener.run(&mut handler, &ctx).await?;

    let ingested = handler.stats();
    info!(
        received = stats.received,
        written = ingested.written,
        failed = ingested.failed,
        skipped = ingested.skipped,
        malformed = ingested.malformed,
        "Ingestion stopped"
    );
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "transit",
            "--host",
            "broker.example.org",
            "--port",
            "61613",
            "--no-tls",
            "--subscription-id",
            "sub-7",
            "--timeout",
            "30",
            "watch",
            "--name",
            "f1",
            "--destinations",
            "RSE_A,RSE_B",
        ])
        .unwrap();

        let config = load_config(&cli.common).unwrap();
        assert_eq!(config.broker.host, "broker.example.org");
        assert_eq!(config.broker.port, 61613);
        assert!(!config.broker.tls);
        assert_eq!(config.broker.subscription_id.as_deref(), Some("sub-7"));
        assert_eq!(config.tracker.timeout_secs, 30);
        assert_eq!(config.tracker.poll_interval_secs, 120);

        match cli.command {
            Commands::Watch {
                names,
                destinations,
                ..
            } => {
                assert_eq!(names, vec!["f1"]);
                assert_eq!(destinations, vec!["RSE_A", "RSE_B"]);
            }
            _ => panic!("expected watch"),
        }
    }

    #[test]
    fn test_common_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "transit",
            "ingest",
            "--index-url",
            "http://index:9200",
            "--chunk-size",
            "50",
        ])
        .unwrap();
        assert_eq!(cli.common.chunk_size, Some(50));
    }

    #[test]
    fn test_watch_requires_destinations() {
        assert!(Cli::try_parse_from(["transit", "watch", "--name", "f1"]).is_err());
    }

    #[test]
    fn test_invalid_override_rejected() {
        let args = CommonArgs {
            port: Some(0),
            log_level: "info".to_string(),
            ..CommonArgs::default()
        };
        assert!(load_config(&args).is_err());
    }

    #[test]
    fn test_exit_code_follows_outcome() {
        let resolved = RunReport {
            outcome: Some(RunOutcome::Resolved),
            destinations: Vec::new(),
        };
        let timed_out = RunReport {
            outcome: Some(RunOutcome::TimedOut),
            destinations: Vec::new(),
        };
        assert_eq!(report_exit(&resolved), ExitCode::SUCCESS);
        assert_eq!(report_exit(&timed_out), ExitCode::from(EXIT_UNRESOLVED));
    }
}
