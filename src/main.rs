use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::Map;
use tokio_util::sync::CancellationToken;

use pythia::buffer::{ClientContext, EventBuffer, FlushError, FlushOutcome, HttpTransport, Session};
use pythia::config::PipelineConfig;
use pythia::detect::{AlertQuery, AlertStore, AlertType, ForecastSource, Severity, StaticForecast};
use pythia::event::Device;

#[derive(Parser)]
#[command(
    name = "pythia",
    about = "Privacy-preserving telemetry with forecast-based anomaly alerts",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (defaults to $PYTHIA_CONFIG, then /etc/pythia/pythia.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the SQLite database path
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server (ingestion API + scheduled detection)
    Serve {
        /// Bind address
        #[arg(long)]
        bind: Option<String>,
    },

    /// Run a single detection cycle and print the report
    Detect {
        /// Use a fixed forecast instead of querying the forecast service
        #[arg(long)]
        forecast: Option<f64>,
    },

    /// Inspect and acknowledge alerts
    Alerts {
        #[command(subcommand)]
        action: AlertsAction,
    },

    /// Record synthetic events in a client buffer and flush them to an
    /// ingestion endpoint
    Simulate {
        /// Ingestion endpoint (defaults to buffer.endpoint)
        #[arg(long)]
        endpoint: Option<String>,

        /// Number of events to record
        #[arg(long, default_value = "100")]
        events: usize,

        /// Event type
        #[arg(long, default_value = "pageview")]
        event_type: String,

        /// Client user agent, used to classify the device
        #[arg(long)]
        user_agent: Option<String>,

        /// Client country
        #[arg(long, default_value = "Unknown")]
        country: String,
    },
}

#[derive(Subcommand)]
enum AlertsAction {
    /// List alerts, newest first
    List {
        #[arg(long)]
        limit: Option<usize>,

        /// Only unacknowledged alerts
        #[arg(long)]
        unacked: bool,

        #[arg(long)]
        severity: Option<Severity>,

        #[arg(long = "type")]
        alert_type: Option<AlertType>,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Acknowledge an alert
    Ack {
        id: String,

        /// Clear the acknowledgment instead
        #[arg(long)]
        undo: bool,
    },
}

fn bootstrap_subscriber() -> impl tracing::Subscriber + Send + Sync {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .finish()
}

fn init_tracing(config: &PipelineConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Config loading logs before the configured subscriber exists.
    let mut config = tracing::subscriber::with_default(bootstrap_subscriber(), || {
        PipelineConfig::resolve(cli.config.as_deref())
    })?;
    if let Some(db) = cli.db {
        config.server.db_path = db;
    }
    init_tracing(&config);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            tracing::info!(bind = %config.server.bind, "Starting Pythia server");

            let shutdown = CancellationToken::new();
            let on_signal = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("Interrupt received, shutting down");
                    on_signal.cancel();
                }
            });
            pythia::serve(config, shutdown).await?;
        }
        Commands::Detect { forecast } => {
            let pool = pythia::storage::open_pool(&config.server.db_path)?;
            let fixed = forecast.map(|f| Arc::new(StaticForecast(f)) as Arc<dyn ForecastSource>);
            let detector = pythia::build_detector(pool, &config, fixed)?;
            let report = detector.run_cycle().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Alerts { action } => {
            let pool = pythia::storage::open_pool(&config.server.db_path)?;
            let store = AlertStore::new(pool);
            match action {
                AlertsAction::List {
                    limit,
                    unacked,
                    severity,
                    alert_type,
                    json,
                } => {
                    let query = AlertQuery {
                        limit,
                        acknowledged: unacked.then_some(false),
                        severity,
                        alert_type,
                    };
                    let alerts = store.list(&query)?;
                    if json {
                        println!("{}", serde_json::to_string_pretty(&alerts)?);
                    } else if alerts.is_empty() {
                        println!("No alerts found.");
                    } else {
                        println!(
                            "{:<36} | {:<6} | {:<8} | {:<3} | Title",
                            "Id", "Type", "Severity", "Ack"
                        );
                        println!("{:-<36}-|-{:-<6}-|-{:-<8}-|-{:-<3}-|-{:-<30}", "", "", "", "", "");
                        for a in alerts {
                            println!(
                                "{:<36} | {:<6} | {:<8} | {:<3} | {}",
                                a.id,
                                a.alert_type,
                                a.severity,
                                if a.acknowledged { "yes" } else { "no" },
                                a.title
                            );
                        }
                    }
                }
                AlertsAction::Ack { id, undo } => {
                    let alert = store.acknowledge(&id, !undo)?;
                    if alert.acknowledged {
                        println!("Alert '{}' acknowledged.", alert.id);
                    } else {
                        println!("Alert '{}' unacknowledged.", alert.id);
                    }
                }
            }
        }
        Commands::Simulate {
            endpoint,
            events,
            event_type,
            user_agent,
            country,
        } => {
            let endpoint = endpoint.unwrap_or_else(|| config.buffer.endpoint.clone());
            let transport = Arc::new(HttpTransport::new(
                endpoint.clone(),
                config.buffer.request_timeout(),
            )?);
            let context = ClientContext {
                device: user_agent
                    .as_deref()
                    .map(Device::from_user_agent)
                    .unwrap_or(Device::Desktop),
                country,
                page: Some("/simulate".to_string()),
            };
            let buffer = EventBuffer::new(
                config.buffer.clone(),
                &config.privacy,
                context,
                Session::new(chrono::Utc::now()),
                transport,
            )?;
            tracing::info!(%endpoint, events, "Simulating client traffic");

            for _ in 0..events {
                buffer.record(&event_type, 1.0, Map::new());
            }
            let sent = drain(&buffer).await?;
            println!(
                "Sent {sent} events.\n{}",
                serde_json::to_string_pretty(&buffer.status())?
            );
        }
    }

    Ok(())
}

/// Flush until the buffer is empty, honoring the retry delay between
/// failed attempts.
async fn drain(buffer: &EventBuffer) -> Result<usize> {
    let mut sent = 0;
    loop {
        match buffer.flush().await {
            Ok(FlushOutcome::Sent { events }) => sent += events,
            Ok(FlushOutcome::Empty) => return Ok(sent),
            Ok(FlushOutcome::BudgetExhausted { held }) => {
                tracing::warn!(held, "Privacy budget exhausted, events held back");
                return Ok(sent);
            }
            Ok(FlushOutcome::Paused | FlushOutcome::InProgress) => return Ok(sent),
            Err(FlushError::Retrying { retry_in, .. }) => tokio::time::sleep(retry_in).await,
            Err(e) => return Err(e.into()),
        }
    }
}
