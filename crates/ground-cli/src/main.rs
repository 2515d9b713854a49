use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::BufWriter;
use std::path::PathBuf;
use tracing::info;

use ground_alert::{doctor as alert_doctor, AlertConfig, AlertEngine};
use ground_source::{build_source, doctor as source_doctor, SourceConfig, SourceKind};
use ground_station::{doctor as station_doctor, Dispatcher, ReconnectConfig, ReconnectPolicy, TracingObserver};
use ground_store::{chronological, doctor as store_doctor, HistoryConfig, HistoryStore};

#[derive(Debug, Parser)]
#[command(name = "groundlink", version, about = "groundlink - receive-only vehicle telemetry ground station")]
struct Cli {
    #[arg(long)]
    config: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate every config section.
    Doctor,
    /// Stream telemetry until Ctrl-C.
    Run {
        /// Override source.kind (demo, fc, radio, replay).
        #[arg(long)]
        source: Option<SourceKind>,
    },
    History { #[command(subcommand)] cmd: HistoryCmd },
}

#[derive(Debug, Subcommand)]
enum HistoryCmd {
    /// Write every record as CSV.
    Export {
        #[arg(long)]
        out: PathBuf,
    },
    /// Print the most recent records, oldest first.
    Latest {
        #[arg(short, default_value_t = 20)]
        n: usize,
    },
    /// Delete all records.
    Clear,
}

#[derive(Debug, serde::Deserialize)]
struct Config {
    source: SourceConfig,
    #[serde(default)]
    reconnect: ReconnectConfig,
    history: HistoryConfig,
    #[serde(default)]
    alerts: AlertConfig,
}

fn load_config(path: &str) -> Result<Config> {
    let s = std::fs::read_to_string(path).with_context(|| format!("read config {}", path))?;
    toml::from_str(&s).context("parse config toml")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;

    match cli.cmd {
        Command::Doctor => doctor(&cfg),
        Command::Run { source } => run(cfg, source).await,
        Command::History { cmd } => history(&cfg, cmd).await,
    }
}

fn doctor(cfg: &Config) -> Result<()> {
    info!("doctor: starting");
    source_doctor::check_source(&cfg.source)?;
    station_doctor::check_reconnect(&cfg.reconnect)?;
    store_doctor::check_history(&cfg.history)?;
    alert_doctor::check_alerts(&cfg.alerts)?;
    info!("doctor: OK");
    Ok(())
}

async fn run(cfg: Config, kind: Option<SourceKind>) -> Result<()> {
    let mut source = cfg.source.clone();
    if let Some(kind) = kind {
        source.kind = kind;
    }
    source_doctor::check_source(&source)?;
    store_doctor::check_history(&cfg.history)?;

    let store = HistoryStore::open(&cfg.history.db_path)
        .await
        .with_context(|| format!("open history {}", cfg.history.db_path.display()))?;
    let dispatcher = Dispatcher::new(
        store,
        &cfg.history,
        AlertEngine::new(&cfg.alerts),
        Box::new(TracingObserver::default()),
    )?;

    info!("run: starting with {:?} source", source.kind);
    let (handle, task) =
        ground_station::spawn(build_source, ReconnectPolicy::from(&cfg.reconnect), dispatcher, Some(source));

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!("run: interrupted, shutting down");
    handle.shutdown()?;
    task.await.context("supervisor task")?.context("close history")?;
    Ok(())
}

async fn history(cfg: &Config, cmd: HistoryCmd) -> Result<()> {
    let mut store = HistoryStore::open(&cfg.history.db_path)
        .await
        .with_context(|| format!("open history {}", cfg.history.db_path.display()))?;

    match cmd {
        HistoryCmd::Export { out } => {
            let file = std::fs::File::create(&out).with_context(|| format!("create {}", out.display()))?;
            let n = store.export_csv(BufWriter::new(file)).await.context("export csv")?;
            info!("history: exported {} records to {}", n, out.display());
        }
        HistoryCmd::Latest { n } => {
            for r in chronological(store.get_latest(n).await?) {
                let s = &r.sample;
                println!(
                    "{:>6} {} {:<8} t={:<8.1} lat={:?} lon={:?} alt={:?} bat={:?} mode={}",
                    r.id,
                    r.ingested_at,
                    r.source,
                    s.time_s,
                    s.lat_deg,
                    s.lon_deg,
                    s.rel_alt_m,
                    s.battery_percent,
                    s.flight_mode.as_deref().unwrap_or("-"),
                );
            }
        }
        HistoryCmd::Clear => {
            store.clear().await.context("clear history")?;
            info!("history: cleared");
        }
    }
    store.close().await?;
    Ok(())
}
