use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use keel_api::{ApiError, AppSummary, InProcApi, KeelApi, ListFilter, SyncRequest};
use keel_kubehub::{KubeLiveState, LiveState, MemoryCluster};
use keel_manifest::{load_applications, ManifestLoader};
use keel_persist::{HistoryStore, SqliteStore};
use keel_store::{ApplicationRecord, Registry};
use keel_sync::{Controller, ControllerConfig, LocalSource, SyncReport};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "keelctl", version, about = "Keel GitOps controller")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Application definitions file (YAML, one Application per document)
    #[arg(long = "apps", global = true, env = "KEEL_APPS", default_value = "keel-apps.yaml")]
    apps: PathBuf,

    /// Sync history database
    #[arg(long = "db", global = true, env = "KEEL_DB_PATH")]
    db: Option<String>,

    /// Use an in-memory cluster instead of the destinations' real endpoints
    #[arg(long = "simulate", global = true, action = ArgAction::SetTrue)]
    simulate: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Render a base directory with overlays and print the result
    Render {
        #[arg(long = "base")]
        base: PathBuf,
        /// Overlay directory, applied in the order given
        #[arg(long = "overlay")]
        overlays: Vec<PathBuf>,
    },
    /// List applications
    Ls {
        /// Name regex
        #[arg(long = "name")]
        name: Option<String>,
        /// Label selector, key=value (repeatable)
        #[arg(short = 'l', long = "label")]
        labels: Vec<String>,
        /// Sync code: Synced, OutOfSync, Unknown, Degraded, Error
        #[arg(long = "code")]
        code: Option<String>,
    },
    /// Compare an application with its cluster and print its status
    Status { app: String },
    /// Sync an application now
    Sync {
        app: String,
        /// Compute the plan without applying it
        #[arg(long = "dry-run", action = ArgAction::SetTrue)]
        dry_run: bool,
    },
    /// Show finished syncs, newest first
    History {
        app: String,
        #[arg(long = "limit")]
        limit: Option<usize>,
    },
    /// Run the controller until interrupted
    Run,
}

fn init_tracing() {
    let env = std::env::var("KEEL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KEEL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KEEL_METRICS_ADDR; expected host:port");
        }
    }
}

fn open_history(db: Option<&str>) -> Result<Arc<dyn HistoryStore>> {
    let store = match db {
        Some(p) => SqliteStore::open(p)?,
        None => SqliteStore::open_default()?,
    };
    Ok(Arc::new(store))
}

fn build_controller(cli: &Cli) -> Result<Controller> {
    let apps = load_applications(&cli.apps).with_context(|| format!("loading applications from {}", cli.apps.display()))?;
    let registry = Arc::new(Registry::new());
    for app in apps {
        let name = app.name.clone();
        registry.register(app).with_context(|| format!("registering {}", name))?;
    }
    let live: Arc<dyn LiveState> = if cli.simulate { Arc::new(MemoryCluster::new()) } else { Arc::new(KubeLiveState::new()) };
    let history = open_history(cli.db.as_deref())?;
    info!(apps = registry.names().len(), simulate = cli.simulate, "controller: ready");
    Ok(Controller::new(registry, live, Arc::new(LocalSource::new()), history, ControllerConfig::from_env()))
}

fn print_json<T: serde::Serialize>(v: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(v)?);
    Ok(())
}

fn render_ts(ts: i64) -> String {
    if ts <= 0 { return "-".into(); }
    let age = (keel_core::now_ts() - ts).max(0);
    if age < 60 { format!("{}s", age) } else if age < 3600 { format!("{}m", age / 60) } else if age < 86_400 { format!("{}h", age / 3600) } else { format!("{}d", age / 86_400) }
}

fn print_summaries(rows: &[AppSummary]) {
    println!("{:<20} {:<10} {:<24} {:<24} {:<5} REVISION", "NAME", "PHASE", "DESTINATION", "NAMESPACE", "AUTO");
    for r in rows {
        let rev = r.revision.as_deref().unwrap_or("-");
        println!("{:<20} {:<10} {:<24} {:<24} {:<5} {}", r.name, r.phase, r.endpoint, r.namespace, r.automated, rev);
        if let Some(err) = &r.last_error { println!("  last error: {}", err); }
    }
}

fn print_record(rec: &ApplicationRecord) {
    let st = &rec.status.sync;
    println!("Name:       {}", rec.name());
    println!("Phase:      {}", rec.status.phase());
    println!("Revision:   {}", st.revision().unwrap_or("-"));
    println!("Observed:   {}", render_ts(st.observed_at()));
    if let Some(m) = st.message() { println!("Message:    {}", m); }
    if let Some(e) = &rec.status.last_error { println!("Last error: {} ({}, {} ago)", e.message, e.kind, render_ts(e.at)); }
    for d in st.diffs() {
        println!("  {:<8} {}", format!("{:?}", d.action), d.id);
        for f in &d.fields {
            let show = |v: &Option<serde_json::Value>| v.as_ref().map(|j| j.to_string()).unwrap_or_else(|| "<absent>".into());
            println!("           {}: {} -> {}", f.path, show(&f.live), show(&f.desired));
        }
    }
    for o in st.outcomes().iter().filter(|o| o.message.is_some()) {
        println!("  {:<8} {} {}: {}", format!("{:?}", o.action), o.id, o.code, o.message.as_deref().unwrap_or(""));
    }
}

fn print_report(r: &SyncReport) {
    let mode = if r.dry_run { " (dry run)" } else { "" };
    println!("{}: {} {}{}", r.app, r.status.code(), r.summary, mode);
    if let Some(m) = r.status.message() { println!("  {}", m); }
    for d in r.status.diffs() { println!("  {:<8} {}", format!("{:?}", d.action), d.id); }
}

async fn dispatch(cli: &Cli, api: &InProcApi) -> Result<(), ApiError> {
    match &cli.command {
        Commands::Ls { name, labels, code } => {
            let filter = ListFilter::parse(name.as_deref(), labels, code.as_deref())?;
            let rows = api.list_applications(filter).await?;
            match cli.output {
                Output::Human => print_summaries(&rows),
                Output::Json => print_json(&rows).map_err(|e| ApiError::Internal(e.to_string()))?,
            }
        }
        Commands::Status { app } => {
            let rec = api.refresh(app).await?;
            match cli.output {
                Output::Human => print_record(&rec),
                Output::Json => print_json(&rec).map_err(|e| ApiError::Internal(e.to_string()))?,
            }
        }
        Commands::Sync { app, dry_run } => {
            let report = api.trigger_sync(app, SyncRequest { dry_run: *dry_run }).await?;
            match cli.output {
                Output::Human => print_report(&report),
                Output::Json => print_json(&report).map_err(|e| ApiError::Internal(e.to_string()))?,
            }
        }
        Commands::History { app, limit } => {
            let rows = api.history(app, *limit).await?;
            match cli.output {
                Output::Human => {
                    println!("{:<38} {:<10} {:<8} {:<6} REVISION", "OPERATION", "CODE", "AGE", "ACTS");
                    for h in &rows {
                        println!("{:<38} {:<10} {:<8} {:<6} {}", h.op_id, h.code, render_ts(h.ts), h.actions, h.revision.as_deref().unwrap_or("-"));
                    }
                }
                Output::Json => print_json(&rows).map_err(|e| ApiError::Internal(e.to_string()))?,
            }
        }
        Commands::Render { .. } | Commands::Run => {}
    }
    Ok(())
}

fn render(base: &Path, overlays: &[PathBuf], output: Output) -> Result<()> {
    let set = ManifestLoader::new().load(base, overlays)?;
    match output {
        Output::Human => print!("{}", set.to_yaml()),
        Output::Json => {
            let objs: Vec<serde_json::Value> = set.resources().iter().map(|r| r.to_object()).collect();
            print_json(&objs)?;
        }
    }
    Ok(())
}

async fn run(ctl: Controller) -> Result<()> {
    let shutdown = CancellationToken::new();
    let worker = tokio::spawn({
        let ctl = ctl.clone();
        let token = shutdown.clone();
        async move { ctl.run(token).await }
    });
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("controller: shutdown requested");
    shutdown.cancel();
    if let Err(e) = worker.await { warn!(error = %e, "controller task ended abnormally"); }
    info!("controller: stopped");
    Ok(())
}

#[tokio::main]
async fn main() {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    if let Commands::Render { base, overlays } = &cli.command {
        if let Err(e) = render(base, overlays, cli.output) {
            error!(error = %format!("{:#}", e), "render failed");
            eprintln!("render error: {:#}", e);
            std::process::exit(2);
        }
        return;
    }

    let ctl = match build_controller(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("startup error: {:#}", e);
            std::process::exit(2);
        }
    };

    if let Commands::Run = cli.command {
        if let Err(e) = run(ctl).await {
            eprintln!("run error: {:#}", e);
            std::process::exit(1);
        }
        return;
    }

    let api = InProcApi::new(ctl);
    if let Err(e) = dispatch(&cli, &api).await {
        eprintln!("{}", e);
        std::process::exit(e.exit_code());
    }
}
