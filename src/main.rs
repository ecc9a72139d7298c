// src/main.rs
use anyhow::{Context, Result};
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use clap::{Parser as ClapParser, Subcommand};
use memmap2::Mmap;
use serde_json::json;
use std::{
    fs::File,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{fs as tokio_fs, io::AsyncWriteExt, net::TcpStream};
use tracing::{error, info, warn};

use tracker_daemon::{
    config::Config,
    metrics::Metrics,
    parser::{decode_buffered, Outcome, ParserRegistry},
    queue::PersistQueue,
    saver,
    server::Server,
    store::{PgStore, StorePool},
};

#[derive(ClapParser, Debug)]
#[command(name = "tracker-daemon", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Run the daemon.
    Run {
        #[arg(long)]
        config: PathBuf,
        /// Overrides `workers` from the config file.
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Load and validate a config file, then print it.
    Check {
        #[arg(long)]
        config: PathBuf,
    },
    /// Decode a raw capture offline into a JSON document.
    Decode {
        #[arg(long)]
        file: PathBuf,
        #[arg(long, default_value = "st270")]
        parser: String,
        #[arg(long = "type", default_value = "st270")]
        kind: String,
        #[arg(long, default_value = "fixes.json")]
        out: PathBuf,
    },
    /// Stream a raw capture to a running daemon, chunk by chunk.
    Replay {
        #[arg(long)]
        connect: String,
        #[arg(long)]
        file: PathBuf,
        #[arg(long, default_value_t = 64)]
        chunk: usize,
        /// 0 means unthrottled.
        #[arg(long, default_value_t = 0)]
        max_bps: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .init();

    let cli = Cli::parse();
    match cli.cmd {
        Cmd::Run { config, workers } => run_daemon(config, workers).await,
        Cmd::Check { config } => {
            let conf = load_config(&config, None)?;
            print!("{conf}");
            Ok(())
        }
        Cmd::Decode { file, parser, kind, out } => decode_file(file, parser, kind, out).await,
        Cmd::Replay { connect, file, chunk, max_bps } => replay(connect, file, chunk, max_bps).await,
    }
}

fn load_config(path: &Path, workers: Option<usize>) -> Result<Config> {
    let mut conf = Config::load(path)?;
    if let Some(w) = workers {
        conf.workers = w;
    }
    conf.validate(&ParserRegistry::builtin())?;
    Ok(conf)
}

async fn run_daemon(path: PathBuf, workers: Option<usize>) -> Result<()> {
    let conf = load_config(&path, workers)?;
    info!("config {:?}:\n{conf}", path);

    let registry = Arc::new(ParserRegistry::builtin());
    let metrics = Arc::new(Metrics::new());
    let queue = PersistQueue::new();

    let urls = conf.db.clone();
    let saver = {
        let queue = queue.clone();
        let metrics = metrics.clone();
        tokio::task::spawn_blocking(move || {
            saver::spawn(
                move || async move { StorePool::<PgStore>::connect(&urls).await },
                queue,
                metrics,
            )
        })
        .await??
    };

    let http_task = conf.metrics_bind.map(|bind| {
        let metrics = metrics.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_metrics(bind, metrics).await {
                error!("http: {e:#}");
            }
        })
    });

    let server = Server::new(
        conf.host.clone(),
        Arc::new(conf.port_map()),
        registry,
        queue.clone(),
        metrics.clone(),
        conf.workers,
    )
    .start()
    .await?;

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!("shutting down");

    server.shutdown().await?;
    if let Some(t) = http_task {
        t.abort();
    }

    let pending = queue.len();
    if pending != 0 {
        info!("saver: draining {pending} queued fix(es)");
    }
    tokio::task::spawn_blocking(move || saver.shutdown()).await??;

    info!("stopped");
    Ok(())
}

async fn serve_metrics(bind: SocketAddr, metrics: Arc<Metrics>) -> Result<()> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("http: listening on {bind}");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn metrics_handler(State(metrics): State<Arc<Metrics>>) -> impl IntoResponse {
    (StatusCode::OK, metrics.prometheus_text())
}

async fn decode_file(file: PathBuf, parser: String, kind: String, out: PathBuf) -> Result<()> {
    let bytes = tokio_fs::read(&file)
        .await
        .with_context(|| format!("open {:?}", file))?;

    let registry = ParserRegistry::builtin();
    let mut p = registry
        .create(&parser)
        .with_context(|| format!("unknown parser '{parser}'"))?;
    p.set_type(&kind);
    p.load(&bytes);

    let mut fixes = Vec::new();
    let (mut heartbeats, mut short, mut corrupt) = (0u64, 0u64, 0u64);
    decode_buffered(p.as_mut(), |outcome, fix| match outcome {
        Outcome::Parsed => fixes.push(fix.clone()),
        Outcome::Skip => heartbeats += 1,
        Outcome::Incomplete => short += 1,
        Outcome::Corrupt => corrupt += 1,
    });

    if !p.buffered().is_empty() {
        warn!("decode: {} trailing byte(s) without terminator", p.buffered().len());
    }

    let doc = json!({
        "type": "decode",
        "parser": parser,
        "fixes": fixes,
        "heartbeats": heartbeats,
        "short": short,
        "corrupt": corrupt,
    });
    tokio_fs::write(&out, doc.to_string()).await?;
    info!("decode: {} fix(es) written to {:?}", fixes.len(), out);
    Ok(())
}

async fn replay(connect: String, file: PathBuf, chunk: usize, max_bps: u64) -> Result<()> {
    let f = File::open(&file).with_context(|| format!("open replay file {:?}", file))?;
    let mmap = unsafe { Mmap::map(&f)? };
    let buf = mmap.as_ref();
    let chunk = chunk.max(1);

    let mut sock = TcpStream::connect(&connect)
        .await
        .with_context(|| format!("connect {connect}"))?;
    sock.set_nodelay(true).ok();
    info!("replay: connect={connect} file={:?} bytes={}", file, buf.len());

    let mut pos = 0usize;
    let mut sent_this_sec: u64 = 0;
    let mut window = Instant::now();

    while pos < buf.len() {
        let end = (pos + chunk).min(buf.len());
        sock.write_all(&buf[pos..end]).await?;
        sent_this_sec += (end - pos) as u64;
        pos = end;

        if max_bps == 0 {
            continue;
        }
        let elapsed = window.elapsed();
        if elapsed >= Duration::from_secs(1) {
            sent_this_sec = 0;
            window = Instant::now();
        } else if sent_this_sec > max_bps {
            tokio::time::sleep(Duration::from_secs(1).saturating_sub(elapsed)).await;
            sent_this_sec = 0;
            window = Instant::now();
        }
    }

    sock.shutdown().await?;
    info!("replay: done");
    Ok(())
}
