// src/server.rs
//! TCP front end.
//!
//! One accept task per configured port runs on the caller's runtime. Accepted
//! sockets go round-robin to `workers` OS threads, each running a private
//! current-thread runtime and one [`SessionManager`]. Per connection a reader
//! task forwards inbound chunks to the worker loop and a writer task drains
//! outbound bytes; the session table itself is only touched by the loop.

use anyhow::{anyhow, Context, Result};
use bytes::{Bytes, BytesMut};
use hashbrown::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Builder;
use tokio::sync::mpsc;
use tokio::task::JoinHandle as TaskHandle;
use tracing::{debug, error, info, warn};

use crate::config::PortMap;
use crate::metrics::Metrics;
use crate::parser::ParserRegistry;
use crate::queue::PersistQueue;
use crate::session::{ConnId, Link, SessionManager, Verdict};

const READ_CHUNK: usize = 4096;
// pause after a failed accept (EMFILE and friends)
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

struct Accepted {
    id: ConnId,
    stream: std::net::TcpStream,
}

enum Event {
    Data(ConnId, Bytes),
    Closed(ConnId),
}

struct TcpLink {
    id: ConnId,
    port: u16,
    out: Option<mpsc::UnboundedSender<Bytes>>,
    reader: TaskHandle<()>,
}

impl Link for TcpLink {
    fn id(&self) -> ConnId {
        self.id
    }

    fn local_port(&self) -> u16 {
        self.port
    }

    fn send(&mut self, bytes: Bytes) {
        if let Some(out) = &self.out {
            let _ = out.send(bytes);
        }
    }

    /// Stops reading; the writer flushes what is queued, then shuts the socket.
    fn close(&mut self) {
        self.reader.abort();
        self.out = None;
    }
}

impl Drop for TcpLink {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

pub struct Server {
    host: String,
    ports: Arc<PortMap>,
    registry: Arc<ParserRegistry>,
    queue: PersistQueue,
    metrics: Arc<Metrics>,
    workers: usize,
}

/// Running listeners and workers.
pub struct ServerHandle {
    acceptors: Vec<TaskHandle<()>>,
    worker_txs: Vec<mpsc::UnboundedSender<Accepted>>,
    threads: Vec<JoinHandle<()>>,
}

impl Server {
    pub fn new(
        host: String,
        ports: Arc<PortMap>,
        registry: Arc<ParserRegistry>,
        queue: PersistQueue,
        metrics: Arc<Metrics>,
        workers: usize,
    ) -> Self {
        Self {
            host,
            ports,
            registry,
            queue,
            metrics,
            workers: workers.max(1),
        }
    }

    /// Binds every port and starts the workers. Must run inside a tokio runtime.
    pub async fn start(self) -> Result<ServerHandle> {
        let mut worker_txs = Vec::with_capacity(self.workers);
        let mut threads = Vec::with_capacity(self.workers);

        for n in 0..self.workers {
            let (tx, rx) = mpsc::unbounded_channel::<Accepted>();
            let manager = SessionManager::new(
                self.ports.clone(),
                self.registry.clone(),
                self.queue.clone(),
                self.metrics.clone(),
            );
            let thread = std::thread::Builder::new()
                .name(format!("trackerd-worker-{n}"))
                .spawn(move || {
                    let rt = match Builder::new_current_thread().enable_all().build() {
                        Ok(rt) => rt,
                        Err(e) => {
                            error!("worker {n}: runtime: {e}");
                            return;
                        }
                    };
                    rt.block_on(worker_loop(n, rx, manager));
                })
                .with_context(|| format!("spawn worker {n}"))?;
            worker_txs.push(tx);
            threads.push(thread);
        }

        let next_id = Arc::new(AtomicU64::new(1));
        let mut ports: Vec<u16> = self.ports.keys().copied().collect();
        ports.sort_unstable();

        let mut acceptors = Vec::with_capacity(ports.len());
        for port in ports {
            let listener = TcpListener::bind((self.host.as_str(), port))
                .await
                .with_context(|| format!("bind {}:{port}", self.host))?;
            info!("listening on {}:{port}", self.host);
            acceptors.push(tokio::spawn(accept_loop(
                listener,
                worker_txs.clone(),
                next_id.clone(),
            )));
        }

        Ok(ServerHandle {
            acceptors,
            worker_txs,
            threads,
        })
    }
}

impl ServerHandle {
    /// Stops accepting, lets every worker drop its connections, and joins them.
    pub async fn shutdown(self) -> Result<()> {
        for a in &self.acceptors {
            a.abort();
        }
        for a in self.acceptors {
            let _ = a.await;
        }
        drop(self.worker_txs);

        let threads = self.threads;
        tokio::task::spawn_blocking(move || {
            for t in threads {
                if t.join().is_err() {
                    return Err(anyhow!("worker thread panicked"));
                }
            }
            Ok(())
        })
        .await?
    }
}

async fn accept_loop(
    listener: TcpListener,
    workers: Vec<mpsc::UnboundedSender<Accepted>>,
    next_id: Arc<AtomicU64>,
) {
    let mut rr = 0usize;
    loop {
        let (sock, addr) = match listener.accept().await {
            Ok(x) => x,
            Err(e) => {
                warn!("accept: {e}");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };
        let _ = sock.set_nodelay(true);
        let stream = match sock.into_std() {
            Ok(s) => s,
            Err(e) => {
                warn!("accept {addr}: {e}");
                continue;
            }
        };

        let id = next_id.fetch_add(1, Ordering::Relaxed);
        let w = rr % workers.len();
        rr = rr.wrapping_add(1);
        debug!(conn = id, worker = w, "accepted {addr}");

        if workers[w].send(Accepted { id, stream }).is_err() {
            return;
        }
    }
}

async fn worker_loop(
    n: usize,
    mut inbound: mpsc::UnboundedReceiver<Accepted>,
    mut manager: SessionManager,
) {
    let (ev_tx, mut ev_rx) = mpsc::unbounded_channel::<Event>();
    let mut links: HashMap<ConnId, TcpLink> = HashMap::new();

    info!("worker {n}: started");
    loop {
        tokio::select! {
            acc = inbound.recv() => {
                let Some(acc) = acc else { break };
                match register(acc, ev_tx.clone()) {
                    Ok(link) => {
                        debug!("worker {n}: connection registered");
                        links.insert(link.id, link);
                    }
                    Err(e) => warn!("worker {n}: register: {e:#}"),
                }
            }
            Some(ev) = ev_rx.recv() => match ev {
                Event::Data(id, bytes) => {
                    let Some(link) = links.get_mut(&id) else { continue };
                    if manager.on_data(link, &bytes) == Verdict::Closed {
                        links.remove(&id);
                    }
                }
                Event::Closed(id) => {
                    links.remove(&id);
                    manager.on_closed(id);
                }
            },
        }
    }

    info!("worker {n}: stopping, {} connection(s) dropped", links.len());
}

fn register(acc: Accepted, events: mpsc::UnboundedSender<Event>) -> Result<TcpLink> {
    acc.stream.set_nonblocking(true)?;
    let stream = TcpStream::from_std(acc.stream)?;
    let port = stream.local_addr()?.port();
    let (mut rd, mut wr) = stream.into_split();
    let id = acc.id;

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Bytes>();

    let writer_events = events.clone();
    tokio::spawn(async move {
        while let Some(b) = out_rx.recv().await {
            if let Err(e) = wr.write_all(&b).await {
                debug!(conn = id, "write: {e}");
                let _ = writer_events.send(Event::Closed(id));
                return;
            }
        }
        let _ = wr.shutdown().await;
    });

    let reader = tokio::spawn(async move {
        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        loop {
            buf.reserve(READ_CHUNK);
            match rd.read_buf(&mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    if events.send(Event::Data(id, buf.split().freeze())).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    debug!(conn = id, "read: {e}");
                    break;
                }
            }
        }
        let _ = events.send(Event::Closed(id));
    });

    Ok(TcpLink {
        id,
        port,
        out: Some(out_tx),
        reader,
    })
}
