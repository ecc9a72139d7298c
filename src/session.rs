// src/session.rs
use bytes::Bytes;
use hashbrown::hash_map::Entry;
use hashbrown::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::PortMap;
use crate::metrics::Metrics;
use crate::parser::{Outcome, ParserRegistry, TrackerParser};
use crate::queue::PersistQueue;

pub type ConnId = u64;

/// The transport side of one accepted connection, as the worker sees it.
pub trait Link {
    fn id(&self) -> ConnId;

    /// Port the connection was accepted on.
    fn local_port(&self) -> u16;

    fn send(&mut self, bytes: Bytes);

    fn close(&mut self);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Open,
    Closed,
}

struct Session {
    parser: Box<dyn TrackerParser>,
}

/// Per-worker table of live sessions.
///
/// Owned by exactly one worker loop; nothing in here is shared.
pub struct SessionManager {
    ports: Arc<PortMap>,
    registry: Arc<ParserRegistry>,
    queue: PersistQueue,
    metrics: Arc<Metrics>,
    sessions: HashMap<ConnId, Session>,
}

impl SessionManager {
    pub fn new(
        ports: Arc<PortMap>,
        registry: Arc<ParserRegistry>,
        queue: PersistQueue,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            ports,
            registry,
            queue,
            metrics,
            sessions: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, id: ConnId) -> bool {
        self.sessions.contains_key(&id)
    }

    /// Feeds one inbound read into the connection's parser and acts on every
    /// message it yields.
    pub fn on_data<L: Link>(&mut self, link: &mut L, bytes: &[u8]) -> Verdict {
        let id = link.id();
        debug!(conn = id, "received {} bytes", bytes.len());
        self.metrics.add_bytes_in(bytes.len());

        let session = match self.sessions.entry(id) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => match open_session(&self.ports, &self.registry, link.local_port()) {
                Some(s) => {
                    self.metrics.inc_conn_opened();
                    e.insert(s)
                }
                None => {
                    self.metrics.inc_conn_rejected();
                    warn!(conn = id, port = link.local_port(), "no parser for port, dropping connection");
                    link.close();
                    return Verdict::Closed;
                }
            },
        };

        let parser = &mut session.parser;
        parser.load(bytes);

        let verdict = loop {
            let outcome = parser.parse();

            let response = parser.response();
            if !response.is_empty() {
                link.send(response.split().freeze());
            }

            match outcome {
                Outcome::Skip => {
                    self.metrics.inc_heartbeats();
                    continue;
                }
                Outcome::Corrupt => {
                    self.metrics.inc_corrupt();
                    warn!(conn = id, "corrupt message, dropping connection");
                    break Verdict::Closed;
                }
                Outcome::Incomplete => break Verdict::Open,
                Outcome::Parsed => {
                    self.metrics.inc_fixes_parsed();
                    self.queue.push(parser.data().clone());
                }
            }
        };

        if verdict == Verdict::Closed {
            self.sessions.remove(&id);
            self.metrics.inc_conn_closed();
            link.close();
        }
        verdict
    }

    /// Connection lost or torn down by the transport.
    pub fn on_closed(&mut self, id: ConnId) {
        if self.sessions.remove(&id).is_some() {
            self.metrics.inc_conn_closed();
            debug!(conn = id, "connection lost");
        }
    }
}

fn open_session(ports: &PortMap, registry: &ParserRegistry, port: u16) -> Option<Session> {
    let binding = ports.get(&port)?;
    let mut parser = registry.create(&binding.parser)?;
    parser.set_type(&binding.kind);
    Some(Session { parser })
}
