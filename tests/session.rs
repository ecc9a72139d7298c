use bytes::{BufMut, Bytes, BytesMut};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracker_daemon::config::{PortBinding, PortMap};
use tracker_daemon::metrics::Metrics;
use tracker_daemon::parser::{Outcome, ParserRegistry, ParserState, TrackerParser};
use tracker_daemon::queue::PersistQueue;
use tracker_daemon::session::{ConnId, Link, SessionManager, Verdict};

const ST270_PORT: u16 = 20100;
const ECHO_PORT: u16 = 20200;
const STATUS: &[u8] = b"ST270STT;DEV1;1.0;20160901;121500;CELL1;55.7500;37.6100;60;180;8;7;1;100;0;0;1500;120;0;0;0;0;0;0;0;0;0;M;123\r";

#[derive(Default)]
struct FakeLink {
    id: ConnId,
    port: u16,
    sent: Vec<Bytes>,
    closed: bool,
}

impl FakeLink {
    fn new(id: ConnId, port: u16) -> Self {
        Self { id, port, ..Default::default() }
    }
}

impl Link for FakeLink {
    fn id(&self) -> ConnId {
        self.id
    }

    fn local_port(&self) -> u16 {
        self.port
    }

    fn send(&mut self, bytes: Bytes) {
        self.sent.push(bytes);
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

/// Acks every `\n`-terminated line with `OK\n`; a line `BAD` is corrupt.
#[derive(Default)]
struct AckParser {
    state: ParserState,
}

impl TrackerParser for AckParser {
    fn state(&self) -> &ParserState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ParserState {
        &mut self.state
    }

    fn parse(&mut self) -> Outcome {
        let Some(end) = self.state.buffer.iter().position(|&b| b == b'\n') else {
            return Outcome::Incomplete;
        };
        let line = self.state.buffer[..end].to_vec();
        self.state.consume(end + 1);
        if line == b"BAD" {
            return Outcome::Corrupt;
        }
        self.state.response.put_slice(b"OK\n");
        self.state.data.num = String::from_utf8_lossy(&line).into_owned();
        Outcome::Parsed
    }
}

fn manager() -> (SessionManager, PersistQueue, Arc<Metrics>) {
    let mut registry = ParserRegistry::builtin();
    registry.register("ack", || Box::new(AckParser::default()));

    let mut ports = PortMap::new();
    ports.insert(
        ST270_PORT,
        PortBinding { parser: "st270".into(), kind: "st270".into() },
    );
    ports.insert(
        ECHO_PORT,
        PortBinding { parser: "ack".into(), kind: "ack-dev".into() },
    );

    let queue = PersistQueue::new();
    let metrics = Arc::new(Metrics::new());
    let m = SessionManager::new(Arc::new(ports), Arc::new(registry), queue.clone(), metrics.clone());
    (m, queue, metrics)
}

fn drain(queue: &PersistQueue) -> Vec<tracker_daemon::parser::Fix> {
    std::iter::from_fn(|| queue.try_pop()).collect()
}

#[test]
fn unknown_port_is_rejected_without_a_session() {
    let (mut m, queue, metrics) = manager();
    let mut link = FakeLink::new(1, 9999);

    assert_eq!(m.on_data(&mut link, STATUS), Verdict::Closed);
    assert!(link.closed);
    assert!(m.is_empty());
    assert!(queue.is_empty());
    assert_eq!(metrics.conn_rejected.load(Ordering::Relaxed), 1);
}

#[test]
fn session_is_created_lazily_and_stamps_port_type() {
    let (mut m, queue, _) = manager();
    let mut link = FakeLink::new(7, ST270_PORT);

    assert_eq!(m.on_data(&mut link, &STATUS[..10]), Verdict::Open);
    assert!(m.contains(7));
    assert!(queue.is_empty());

    assert_eq!(m.on_data(&mut link, &STATUS[10..]), Verdict::Open);
    let fixes = drain(&queue);
    assert_eq!(fixes.len(), 1);
    assert_eq!(fixes[0].num, "DEV1");
    assert_eq!(fixes[0].kind, "st270");
    assert!(!link.closed);
}

#[test]
fn heartbeats_loop_on_and_are_not_persisted() {
    let (mut m, queue, metrics) = manager();
    let mut link = FakeLink::new(1, ST270_PORT);

    let mut input = Vec::new();
    input.extend_from_slice(b"ST270ALV;DEV1\r");
    input.extend_from_slice(STATUS);
    input.extend_from_slice(b"ST270ALV;DEV1\r");
    input.extend_from_slice(STATUS);

    assert_eq!(m.on_data(&mut link, &input), Verdict::Open);
    assert_eq!(drain(&queue).len(), 2);
    assert_eq!(metrics.heartbeats.load(Ordering::Relaxed), 2);
    assert_eq!(metrics.fixes_parsed.load(Ordering::Relaxed), 2);
}

#[test]
fn short_report_stops_the_loop_until_the_next_read() {
    let (mut m, queue, metrics) = manager();
    let mut link = FakeLink::new(4, ST270_PORT);

    let mut input = Vec::new();
    input.extend_from_slice(b"ST270STT;DEV1;1.0;20160901;121500\r");
    input.extend_from_slice(STATUS);

    assert_eq!(m.on_data(&mut link, &input), Verdict::Open);
    assert!(!link.closed);
    assert!(queue.is_empty());

    // the valid line was left buffered and goes out with the next read
    assert_eq!(m.on_data(&mut link, b"ST270ALV;DEV1\r"), Verdict::Open);
    let fixes = drain(&queue);
    assert_eq!(fixes.len(), 1);
    assert_eq!(fixes[0].num, "DEV1");
    assert_eq!(metrics.heartbeats.load(Ordering::Relaxed), 1);
    assert_eq!(metrics.corrupt.load(Ordering::Relaxed), 0);
}

#[test]
fn corrupt_message_tears_the_connection_down() {
    let (mut m, queue, metrics) = manager();
    let mut link = FakeLink::new(3, ST270_PORT);

    let mut input = Vec::new();
    input.extend_from_slice(STATUS);
    input.extend_from_slice(b"garbage\r");
    input.extend_from_slice(STATUS);

    assert_eq!(m.on_data(&mut link, &input), Verdict::Closed);
    assert!(link.closed);
    assert!(!m.contains(3));
    // only the fix before the corrupt line made it
    assert_eq!(drain(&queue).len(), 1);
    assert_eq!(metrics.corrupt.load(Ordering::Relaxed), 1);
}

#[test]
fn responses_are_flushed_after_every_parse() {
    let (mut m, queue, _) = manager();
    let mut link = FakeLink::new(5, ECHO_PORT);

    assert_eq!(m.on_data(&mut link, b"A\nB\nC"), Verdict::Open);
    assert_eq!(link.sent, vec![Bytes::from_static(b"OK\n"), Bytes::from_static(b"OK\n")]);

    let fixes = drain(&queue);
    assert_eq!(fixes.iter().map(|f| f.num.as_str()).collect::<Vec<_>>(), ["A", "B"]);
    assert!(fixes.iter().all(|f| f.kind == "ack-dev"));

    assert_eq!(m.on_data(&mut link, b"\nBAD\n"), Verdict::Closed);
    assert_eq!(link.sent.len(), 3);
    assert_eq!(drain(&queue)[0].num, "C");
}

#[test]
fn sessions_are_independent_per_connection() {
    let (mut m, queue, _) = manager();
    let mut a = FakeLink::new(1, ST270_PORT);
    let mut b = FakeLink::new(2, ST270_PORT);

    let mut half = BytesMut::new();
    half.put_slice(&STATUS[..40]);

    m.on_data(&mut a, &half);
    m.on_data(&mut b, b"ST270ALV;DEV2\r");
    assert!(queue.is_empty());
    assert_eq!(m.len(), 2);

    m.on_data(&mut a, &STATUS[40..]);
    assert_eq!(drain(&queue).len(), 1);
}

#[test]
fn lost_connection_drops_its_session() {
    let (mut m, _, metrics) = manager();
    let mut link = FakeLink::new(11, ST270_PORT);

    m.on_data(&mut link, &STATUS[..5]);
    assert!(m.contains(11));

    m.on_closed(11);
    assert!(m.is_empty());
    m.on_closed(11);
    assert_eq!(metrics.conn_closed.load(Ordering::Relaxed), 1);
}
