// src/parser.rs
use bytes::{Buf, BytesMut};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

use crate::st270::St270Parser;

/// One decoded location report.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Fix {
    pub phone: String,
    pub num: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub datetime: String,
    pub lon: f64,
    pub lat: f64,
    pub speed: f64,
    /// Whole kilometers.
    pub odometer: u32,
    pub course: f64,
    pub sats_glonass: u32,
    pub sats_gps: u32,
}

impl fmt::Display for Fix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "num {}, type {}, datetime {}, lon {}, lat {}, speed {}, odometer {}, course {}, sats_glonass {}, sats_gps {}",
            self.num,
            self.kind,
            self.datetime,
            self.lon,
            self.lat,
            self.speed,
            self.odometer,
            self.course,
            self.sats_glonass,
            self.sats_gps,
        )
    }
}

/// Result of a single `parse()` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// A full fix is available through `data()`.
    Parsed,
    /// A content-free message (heartbeat) was consumed.
    Skip,
    /// Not enough input yet.
    Incomplete,
    /// Framing found, content unusable. The connection must go.
    Corrupt,
}

impl Outcome {
    #[inline]
    pub fn parsed(self) -> bool {
        matches!(self, Outcome::Parsed | Outcome::Skip)
    }

    #[inline]
    pub fn skip(self) -> bool {
        self == Outcome::Skip
    }

    #[inline]
    pub fn corrupt(self) -> bool {
        self == Outcome::Corrupt
    }
}

/// Buffers shared by every protocol implementation.
#[derive(Debug, Default)]
pub struct ParserState {
    pub buffer: BytesMut,
    pub response: BytesMut,
    pub data: Fix,
}

impl ParserState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops `n` bytes from the front of the input; clears it if `n` overshoots.
    pub fn consume(&mut self, n: usize) {
        if n >= self.buffer.len() {
            self.buffer.clear();
        } else {
            self.buffer.advance(n);
        }
    }

    pub fn consume_all(&mut self) {
        self.buffer.clear();
    }

    /// Starts a fresh record that keeps the preset device type.
    pub fn reset_data(&mut self) {
        let kind = std::mem::take(&mut self.data.kind);
        self.data = Fix {
            kind,
            ..Fix::default()
        };
    }
}

/// A stateful, incremental tracker protocol decoder.
///
/// Implementations only provide `parse()` and access to their `ParserState`;
/// buffering, the response queue and type stamping come for free.
pub trait TrackerParser: Send {
    fn state(&self) -> &ParserState;

    fn state_mut(&mut self) -> &mut ParserState;

    /// Tries to take exactly one message off the front of the buffer.
    fn parse(&mut self) -> Outcome;

    fn load(&mut self, bytes: &[u8]) {
        self.state_mut().buffer.extend_from_slice(bytes);
    }

    fn data(&self) -> &Fix {
        &self.state().data
    }

    /// Acknowledgement bytes queued by the last `parse()`.
    fn response(&mut self) -> &mut BytesMut {
        &mut self.state_mut().response
    }

    fn set_type(&mut self, name: &str) {
        self.state_mut().data.kind = name.to_owned();
    }

    fn buffered(&self) -> &[u8] {
        &self.state().buffer
    }
}

/// Runs `parse()` until the buffer stops shrinking, reporting every message
/// taken off it, short and corrupt ones included. For offline decoding: the
/// daemon stops at the first incomplete or corrupt result instead.
pub fn decode_buffered(p: &mut dyn TrackerParser, mut on: impl FnMut(Outcome, &Fix)) {
    loop {
        let before = p.buffered().len();
        let out = p.parse();
        p.response().clear();
        if out == Outcome::Incomplete && p.buffered().len() == before {
            break;
        }
        on(out, p.data());
    }
}

pub type ParserCtor = fn() -> Box<dyn TrackerParser>;

/// Protocol name -> constructor.
#[derive(Clone, Default)]
pub struct ParserRegistry {
    ctors: HashMap<String, ParserCtor>,
}

impl ParserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every protocol this crate ships.
    pub fn builtin() -> Self {
        let mut r = Self::new();
        r.register("st270", || Box::new(St270Parser::new()));
        r
    }

    pub fn register(&mut self, name: &str, ctor: ParserCtor) {
        self.ctors.insert(name.to_owned(), ctor);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.ctors.contains_key(name)
    }

    pub fn create(&self, name: &str) -> Option<Box<dyn TrackerParser>> {
        self.ctors.get(name).map(|ctor| ctor())
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.ctors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
