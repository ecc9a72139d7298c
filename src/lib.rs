//! # Tracker Daemon - GPS/GLONASS Fleet Tracking Ingest
//!
//! This crate accepts persistent TCP connections from hardware trackers,
//! decodes their vendor line protocol incrementally, and records every decoded
//! fix in a sharded PostgreSQL store.
//!
//! ## Architecture
//!
//! - **Parser**: per-connection incremental decoders behind one trait, picked
//!   by name from a registry (ST270 ships built in)
//! - **Session**: one manager per worker thread owning the connection -> parser
//!   table and driving the parse/respond loop
//! - **Queue**: unbounded multi-producer handoff from workers to the writer
//! - **Saver**: the single writer; resolves device identity through a
//!   read-through cache and writes on the connection chosen by tracker id
//! - **Server**: listeners, worker threads and per-connection I/O tasks
//!
//! ## Example
//!
//! ```rust
//! use tracker_daemon::parser::{Outcome, ParserRegistry};
//!
//! let registry = ParserRegistry::builtin();
//! let mut p = registry.create("st270").unwrap();
//! p.set_type("st270");
//!
//! p.load(b"ST270ALV;");
//! assert_eq!(p.parse(), Outcome::Incomplete);
//!
//! p.load(b"DEV1\r");
//! assert_eq!(p.parse(), Outcome::Skip);
//! assert_eq!(p.data().num, "DEV1");
//! ```
pub mod config;
pub mod error;
pub mod identity;
pub mod metrics;
pub mod parser;
pub mod queue;
pub mod saver;
pub mod server;
pub mod session;
pub mod st270;
pub mod store;
