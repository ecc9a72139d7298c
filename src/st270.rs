// src/st270.rs
//! ST270 line protocol.
//!
//! One report per line, lines end with a single `\r`, fields are separated by
//! `;`. The first field names the report kind, the second is the device
//! number. Position reports carry a fixed 24-field body followed by a short
//! kind-specific tail:
//!
//! ```text
//! ST270STT;DEV1;1.0;20160901;12:15:00;CELL1;55.7500;37.6100;60;180;8;7;1;100;0;0;1500;...;M;123\r
//! ```
//!
//! A framed report that is too short or carries an unreadable date/time is
//! dropped and reported as `Incomplete`; the connection stays up.

use chrono::NaiveDateTime;
use std::str::FromStr;
use tracing::{trace, warn};

use crate::parser::{Outcome, ParserState, TrackerParser};

const DELIMITER: u8 = b'\r';
const SEPARATOR: char = ';';

const HDR_ALIVE: &str = "ST270ALV";
const HDR_STATUS: &str = "ST270STT";
const HDR_EMERGENCY: &str = "ST270EMG";
const HDR_EVENT: &str = "ST270EVT";
const HDR_ALERT: &str = "ST270ALT";

/// Fields in the common report body, after the device number.
pub const BODY_FIELDS: usize = 24;

// Body field offsets.
const DATE: usize = 1;
const TIME: usize = 2;
const LAT: usize = 4;
const LON: usize = 5;
const SPEED: usize = 6;
const COURSE: usize = 7;
const SATS_GPS: usize = 8;
const SATS_GLONASS: usize = 9;
const DISTANCE: usize = 14;

const IN_FORMATS: [&str; 2] = ["%Y%m%d %H:%M:%S", "%Y%m%d %H%M%S"];
const OUT_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Report {
    Status,
    Emergency,
    Event,
    Alert,
}

impl Report {
    fn from_header(hdr: &str) -> Option<Self> {
        match hdr {
            HDR_STATUS => Some(Report::Status),
            HDR_EMERGENCY => Some(Report::Emergency),
            HDR_EVENT => Some(Report::Event),
            HDR_ALERT => Some(Report::Alert),
            _ => None,
        }
    }

    /// Reads the kind-specific trailer. None of it lands on the fix.
    fn read_tail(self, tail: &[&str]) {
        let field = |i: usize| tail.get(i).copied().unwrap_or("");
        match self {
            Report::Status => trace!(mode = field(0), msg_num = field(1), "st270 status tail"),
            Report::Emergency => trace!(emg_id = field(0), "st270 emergency tail"),
            Report::Event => trace!(evt_id = field(0), "st270 event tail"),
            Report::Alert => trace!(alert_id = field(0), "st270 alert tail"),
        }
    }
}

#[derive(Debug, Default)]
pub struct St270Parser {
    state: ParserState,
}

impl St270Parser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cuts the next `\r`-terminated line off the buffer, terminator included.
    fn next_line(&mut self) -> Option<Vec<u8>> {
        let end = self.state.buffer.iter().position(|&b| b == DELIMITER)?;
        let line = self.state.buffer[..end].to_vec();
        self.state.consume(end + 1);
        Some(line)
    }

    fn parse_report(&mut self, line: &[u8]) -> Outcome {
        let Ok(line) = std::str::from_utf8(line) else {
            warn!("st270: non-ascii report dropped");
            return Outcome::Corrupt;
        };
        let line = line.trim_start_matches('\n');
        if line.is_empty() {
            return Outcome::Skip;
        }

        let v: Vec<&str> = line.split(SEPARATOR).collect();
        if v.len() < 2 {
            return Outcome::Corrupt;
        }

        self.state.reset_data();
        self.state.data.num = v[1].to_owned();

        if v[0] == HDR_ALIVE {
            return Outcome::Skip;
        }

        let Some(report) = Report::from_header(v[0]) else {
            return Outcome::Corrupt;
        };

        let body = &v[2..];
        if body.len() < BODY_FIELDS {
            warn!(
                num = %self.state.data.num,
                fields = body.len(),
                "st270: short report dropped"
            );
            return Outcome::Incomplete;
        }

        if !self.read_body(&body[..BODY_FIELDS]) {
            return Outcome::Incomplete;
        }
        report.read_tail(&body[BODY_FIELDS..]);

        Outcome::Parsed
    }

    fn read_body(&mut self, body: &[&str]) -> bool {
        let Some(datetime) = conv_datetime(body[DATE], body[TIME]) else {
            warn!(
                num = %self.state.data.num,
                date = body[DATE],
                time = body[TIME],
                "st270: report with bad datetime dropped"
            );
            return false;
        };

        let d = &mut self.state.data;
        d.datetime = datetime;
        d.lat = number(body[LAT]);
        d.lon = number(body[LON]);
        d.speed = number(body[SPEED]);
        d.course = number(body[COURSE]);
        d.sats_gps = number(body[SATS_GPS]);
        d.sats_glonass = number(body[SATS_GLONASS]);
        d.odometer = meters(body[DISTANCE]) / 1000;
        true
    }
}

impl TrackerParser for St270Parser {
    fn state(&self) -> &ParserState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ParserState {
        &mut self.state
    }

    fn parse(&mut self) -> Outcome {
        match self.next_line() {
            Some(line) => self.parse_report(&line),
            None => Outcome::Incomplete,
        }
    }
}

/// Lenient numeric field: anything unparseable reads as zero.
fn number<T: FromStr + Default>(s: &str) -> T {
    s.trim().parse().unwrap_or_default()
}

/// Distance in whole meters; a fractional part is truncated, garbage reads as zero.
fn meters(s: &str) -> u32 {
    number::<f64>(s) as u32
}

/// `YYYYMMDD` + `HH:MM:SS` (or `HHMMSS`) -> `YYYY-MM-DD HH:MM:SS`.
pub fn conv_datetime(date: &str, time: &str) -> Option<String> {
    let s = format!("{} {}", date.trim(), time.trim());
    IN_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(&s, fmt).ok())
        .map(|t| t.format(OUT_FORMAT).to_string())
}
