use std::{collections::HashSet, fs};

use anyhow::{Context, Result};
use tracker_daemon::parser::{decode_buffered, Outcome, ParserRegistry};

fn main() -> Result<()> {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "data/capture.st270".to_string());
    let bytes = fs::read(&path).with_context(|| format!("open {path}"))?;

    let mut p = ParserRegistry::builtin()
        .create("st270")
        .context("st270 parser not registered")?;
    p.load(&bytes);

    let mut devices = HashSet::<String>::new();
    let (mut fixes, mut alive, mut short, mut corrupt) = (0u64, 0u64, 0u64, 0u64);

    decode_buffered(p.as_mut(), |outcome, fix| {
        match outcome {
            Outcome::Parsed => fixes += 1,
            Outcome::Skip => alive += 1,
            Outcome::Incomplete => short += 1,
            Outcome::Corrupt => corrupt += 1,
        }
        if !fix.num.is_empty() {
            devices.insert(fix.num.clone());
        }
    });

    println!("unique_devices={}", devices.len());
    println!("fixes={}", fixes);
    println!("alive={}", alive);
    println!("short={}", short);
    println!("corrupt={}", corrupt);
    println!("trailing_bytes={}", p.buffered().len());
    Ok(())
}
