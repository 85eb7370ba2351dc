// ===============================
// src/feed.rs
// ===============================
//
// Tick sources for the backtester:
// - load_ticks  : CSV (Binance aggTrades dump or bare price,maker,ts triples)
//                 or JSON array of [price, is_buyer_maker, timestamp]
// - compress    : collapse consecutive ticks with the same (price, side)
// - mock_ticks  : seeded random walk, reproducible across runs
//
use std::fs::File;
use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::Value;
use thiserror::Error;
use tracing::info;

use crate::domain::Tick;
use crate::numeric::round_;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("reading ticks {path}: {source}")]
    Io { path: String, #[source] source: std::io::Error },
    #[error("parsing ticks {path} row {row}: {reason}")]
    Parse { path: String, row: usize, reason: String },
    #[error("ticks out of order at row {row}: {ts} < {prev}")]
    Unordered { row: usize, prev: u64, ts: u64 },
}

fn parse_err(path: &str, row: usize, reason: impl Into<String>) -> FeedError {
    FeedError::Parse { path: path.to_string(), row, reason: reason.into() }
}

fn parse_maker(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "1.0" => Some(true),
        "false" | "0" | "0.0" => Some(false),
        _ => None,
    }
}

/// Timestamps must be non-decreasing.
pub fn check_ordered(ticks: &[Tick]) -> Result<(), FeedError> {
    for (i, w) in ticks.windows(2).enumerate() {
        if w[1].timestamp_ms < w[0].timestamp_ms {
            return Err(FeedError::Unordered { row: i + 1, prev: w[0].timestamp_ms, ts: w[1].timestamp_ms });
        }
    }
    Ok(())
}

/// CSV with a header row naming `price`, `is_buyer_maker` and
/// `transact_time`/`timestamp`; headerless files are read as triples.
pub fn parse_csv<R: std::io::Read>(path: &str, reader: R) -> Result<Vec<Tick>, FeedError> {
    let mut rdr = csv::ReaderBuilder::new().has_headers(false).trim(csv::Trim::All).from_reader(reader);
    let mut records = rdr.records();
    let mut ticks = Vec::new();

    let first = match records.next() {
        None => return Ok(ticks),
        Some(r) => r.map_err(|e| parse_err(path, 0, e.to_string()))?,
    };
    let col = |name: &str| first.iter().position(|h| h.eq_ignore_ascii_case(name));
    let (cols, pending) = match (col("price"), col("is_buyer_maker"), col("transact_time").or(col("timestamp"))) {
        (Some(p), Some(m), Some(t)) => ((p, m, t), None),
        _ => ((0, 1, 2), Some(first)),
    };

    let rows = pending.into_iter().map(Ok).chain(records);
    for (row, rec) in rows.enumerate() {
        let rec = rec.map_err(|e| parse_err(path, row, e.to_string()))?;
        let field = |i: usize| rec.get(i).ok_or_else(|| parse_err(path, row, format!("missing column {i}")));
        let price: f64 = field(cols.0)?.parse().map_err(|_| parse_err(path, row, "bad price"))?;
        let maker = parse_maker(field(cols.1)?).ok_or_else(|| parse_err(path, row, "bad is_buyer_maker"))?;
        let ts: f64 = field(cols.2)?.parse().map_err(|_| parse_err(path, row, "bad timestamp"))?;
        if !price.is_finite() || price <= 0.0 || !ts.is_finite() || ts < 0.0 {
            return Err(parse_err(path, row, "non-positive price or timestamp"));
        }
        ticks.push(Tick::new(price, maker, ts as u64));
    }
    check_ordered(&ticks)?;
    Ok(ticks)
}

/// JSON array of `[price, is_buyer_maker, timestamp]` triples; the maker
/// flag may be a bool or 0/1.
pub fn parse_json(path: &str, text: &str) -> Result<Vec<Tick>, FeedError> {
    let rows: Vec<Vec<Value>> = serde_json::from_str(text).map_err(|e| parse_err(path, 0, e.to_string()))?;
    let mut ticks = Vec::with_capacity(rows.len());
    for (row, v) in rows.iter().enumerate() {
        let [p, m, t] = v.as_slice() else {
            return Err(parse_err(path, row, "expected [price, is_buyer_maker, timestamp]"));
        };
        let price = p.as_f64().filter(|x| x.is_finite() && *x > 0.0).ok_or_else(|| parse_err(path, row, "bad price"))?;
        let maker = match m {
            Value::Bool(b) => *b,
            other => other.as_f64().map(|x| x != 0.0).ok_or_else(|| parse_err(path, row, "bad is_buyer_maker"))?,
        };
        let ts = t.as_f64().filter(|x| x.is_finite() && *x >= 0.0).ok_or_else(|| parse_err(path, row, "bad timestamp"))?;
        ticks.push(Tick::new(price, maker, ts as u64));
    }
    check_ordered(&ticks)?;
    Ok(ticks)
}

/// Load by extension: `.json` as JSON, anything else as CSV.
pub fn load_ticks(path: &Path) -> Result<Vec<Tick>, FeedError> {
    let shown = path.display().to_string();
    let io_err = |source| FeedError::Io { path: shown.clone(), source };
    let ticks = if path.extension().is_some_and(|e| e.eq_ignore_ascii_case("json")) {
        let text = std::fs::read_to_string(path).map_err(io_err)?;
        parse_json(&shown, &text)?
    } else {
        parse_csv(&shown, File::open(path).map_err(io_err)?)?
    };
    info!(path = %shown, ticks = ticks.len(), "ticks loaded");
    Ok(ticks)
}

/// Keep only the first tick of every run of equal (price, side).
pub fn compress_ticks(ticks: &[Tick]) -> Vec<Tick> {
    let mut out: Vec<Tick> = Vec::with_capacity(ticks.len());
    for t in ticks {
        match out.last() {
            Some(prev) if prev.price == t.price && prev.is_sell_side == t.is_sell_side => {}
            _ => out.push(*t),
        }
    }
    out
}

/// Seeded random walk around `start_price`: +-5 bps steps, random aggressor,
/// 1..=500 ms between trades. Same seed, same tape.
pub fn mock_ticks(seed: u64, n: usize, start_price: f64) -> Vec<Tick> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut price = start_price;
    let mut ts: u64 = 1_600_000_000_000;
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        let step: i32 = rng.gen_range(-5..=5);
        price = round_((price * (1.0 + step as f64 * 1e-4)).max(start_price * 0.01), 1e-4);
        ts += rng.gen_range(1..=500);
        out.push(Tick::new(price, rng.gen_bool(0.5), ts));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_with_aggtrades_header() {
        let text = "agg_trade_id,price,quantity,first_trade_id,last_trade_id,transact_time,is_buyer_maker\n\
                    1,100.5,2,1,1,1000,true\n\
                    2,100.4,1,2,3,1001,false\n";
        let ticks = parse_csv("mem", text.as_bytes()).unwrap();
        assert_eq!(ticks, vec![Tick::new(100.5, true, 1000), Tick::new(100.4, false, 1001)]);
    }

    #[test]
    fn csv_bare_triples() {
        let ticks = parse_csv("mem", "10.0,1,5\n10.5,0,6\n".as_bytes()).unwrap();
        assert_eq!(ticks.len(), 2);
        assert!(ticks[0].is_sell_side && !ticks[1].is_sell_side);
        assert_eq!(ticks[1].timestamp_ms, 6);
    }

    #[test]
    fn csv_rejects_unordered_and_garbage() {
        assert!(matches!(parse_csv("mem", "10,1,5\n10,1,4\n".as_bytes()), Err(FeedError::Unordered { row: 1, .. })));
        assert!(matches!(parse_csv("mem", "10,maybe,5\n".as_bytes()), Err(FeedError::Parse { .. })));
        assert!(matches!(parse_csv("mem", "-1,1,5\n".as_bytes()), Err(FeedError::Parse { .. })));
    }

    #[test]
    fn json_triples() {
        let ticks = parse_json("mem", "[[100.0, 1, 10], [101.0, false, 11]]").unwrap();
        assert_eq!(ticks, vec![Tick::new(100.0, true, 10), Tick::new(101.0, false, 11)]);
        assert!(parse_json("mem", "[[100.0, 1]]").is_err());
    }

    #[test]
    fn compression_keeps_first_of_run() {
        let ticks = vec![
            Tick::new(1.0, true, 1),
            Tick::new(1.0, true, 2),
            Tick::new(1.0, false, 3),
            Tick::new(2.0, false, 4),
            Tick::new(2.0, false, 5),
            Tick::new(1.0, true, 6),
        ];
        let c = compress_ticks(&ticks);
        let ts: Vec<u64> = c.iter().map(|t| t.timestamp_ms).collect();
        assert_eq!(ts, vec![1, 3, 4, 6]);
    }

    #[test]
    fn mock_is_reproducible() {
        let a = mock_ticks(7, 500, 100.0);
        assert_eq!(a, mock_ticks(7, 500, 100.0));
        assert_ne!(a, mock_ticks(8, 500, 100.0));
        assert!(check_ordered(&a).is_ok());
        assert!(a.iter().all(|t| t.price > 0.0));
    }
}
