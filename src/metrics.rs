// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{Encoder, GaugeVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use std::fs;
use std::io;
use std::path::Path;

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static TICKS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("backtest_ticks_total", "ticks simulated").unwrap());

pub static FILLS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("backtest_fills_total", "settled fills by kind"), &["kind"]).unwrap()
});

pub static BOOK_REFRESHES: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("backtest_book_refreshes_total", "order book rebuilds").unwrap());

pub static RUNS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("backtest_runs_total", "completed runs by outcome"), &["outcome"]).unwrap()
});

pub static FINAL_BALANCE: Lazy<GaugeVec> = Lazy::new(|| {
    GaugeVec::new(Opts::new("backtest_final_balance", "balance at end of run"), &["run"]).unwrap()
});

pub fn init() {
    // Register all metrics to the custom registry; a second init is a no-op
    for m in [
        REGISTRY.register(Box::new(TICKS.clone())),
        REGISTRY.register(Box::new(FILLS.clone())),
        REGISTRY.register(Box::new(BOOK_REFRESHES.clone())),
        REGISTRY.register(Box::new(RUNS.clone())),
        REGISTRY.register(Box::new(FINAL_BALANCE.clone())),
    ] {
        let _ = m;
    }
}

// Encode all metrics in Prometheus text format
pub fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

/// Dump the registry to `path` (node-exporter textfile style).
pub fn write_metrics(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(path, encode_metrics())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_families_show_up_in_text() {
        init();
        init();
        FILLS.with_label_values(&["entry"]).inc();
        RUNS.with_label_values(&["finished"]).inc();
        let text = String::from_utf8(encode_metrics()).unwrap();
        assert!(text.contains("backtest_fills_total{kind=\"entry\"}"));
        assert!(text.contains("backtest_runs_total{outcome=\"finished\"}"));
    }
}
