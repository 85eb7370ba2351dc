// ===============================
// src/main.rs
// ===============================
/*
 # satu tape, dua config, jalan paralel
 grid_backtest --ticks data/XMRUSDT.csv --compress \
     --config configs/a.json,configs/b.json --out-dir backtests \
     --metrics-file backtests/metrics.prom

 # tape sintetis (deterministik per seed)
 grid_backtest --mock 200000 --seed 7 --config configs/a.json
*/
/*
=============================================================================
Project : grid_backtest_rust — deterministic tick-level grid backtester
Module  : main.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Loads (or generates) a tick tape, runs one independent backtest per
          config file on the blocking pool, streams fills / stats / snapshots
          to JSONL per run, writes a summary per run and a prometheus text
          dump at the end.
=============================================================================
*/
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use grid_backtest_rust::backtest::{run_backtest, RunControl};
use grid_backtest_rust::config::{self, Args, BacktestConfig};
use grid_backtest_rust::domain::{Event, Tick};
use grid_backtest_rust::feed;
use grid_backtest_rust::metrics;
use grid_backtest_rust::posttrade::RunSummary;
use grid_backtest_rust::recorder::{self, ChannelRecorder};

const MOCK_START_PRICE: f64 = 100.0;

fn run_name(path: &Path) -> String {
    path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_else(|| "run".to_string())
}

fn load_tape(args: &Args) -> Result<Vec<Tick>, feed::FeedError> {
    let ticks = match (args.mock, &args.ticks) {
        (Some(n), _) => {
            info!(n, seed = args.seed, "generating mock ticks");
            feed::mock_ticks(args.seed, n, MOCK_START_PRICE)
        }
        (None, Some(path)) => feed::load_ticks(path)?,
        (None, None) => Vec::new(),
    };
    if args.compress {
        let before = ticks.len();
        let compressed = feed::compress_ticks(&ticks);
        info!(before, after = compressed.len(), "ticks compressed");
        return Ok(compressed);
    }
    Ok(ticks)
}

/// One config file, start to finish. Returns false when the run could not
/// be carried out.
async fn run_one(
    cfg_path: PathBuf,
    cfg: BacktestConfig,
    ticks: Arc<Vec<Tick>>,
    out_dir: PathBuf,
    ctl: RunControl,
) -> bool {
    let name = run_name(&cfg_path);
    let run_dir = out_dir.join(&name);

    // ---- Recorder ----
    let (rec_tx, rec_rx) = mpsc::channel::<Event>(8192);
    let writer = tokio::spawn(recorder::run(rec_rx, run_dir.join("events.jsonl")));
    if let Ok(cfg_json) = serde_json::to_string(&cfg) {
        let _ = rec_tx.send(Event::Note(format!("config {}: {cfg_json}", cfg_path.display()))).await;
    }

    // ---- Simulation (blocking pool) ----
    let sim_cfg = cfg.clone();
    let sim = tokio::task::spawn_blocking(move || {
        let mut rec = ChannelRecorder::new(rec_tx);
        let res = run_backtest(&ticks, &sim_cfg, &mut rec, &ctl);
        (res, rec.dropped())
    });

    let (res, dropped) = match sim.await {
        Ok(r) => r,
        Err(e) => {
            error!(run = %name, ?e, "simulation task failed");
            return false;
        }
    };
    match writer.await {
        Ok(Ok(events)) => info!(run = %name, events, "events written"),
        Ok(Err(e)) => error!(run = %name, ?e, "recorder failed"),
        Err(e) => error!(run = %name, ?e, "recorder task failed"),
    }
    if dropped > 0 {
        warn!(run = %name, dropped, "events dropped");
    }

    let res = match res {
        Ok(r) => r,
        Err(e) => {
            error!(run = %name, error = %e, "backtest failed");
            return false;
        }
    };

    let summary = RunSummary::build(&name, cfg.starting_balance, &res);
    summary.log();
    metrics::FINAL_BALANCE.with_label_values(&[name.as_str()]).set(res.final_account.balance);

    match serde_json::to_vec_pretty(&summary) {
        Ok(body) => {
            if let Err(e) = tokio::fs::write(run_dir.join("summary.json"), body).await {
                error!(run = %name, ?e, "write summary failed");
            }
        }
        Err(e) => error!(run = %name, ?e, "serialize summary failed"),
    }
    true
}

#[tokio::main]
async fn main() -> ExitCode {
    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ---- Args & metrics ----
    let args = config::load_args();
    metrics::init();

    // ---- Tick tape ----
    let ticks = match load_tape(&args) {
        Ok(t) => Arc::new(t),
        Err(e) => {
            error!(error = %e, "cannot load ticks");
            return ExitCode::FAILURE;
        }
    };
    info!(ticks = ticks.len(), configs = args.configs.len(), out_dir = %args.out_dir.display(), "startup");

    // ---- Ctrl-C -> abort flag (checked between ticks) ----
    let abort = Arc::new(AtomicBool::new(false));
    tokio::spawn({
        let abort = abort.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("ctrl-c: stopping runs");
                abort.store(true, Ordering::Relaxed);
            }
        }
    });

    // ---- Runs ----
    let mut failures = 0usize;
    let mut runs = Vec::new();
    for path in &args.configs {
        let cfg = match config::load_file(path) {
            Ok(c) => c,
            Err(e) => {
                error!(config = %path.display(), error = %e, "invalid config");
                failures += 1;
                continue;
            }
        };
        let ctl = RunControl { abort: Some(abort.clone()), max_ticks: args.max_ticks };
        runs.push(run_one(path.clone(), cfg, ticks.clone(), args.out_dir.clone(), ctl));
    }
    failures += join_all(runs).await.into_iter().filter(|ok| !ok).count();

    // ---- Metrics dump ----
    if let Some(path) = &args.metrics_file {
        if let Err(e) = metrics::write_metrics(path) {
            error!(path = %path.display(), ?e, "write metrics failed");
        }
    }

    if failures > 0 {
        error!(failures, "some runs failed");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
