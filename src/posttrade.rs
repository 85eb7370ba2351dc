// ===============================
// src/posttrade.rs
// ===============================
//
// After a run: one summary record, a digest of the fill ledger for
// run-vs-run comparison, and the summary log line.
//
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::backtest::BacktestResult;
use crate::domain::{Fill, FillKind};

/// Human-readable UTC time for a tape timestamp.
pub fn format_ts(ts_ms: u64) -> String {
    i64::try_from(ts_ms)
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
        .unwrap_or_else(|| ts_ms.to_string())
}

/// SHA-256 over the ledger's canonical form: one line per fill with the
/// fields that define it, floats as raw bits so equal ledgers hash equal.
pub fn ledger_digest(fills: &[Fill]) -> String {
    let mut h = Sha256::new();
    for f in fills {
        let line = format!(
            "{}|{}|{}|{}|{:016x}|{:016x}|{:016x}|{:016x}|{:016x}|{:016x}|{:016x}|{:016x}\n",
            f.tick_index,
            f.timestamp_ms,
            f.pside.as_str(),
            f.kind.as_str(),
            f.qty.to_bits(),
            f.price.to_bits(),
            f.fee_paid.to_bits(),
            f.pnl.to_bits(),
            f.balance.to_bits(),
            f.position.long.size.to_bits(),
            f.position.shrt.size.to_bits(),
            f.liq_price.to_bits(),
        );
        h.update(line.as_bytes());
    }
    hex::encode(h.finalize())
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run: String,
    pub outcome: String,
    pub did_finish: bool,
    pub ticks_processed: usize,
    pub book_refreshes: u64,
    pub n_fills: usize,
    pub n_entries: usize,
    pub n_closes: usize,
    pub n_liquidations: usize,
    pub starting_balance: f64,
    pub final_balance: f64,
    pub final_equity: f64,
    pub gain: f64,
    pub fees_paid: f64,
    pub realized_pnl: f64,
    pub closest_liq: f64,
    pub first_ts: String,
    pub last_ts: String,
    pub ledger_sha256: String,
}

impl RunSummary {
    pub fn build(run: &str, starting_balance: f64, res: &BacktestResult) -> Self {
        let count = |k: fn(&FillKind) -> bool| res.fills.iter().filter(|f| k(&f.kind)).count();
        let final_equity = res.final_equity;
        Self {
            run: run.to_string(),
            outcome: res.outcome.as_str().to_string(),
            did_finish: res.outcome.did_finish(),
            ticks_processed: res.ticks_processed,
            book_refreshes: res.book_refreshes,
            n_fills: res.fills.len(),
            n_entries: count(|k| *k == FillKind::Entry),
            n_closes: count(|k| *k == FillKind::Close),
            n_liquidations: count(FillKind::is_liquidation),
            starting_balance,
            final_balance: res.final_account.balance,
            final_equity,
            gain: final_equity / starting_balance,
            fees_paid: res.fills.iter().map(|f| f.fee_paid).sum(),
            realized_pnl: res.fills.iter().map(|f| f.pnl).sum(),
            closest_liq: res.closest_liq,
            first_ts: format_ts(res.first_ts),
            last_ts: format_ts(res.last_ts),
            ledger_sha256: ledger_digest(&res.fills),
        }
    }

    pub fn log(&self) {
        if self.did_finish {
            info!(
                run = %self.run,
                outcome = %self.outcome,
                fills = self.n_fills,
                balance = self.final_balance,
                equity = self.final_equity,
                gain = self.gain,
                closest_liq = self.closest_liq,
                from = %self.first_ts,
                to = %self.last_ts,
                digest = %self.ledger_sha256,
                "run summary"
            );
        } else {
            warn!(
                run = %self.run,
                outcome = %self.outcome,
                fills = self.n_fills,
                liquidations = self.n_liquidations,
                balance = self.final_balance,
                last = %self.last_ts,
                digest = %self.ledger_sha256,
                "run stopped early"
            );
        }
    }
}
