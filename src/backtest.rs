// ===============================
// src/backtest.rs
// ===============================
//
// Tick replay loop. Per tick (from index ema_span on):
//   indicators -> periodic snapshot -> periodic stats
//   -> liquidation pre-check | book matching -> observed thresholds
//   -> book refresh (debounced) -> settle fills (may stop the run)
//
// Single-threaded and synchronous; run independent backtests in parallel
// by giving each one its own thread.
//
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::book::{ObservedThresholds, OrderBook, RefreshClock};
use crate::config::{BacktestConfig, ConfigError};
use crate::domain::{
    Fill, FillKind, OrderKind, PSide, Position, Side, SnapshotTrigger, StateSnapshot, StatsRecord, Tick,
};
use crate::feed::FeedError;
use crate::indicators::{IndicatorChunk, IndicatorError, IndicatorStream};
use crate::metrics::{BOOK_REFRESHES, FILLS, RUNS, TICKS};
use crate::numeric::{calc_cost, calc_diff, nan_to_0};
use crate::positions::Account;
use crate::recorder::Recorder;
use crate::risk::check_liquidation;
use crate::strategy::GridInput;

const MS_PER_DAY: f64 = 86_400_000.0;
const SNAPSHOT_DEPTH: usize = 5;

#[derive(Debug, Error)]
pub enum BacktestError {
    #[error(transparent)]
    Indicator(#[from] IndicatorError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Feed(#[from] FeedError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason { Insolvent, Liquidated, Aborted }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome { Finished, StoppedEarly(StopReason) }

impl RunOutcome {
    pub fn did_finish(&self) -> bool { matches!(self, RunOutcome::Finished) }
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Finished => "finished",
            RunOutcome::StoppedEarly(StopReason::Insolvent) => "insolvent",
            RunOutcome::StoppedEarly(StopReason::Liquidated) => "liquidated",
            RunOutcome::StoppedEarly(StopReason::Aborted) => "aborted",
        }
    }
}

/// External stop conditions, checked between ticks.
#[derive(Debug, Clone, Default)]
pub struct RunControl {
    pub abort: Option<Arc<AtomicBool>>,
    pub max_ticks: Option<usize>,
}

impl RunControl {
    fn should_stop(&self, processed: usize) -> bool {
        self.abort.as_ref().is_some_and(|a| a.load(Ordering::Relaxed))
            || self.max_ticks.is_some_and(|m| processed >= m)
    }
}

#[derive(Debug, Clone)]
pub struct BacktestResult {
    pub outcome: RunOutcome,
    pub fills: Vec<Fill>,
    pub stats: Vec<StatsRecord>,
    pub final_account: Account,
    pub final_equity: f64,
    pub closest_liq: f64,
    pub ticks_processed: usize,
    pub book_refreshes: u64,
    pub first_ts: u64,
    pub last_ts: u64,
}

/// Matched but not yet settled.
struct PendingFill {
    pside: PSide,
    kind: FillKind,
    qty: f64,
    price: f64,
    pnl: f64,
    fee_paid: f64,
    position: Position,
}

/// Mutable state of one run.
struct SimState<'a, R: Recorder> {
    cfg: &'a BacktestConfig,
    rec: &'a mut R,
    acct: Account,
    book: OrderBook,
    ob: ObservedThresholds,
    clock: RefreshClock,
    start_ts: u64,
    next_stats_ts: u64,
    closest_liq: f64,
    fills: Vec<Fill>,
    stats: Vec<StatsRecord>,
    book_refreshes: u64,
}

impl<'a, R: Recorder> SimState<'a, R> {
    fn new(cfg: &'a BacktestConfig, ticks: &'a [Tick], rec: &'a mut R) -> Self {
        let start_ts = ticks[cfg.ema_span].timestamp_ms;
        Self {
            cfg,
            rec,
            acct: Account::new(cfg.starting_balance),
            book: OrderBook::new(),
            ob: ObservedThresholds::from_opening(&ticks[0], &ticks[1]),
            clock: RefreshClock::new(start_ts, cfg.latency_simulation_ms, cfg.forced_refresh_ms),
            start_ts,
            next_stats_ts: 0,
            closest_liq: 1.0,
            fills: Vec::new(),
            stats: Vec::new(),
            book_refreshes: 0,
        }
    }

    fn record_stats(&mut self, tick: &Tick) {
        let s = StatsRecord {
            timestamp_ms: tick.timestamp_ms,
            balance: self.acct.balance,
            equity: self.acct.equity(tick.price),
        };
        self.rec.on_stats(&s);
        self.stats.push(s);
    }

    fn snapshot(&mut self, k: usize, tick: &Tick, ema: f64, volatility: f64, fill_kind: Option<FillKind>) {
        let periodic = fill_kind.is_none();
        let (bids, asks) = if periodic { self.book.top_levels(SNAPSHOT_DEPTH) } else { (Vec::new(), Vec::new()) };
        let snap = StateSnapshot {
            tick_index: k,
            timestamp_ms: tick.timestamp_ms,
            price: tick.price,
            trigger: if periodic { SnapshotTrigger::Periodic } else { SnapshotTrigger::Fill },
            fill_kind,
            ema,
            volatility,
            position: self.acct.position,
            balance: self.acct.balance,
            equity: self.acct.equity(tick.price),
            bids,
            asks,
            bid_thr: periodic.then_some(self.ob.highest_bid),
            ask_thr: periodic.then_some(self.ob.lowest_ask),
        };
        self.rec.on_snapshot(&snap);
    }

    /// Liquidation pre-check, else normal matching. Position moves now,
    /// balance only when the fills are settled.
    fn match_tick(&mut self, tick: &Tick) -> Vec<PendingFill> {
        if let Some(fc) = check_liquidation(tick, &mut self.acct, self.cfg) {
            return vec![PendingFill {
                pside: fc.pside,
                kind: fc.kind,
                qty: fc.qty,
                price: fc.price,
                pnl: fc.pnl,
                fee_paid: fc.fee_paid,
                position: self.acct.position,
            }];
        }

        let out = self.book.match_tick(tick);
        if out.touched {
            self.clock.trigger();
        }
        let mut pending = Vec::with_capacity(out.filled.len());
        for o in out.filled {
            let pnl = self.acct.position.apply_fill(o.pside, o.qty, o.price, self.cfg.qty_step);
            pending.push(PendingFill {
                pside: o.pside,
                kind: match o.kind { OrderKind::Entry => FillKind::Entry, OrderKind::Close => FillKind::Close },
                qty: o.qty,
                price: o.price,
                pnl,
                fee_paid: -calc_cost(o.qty, o.price) * self.cfg.maker_fee,
                position: self.acct.position,
            });
        }
        pending
    }

    fn refresh_book(&mut self, tick: &Tick, ema: f64, volatility: f64) {
        self.clock.mark_refreshed(tick.timestamp_ms);
        self.acct.liq_diff = calc_diff(self.acct.liq_price, tick.price);
        self.closest_liq = self.closest_liq.min(self.acct.liq_diff);
        let input = GridInput {
            balance: self.acct.balance,
            position: self.acct.position,
            highest_bid: self.ob.highest_bid,
            lowest_ask: self.ob.lowest_ask,
            ema,
            volatility,
            last_price: tick.price,
        };
        self.book.rebuild(self.cfg, &input);
        self.book_refreshes += 1;
        BOOK_REFRESHES.inc();
    }

    /// Book the fill into balance and the ledger. Returns a stop reason when
    /// the run has to end here.
    fn settle(&mut self, k: usize, tick: &Tick, ema: f64, volatility: f64, p: PendingFill) -> Option<StopReason> {
        let cfg = self.cfg;
        self.acct.settle(p.pnl, p.fee_paid);
        self.acct.refresh_liquidation(tick.price, cfg.maintenance_margin_rate);

        let equity = self.acct.equity(tick.price);
        let gain = equity / cfg.starting_balance;
        let n_days = tick.timestamp_ms.saturating_sub(self.start_ts) as f64 / MS_PER_DAY;
        let average_daily_gain =
            if n_days > 0.5 && gain > 0.0 { nan_to_0(gain.powf(1.0 / n_days)) } else { 0.0 };

        let fill = Fill {
            tick_index: k,
            timestamp_ms: tick.timestamp_ms,
            side: Side::of_qty(p.qty),
            pside: p.pside,
            kind: p.kind,
            qty: p.qty,
            price: p.price,
            fee_paid: p.fee_paid,
            pnl: p.pnl,
            position: p.position,
            balance: self.acct.balance,
            equity,
            available_margin: self.acct.position.available_margin(self.acct.balance, tick.price, cfg.leverage),
            liq_price: self.acct.liq_price,
            liq_diff: self.acct.liq_diff,
            gain,
            n_days,
            average_daily_gain,
            closest_liq: self.closest_liq,
        };
        debug!(
            k,
            kind = fill.kind.as_str(),
            pside = fill.pside.as_str(),
            qty = fill.qty,
            price = fill.price,
            pnl = fill.pnl,
            balance = fill.balance,
            "fill"
        );
        FILLS.with_label_values(&[fill.kind.as_str()]).inc();
        self.rec.on_fill(&fill);
        self.snapshot(k, tick, ema, volatility, Some(fill.kind));
        let is_liquidation = fill.kind.is_liquidation();
        self.fills.push(fill);

        if is_liquidation {
            Some(StopReason::Liquidated)
        } else if self.acct.balance <= 0.0 {
            warn!(k, balance = self.acct.balance, "insolvent");
            Some(StopReason::Insolvent)
        } else {
            None
        }
    }
}

/// Replay `ticks` against the grid described by `cfg`.
///
/// Ticks before `ema_span` only warm up the indicators. Running out of money
/// or being liquidated is an outcome, not an error.
pub fn run_backtest<R: Recorder>(
    ticks: &[Tick],
    cfg: &BacktestConfig,
    rec: &mut R,
    ctl: &RunControl,
) -> Result<BacktestResult, BacktestError> {
    let prices: Vec<f64> = ticks.iter().map(|t| t.price).collect();
    let mut stream = IndicatorStream::new(&prices, cfg.ema_span, cfg.indicator_chunk_len)?;
    let mut chunk: IndicatorChunk = stream.next_chunk().ok_or(IndicatorError::InsufficientData {
        ticks: ticks.len(),
        span: cfg.ema_span,
    })?;

    info!(
        ticks = ticks.len(),
        ema_span = cfg.ema_span,
        balance = cfg.starting_balance,
        leverage = cfg.leverage,
        "backtest start"
    );

    let mut sim = SimState::new(cfg, ticks, rec);
    sim.record_stats(&ticks[0]);

    let mut outcome = RunOutcome::Finished;
    let mut processed = 0usize;

    'ticks: for (k, tick) in ticks.iter().enumerate().skip(cfg.ema_span) {
        if ctl.should_stop(processed) {
            outcome = RunOutcome::StoppedEarly(StopReason::Aborted);
            break;
        }
        processed += 1;

        if !chunk.contains(k) {
            match stream.next_chunk() {
                Some(c) => chunk = c,
                None => break,
            }
        }
        let Some((ema, volatility)) = chunk.at(k) else { break };

        if k % cfg.snapshot_interval == 0 {
            sim.snapshot(k, tick, ema, volatility, None);
        }

        if tick.timestamp_ms > sim.next_stats_ts {
            sim.closest_liq = sim.closest_liq.min(calc_diff(sim.acct.liq_price, tick.price));
            sim.record_stats(tick);
            sim.next_stats_ts = tick.timestamp_ms + cfg.stats_interval_ms;
        }

        let pending = sim.match_tick(tick);
        sim.ob.observe(tick);

        if sim.clock.is_due(tick.timestamp_ms) {
            sim.refresh_book(tick, ema, volatility);
        }

        for p in pending {
            let position = p.position;
            if let Some(reason) = sim.settle(k, tick, ema, volatility, p) {
                // unsettled fills of this tick are dropped with the run
                sim.acct.position = position;
                outcome = RunOutcome::StoppedEarly(reason);
                break 'ticks;
            }
        }
    }

    if outcome.did_finish() {
        if let Some(last) = ticks.last() {
            sim.record_stats(last);
        }
    }

    let last_index = (cfg.ema_span + processed).saturating_sub(1).min(ticks.len() - 1);
    let last_ts = ticks[last_index].timestamp_ms;
    let final_equity = sim.acct.equity(ticks[last_index].price);
    TICKS.inc_by(processed as u64);
    RUNS.with_label_values(&[outcome.as_str()]).inc();
    info!(
        outcome = outcome.as_str(),
        ticks = processed,
        fills = sim.fills.len(),
        refreshes = sim.book_refreshes,
        balance = sim.acct.balance,
        equity = final_equity,
        "backtest end"
    );

    Ok(BacktestResult {
        outcome,
        fills: sim.fills,
        stats: sim.stats,
        final_account: sim.acct,
        final_equity,
        closest_liq: sim.closest_liq,
        ticks_processed: processed,
        book_refreshes: sim.book_refreshes,
        first_ts: ticks[0].timestamp_ms,
        last_ts,
    })
}
