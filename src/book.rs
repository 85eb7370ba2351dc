// ===============================
// src/book.rs
// ===============================
//
// Synthetic two-sided book holding only our own resting orders.
// - bids: descending price, asks: ascending price
// - a tick sweeps strictly through the book (equality never fills)
// - the whole book is regenerated on refresh, never amended
// - each side only meets ticks from its own side, so bids above asks
//   (crossed observed thresholds, hedge mode) are left resting
//
use tracing::trace;

use crate::config::BacktestConfig;
use crate::domain::{BookLevel, Order, Tick};
use crate::strategy::{long_closes, shrt_closes, EntryGrid, GridInput};

/// Entries stop once both sides already hold more than this many orders.
const ENTRIES_PER_SIDE: usize = 2;

/// Last sell-side and buy-side trade prices; bound where new orders may rest.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObservedThresholds {
    pub highest_bid: f64,
    pub lowest_ask: f64,
}

impl ObservedThresholds {
    /// Seeded from the first two ticks of the tape.
    pub fn from_opening(a: &Tick, b: &Tick) -> Self {
        Self { highest_bid: a.price.min(b.price), lowest_ask: a.price.max(b.price) }
    }

    pub fn observe(&mut self, tick: &Tick) {
        if tick.is_sell_side {
            self.highest_bid = tick.price;
        } else {
            self.lowest_ask = tick.price;
        }
    }
}

/// Refresh debounce: latency gate plus forced periodic refresh.
#[derive(Debug, Clone, Copy)]
pub struct RefreshClock {
    pub next_update_ts: u64,
    pub next_forced_ts: u64,
    pub triggered: bool,
    latency_ms: u64,
    forced_ms: u64,
}

impl RefreshClock {
    pub fn new(first_ts: u64, latency_ms: u64, forced_ms: u64) -> Self {
        Self {
            next_update_ts: first_ts + latency_ms,
            next_forced_ts: 0,
            triggered: false,
            latency_ms,
            forced_ms,
        }
    }

    pub fn trigger(&mut self) { self.triggered = true; }

    pub fn is_due(&self, ts: u64) -> bool {
        ts > self.next_update_ts && (self.triggered || ts > self.next_forced_ts)
    }

    pub fn mark_refreshed(&mut self, ts: u64) {
        self.next_update_ts = ts + self.latency_ms;
        self.next_forced_ts = ts + self.forced_ms;
        self.triggered = false;
    }
}

fn bid_crossed(tick_px: f64, order_px: f64) -> bool { tick_px < order_px }
fn ask_crossed(tick_px: f64, order_px: f64) -> bool { tick_px > order_px }

/// Result of running one tick through the book.
#[derive(Debug, Default)]
pub struct MatchOutcome {
    /// Tick reached the best price on its side (filled or not).
    pub touched: bool,
    /// Filled orders in sweep order; fills happen at the order's price.
    pub filled: Vec<Order>,
}

#[derive(Debug, Default, Clone)]
pub struct OrderBook {
    pub bids: Vec<Order>,
    pub asks: Vec<Order>,
}

impl OrderBook {
    pub fn new() -> Self { Self::default() }

    pub fn best_bid(&self) -> Option<f64> { self.bids.first().map(|o| o.price) }
    pub fn best_ask(&self) -> Option<f64> { self.asks.first().map(|o| o.price) }

    pub fn clear(&mut self) {
        self.bids.clear();
        self.asks.clear();
    }

    /// Sell-side ticks hit bids priced above them, buy-side ticks lift asks
    /// priced below them.
    pub fn match_tick(&mut self, tick: &Tick) -> MatchOutcome {
        let mut out = MatchOutcome::default();
        let (orders, crosses): (&mut Vec<Order>, fn(f64, f64) -> bool) = if tick.is_sell_side {
            (&mut self.bids, bid_crossed)
        } else {
            (&mut self.asks, ask_crossed)
        };
        let Some(best) = orders.first() else {
            return out;
        };
        out.touched = best.price == tick.price || crosses(tick.price, best.price);

        let n = orders.iter().take_while(|o| crosses(tick.price, o.price)).count();
        out.filled.extend(orders.drain(..n));
        out
    }

    /// Regenerate every resting order from the current account view.
    pub fn rebuild(&mut self, cfg: &BacktestConfig, input: &GridInput) {
        self.clear();

        for order in EntryGrid::new(cfg, input) {
            if self.bids.len() > ENTRIES_PER_SIDE && self.asks.len() > ENTRIES_PER_SIDE {
                break;
            }
            if order.qty > 0.0 {
                self.bids.push(order);
            } else if order.qty < 0.0 {
                self.asks.push(order);
            } else {
                break;
            }
        }

        let (pos, price) = (input.position, input.last_price);
        if pos.shrt.avg_price > 0.0 && price <= pos.shrt.avg_price {
            self.bids.extend(shrt_closes(cfg, pos.shrt, input.highest_bid));
        }
        if pos.long.avg_price > 0.0 && price >= pos.long.avg_price {
            self.asks.extend(long_closes(cfg, pos.long, input.lowest_ask));
        }

        // stable: equal prices keep generation order
        self.bids.sort_by(|a, b| b.price.total_cmp(&a.price));
        self.asks.sort_by(|a, b| a.price.total_cmp(&b.price));
        trace!(bids = self.bids.len(), asks = self.asks.len(), best_bid = ?self.best_bid(), best_ask = ?self.best_ask(), "book rebuilt");
    }

    /// Top `n` levels per side for snapshots.
    pub fn top_levels(&self, n: usize) -> (Vec<BookLevel>, Vec<BookLevel>) {
        let level = |o: &Order| BookLevel { qty: o.qty, price: o.price, reference_price: o.reference_price };
        (self.bids.iter().take(n).map(level).collect(), self.asks.iter().take(n).map(level).collect())
    }
}
