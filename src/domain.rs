// ===============================
// src/domain.rs
// ===============================
use serde::{Deserialize, Serialize};

/// One aggregated trade from the historical tape.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub price: f64,
    /// Buyer was maker: the trade hit the bid side of the book.
    pub is_sell_side: bool,
    pub timestamp_ms: u64,
}

impl Tick {
    pub fn new(price: f64, is_sell_side: bool, timestamp_ms: u64) -> Self {
        Self { price, is_sell_side, timestamp_ms }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side { Buy, Sell }
impl Side {
    pub fn of_qty(qty: f64) -> Self { if qty >= 0.0 { Side::Buy } else { Side::Sell } }
}

/// Position side. Long and shrt are tracked independently (hedge mode).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PSide { Long, Shrt }
impl PSide {
    pub fn as_str(&self) -> &'static str { match self { PSide::Long => "long", PSide::Shrt => "shrt" } }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderKind { Entry, Close }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillKind { Entry, Close, LongLiquidation, ShrtLiquidation }
impl FillKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FillKind::Entry => "entry",
            FillKind::Close => "close",
            FillKind::LongLiquidation => "long_liquidation",
            FillKind::ShrtLiquidation => "shrt_liquidation",
        }
    }
    pub fn is_liquidation(&self) -> bool {
        matches!(self, FillKind::LongLiquidation | FillKind::ShrtLiquidation)
    }
}

/// A resting order produced by the grid generator.
///
/// `qty` is signed: positive rests on the bid side, negative on the ask side.
/// `resulting_*` is the position of `pside` if this order (and every order
/// ahead of it on the same side) fills.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub qty: f64,
    pub price: f64,
    pub resulting_size: f64,
    pub resulting_avg_price: f64,
    pub reference_price: f64,
    pub kind: OrderKind,
    pub pside: PSide,
}

// Inventory structures
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SidePosition { pub size: f64, pub avg_price: f64 }

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position { pub long: SidePosition, pub shrt: SidePosition }

/// Immutable ledger entry, produced when a fill is settled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub tick_index: usize,
    pub timestamp_ms: u64,
    pub side: Side,
    pub pside: PSide,
    pub kind: FillKind,
    pub qty: f64,
    pub price: f64,
    pub fee_paid: f64,
    pub pnl: f64,
    pub position: Position,
    pub balance: f64,
    pub equity: f64,
    pub available_margin: f64,
    pub liq_price: f64,
    pub liq_diff: f64,
    pub gain: f64,
    pub n_days: f64,
    pub average_daily_gain: f64,
    pub closest_liq: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatsRecord { pub timestamp_ms: u64, pub balance: f64, pub equity: f64 }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotTrigger { Periodic, Fill }

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BookLevel {
    pub qty: f64,
    pub price: f64,
    /// Position price the order was generated from.
    pub reference_price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub tick_index: usize,
    pub timestamp_ms: u64,
    pub price: f64,
    pub trigger: SnapshotTrigger,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fill_kind: Option<FillKind>,
    pub ema: f64,
    pub volatility: f64,
    pub position: Position,
    pub balance: f64,
    pub equity: f64,
    // top of book & thresholds, periodic snapshots only
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bids: Vec<BookLevel>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub asks: Vec<BookLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bid_thr: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ask_thr: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event { Fill(Fill), Stats(StatsRecord), Snapshot(StateSnapshot), Note(String) }
