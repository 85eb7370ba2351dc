// ===============================
// src/risk.rs
// ===============================
//
// Forced-liquidation pre-check, run on every tick before normal matching.
// A leg is liquidated when the account is already close to its liquidation
// price, that leg dominates the position, and the tick trades through the
// liquidation price on the side that closes it.
//
use tracing::warn;

use crate::config::{BacktestConfig, LiquidationFill};
use crate::domain::{FillKind, PSide, Tick};
use crate::numeric::calc_cost;
use crate::positions::Account;

/// Liquidation is only considered once `liq_diff` drops below this.
pub const LIQ_DIFF_GUARD: f64 = 0.05;

/// A forced close decided by the pre-check, already applied to the position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForcedClose {
    pub pside: PSide,
    pub kind: FillKind,
    /// Signed: the long leg is sold off, the shrt leg bought back.
    pub qty: f64,
    pub price: f64,
    pub pnl: f64,
    pub fee_paid: f64,
}

/// Which leg, if any, this tick liquidates.
pub fn liquidation_due(tick: &Tick, acct: &Account) -> Option<PSide> {
    if acct.liq_diff >= LIQ_DIFF_GUARD {
        return None;
    }
    let pos = &acct.position;
    if tick.is_sell_side {
        (pos.long.size > pos.shrt.size && tick.price <= acct.liq_price).then_some(PSide::Long)
    } else {
        (pos.shrt.size > pos.long.size && tick.price >= acct.liq_price).then_some(PSide::Shrt)
    }
}

/// Run the pre-check and, when it fires, flatten the position at the
/// configured fill price. Balance is left for settlement.
pub fn check_liquidation(tick: &Tick, acct: &mut Account, cfg: &BacktestConfig) -> Option<ForcedClose> {
    let pside = liquidation_due(tick, acct)?;
    let price = match cfg.liquidation_fill {
        LiquidationFill::LiquidationPrice => acct.liq_price,
        LiquidationFill::TickPrice => tick.price,
    };
    let size = acct.position.side(pside).size;
    let (qty, kind) = match pside {
        PSide::Long => (-size, FillKind::LongLiquidation),
        PSide::Shrt => (size, FillKind::ShrtLiquidation),
    };
    let pnl = acct.position.liquidate(pside, price);
    let fee_paid = -calc_cost(qty, price) * cfg.taker_fee;
    warn!(
        pside = pside.as_str(),
        tick_price = tick.price,
        liq_price = acct.liq_price,
        fill_price = price,
        qty,
        pnl,
        balance = acct.balance,
        "liquidation"
    );
    Some(ForcedClose { pside, kind, qty, price, pnl, fee_paid })
}
