// ===============================
// src/positions.rs (Position, margin & liquidation model)
// ===============================
//
// Hedge-mode account: one long and one shrt leg held side by side, sizes as
// non-negative magnitudes. Cross margin, so liquidation is computed over both
// legs together (Binance USDT-M formula).
//
use crate::domain::{Fill, FillKind, PSide, Position, SidePosition};
use crate::numeric::{
    calc_cost, calc_diff, calc_long_pnl, calc_margin_cost, calc_shrt_pnl, nan_to_0, round_,
};

/// Weighted-average position update used by both the generator and the
/// matcher. `qty` is a magnitude.
pub fn calc_new_psize_pprice(psize: f64, pprice: f64, qty: f64, price: f64, qty_step: f64) -> (f64, f64) {
    if qty == 0.0 {
        return (psize, pprice);
    }
    let new_psize = round_(psize + qty, qty_step);
    if new_psize == 0.0 {
        return (0.0, 0.0);
    }
    (new_psize, nan_to_0(pprice) * (psize / new_psize) + price * (qty / new_psize))
}

/// Binance cross-margin liquidation price for a dual-side position.
///
/// Returns 0.0 when there is nothing to liquidate; `calc_diff(0, price)` is
/// then 1.0, i.e. "far".
pub fn calc_liq_price_binance(balance: f64, pos: &Position, mmr: f64) -> f64 {
    let (l, pl) = (pos.long.size, nan_to_0(pos.long.avg_price));
    let (s, ps) = (pos.shrt.size, nan_to_0(pos.shrt.avg_price));
    let numerator = balance - l * pl + s * ps;
    let denom = l * mmr + s * mmr - l + s;
    if denom == 0.0 {
        return 0.0;
    }
    (numerator / denom).max(0.0)
}

/// Maintenance margin rate implied by the exchange's max leverage tier.
pub fn mmr_for_max_leverage(max_leverage: f64) -> f64 {
    0.5 / max_leverage
}

impl SidePosition {
    pub fn is_open(&self) -> bool { self.size != 0.0 }

    pub fn increased(&self, qty: f64, price: f64, qty_step: f64) -> SidePosition {
        let (size, avg_price) = calc_new_psize_pprice(self.size, self.avg_price, qty.abs(), price, qty_step);
        SidePosition { size, avg_price }
    }

    /// Straight reduction; never flips, a side that reaches zero is reset.
    pub fn reduced(&self, qty: f64, qty_step: f64) -> SidePosition {
        if qty == 0.0 {
            return *self;
        }
        let size = round_(self.size - qty.abs(), qty_step).max(0.0);
        if size == 0.0 {
            SidePosition::default()
        } else {
            SidePosition { size, avg_price: self.avg_price }
        }
    }
}

impl Position {
    pub fn flat() -> Self { Self::default() }

    pub fn side(&self, pside: PSide) -> &SidePosition {
        match pside { PSide::Long => &self.long, PSide::Shrt => &self.shrt }
    }

    pub fn side_mut(&mut self, pside: PSide) -> &mut SidePosition {
        match pside { PSide::Long => &mut self.long, PSide::Shrt => &mut self.shrt }
    }

    pub fn is_flat(&self) -> bool { !self.long.is_open() && !self.shrt.is_open() }

    pub fn unrealized_pnl(&self, pside: PSide, mark_price: f64) -> f64 {
        let leg = self.side(pside);
        if !leg.is_open() || leg.avg_price == 0.0 {
            return 0.0;
        }
        match pside {
            PSide::Long => calc_long_pnl(leg.avg_price, mark_price, leg.size),
            PSide::Shrt => calc_shrt_pnl(leg.avg_price, mark_price, leg.size),
        }
    }

    pub fn equity(&self, balance: f64, mark_price: f64) -> f64 {
        balance + self.unrealized_pnl(PSide::Long, mark_price) + self.unrealized_pnl(PSide::Shrt, mark_price)
    }

    /// Equity minus margin committed at entry prices, floored at zero.
    pub fn available_margin(&self, balance: f64, mark_price: f64, leverage: f64) -> f64 {
        let mut equity = balance;
        let mut used_margin = 0.0;
        for pside in [PSide::Long, PSide::Shrt] {
            let leg = self.side(pside);
            if leg.is_open() && leg.avg_price != 0.0 {
                equity += self.unrealized_pnl(pside, mark_price);
                used_margin += calc_margin_cost(leg.size, leg.avg_price, leverage);
            }
        }
        (equity - used_margin).max(0.0)
    }

    /// Apply a maker fill to the position. `qty` is signed (+ buy, - sell);
    /// whether it opens or closes depends on `pside`. Returns realized PnL.
    pub fn apply_fill(&mut self, pside: PSide, qty: f64, price: f64, qty_step: f64) -> f64 {
        if qty == 0.0 {
            return 0.0;
        }
        let leg = *self.side(pside);
        let is_entry = match pside { PSide::Long => qty > 0.0, PSide::Shrt => qty < 0.0 };
        if is_entry {
            *self.side_mut(pside) = leg.increased(qty, price, qty_step);
            0.0
        } else {
            // only what is actually held can be realized
            let closed = qty.abs().min(leg.size);
            let pnl = match pside {
                PSide::Long => calc_long_pnl(leg.avg_price, price, closed),
                PSide::Shrt => calc_shrt_pnl(leg.avg_price, price, closed),
            };
            *self.side_mut(pside) = leg.reduced(qty, qty_step);
            pnl
        }
    }

    /// Forced close of `pside` at `price`; the exchange takes the whole cross
    /// account down, so both legs end flat. Returns realized PnL of `pside`.
    pub fn liquidate(&mut self, pside: PSide, price: f64) -> f64 {
        let pnl = self.unrealized_pnl(pside, price);
        *self = Position::flat();
        pnl
    }
}

/// Realized side of the book: balance plus the cached liquidation state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Account {
    pub balance: f64,
    pub position: Position,
    pub liq_price: f64,
    pub liq_diff: f64,
}

/// What a fill did to the account.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FillEffect { pub pnl: f64, pub fee_paid: f64 }

impl Account {
    pub fn new(balance: f64) -> Self {
        Self { balance, position: Position::flat(), liq_price: 0.0, liq_diff: 1.0 }
    }

    /// Position update + balance settlement in one step.
    pub fn apply_fill(&mut self, pside: PSide, qty: f64, price: f64, fee_rate: f64, qty_step: f64) -> FillEffect {
        if qty == 0.0 {
            return FillEffect { pnl: 0.0, fee_paid: 0.0 };
        }
        let pnl = self.position.apply_fill(pside, qty, price, qty_step);
        let fee_paid = -calc_cost(qty, price) * fee_rate;
        self.settle(pnl, fee_paid);
        FillEffect { pnl, fee_paid }
    }

    pub fn settle(&mut self, pnl: f64, fee_paid: f64) {
        self.balance += pnl + fee_paid;
    }

    pub fn refresh_liquidation(&mut self, mark_price: f64, mmr: f64) {
        self.liq_price = calc_liq_price_binance(self.balance, &self.position, mmr);
        self.liq_diff = calc_diff(self.liq_price, mark_price);
    }

    pub fn equity(&self, mark_price: f64) -> f64 { self.position.equity(self.balance, mark_price) }
}

/// Feed a recorded ledger back through the model, in order. PnL is
/// recomputed from the replayed position; fees are taken from the ledger.
pub fn replay_ledger(starting_balance: f64, fills: &[Fill], qty_step: f64) -> Account {
    let mut acct = Account::new(starting_balance);
    for f in fills {
        let pnl = match f.kind {
            FillKind::Entry | FillKind::Close => acct.position.apply_fill(f.pside, f.qty, f.price, qty_step),
            FillKind::LongLiquidation | FillKind::ShrtLiquidation => acct.position.liquidate(f.pside, f.price),
        };
        acct.settle(pnl, f.fee_paid);
        acct.liq_price = f.liq_price;
        acct.liq_diff = f.liq_diff;
    }
    acct
}

#[cfg(test)]
mod tests {
    use super::*;

    fn long(size: f64, avg_price: f64) -> Position {
        Position { long: SidePosition { size, avg_price }, shrt: SidePosition::default() }
    }

    #[test]
    fn zero_qty_fill_is_noop() {
        let mut acct = Account::new(1000.0);
        acct.position = long(3.0, 100.0);
        let before = acct;
        let eff = acct.apply_fill(PSide::Long, 0.0, 90.0, 0.0002, 1.0);
        assert_eq!(eff, FillEffect { pnl: 0.0, fee_paid: 0.0 });
        assert_eq!(acct, before);
    }

    #[test]
    fn entry_averages_price() {
        let mut pos = long(1.0, 100.0);
        let pnl = pos.apply_fill(PSide::Long, 1.0, 90.0, 1.0);
        assert_eq!(pnl, 0.0);
        assert_eq!(pos.long.size, 2.0);
        assert_eq!(pos.long.avg_price, 95.0);
    }

    #[test]
    fn short_entry_and_close() {
        let mut pos = Position::flat();
        pos.apply_fill(PSide::Shrt, -4.0, 50.0, 1.0);
        assert_eq!(pos.shrt, SidePosition { size: 4.0, avg_price: 50.0 });
        let pnl = pos.apply_fill(PSide::Shrt, 1.0, 45.0, 1.0);
        assert_eq!(pnl, 5.0);
        assert_eq!(pos.shrt, SidePosition { size: 3.0, avg_price: 50.0 });
    }

    #[test]
    fn close_through_zero_realizes_held_size_only() {
        let mut pos = long(2.0, 100.0);
        let pnl = pos.apply_fill(PSide::Long, -3.0, 110.0, 1.0);
        assert_eq!(pnl, 20.0);
        assert_eq!(pos.long, SidePosition::default());

        let mut pos = Position { long: SidePosition::default(), shrt: SidePosition { size: 1.0, avg_price: 50.0 } };
        assert_eq!(pos.apply_fill(PSide::Shrt, 4.0, 40.0, 1.0), 10.0);
        assert!(pos.is_flat());
    }

    #[test]
    fn liq_price_sentinel_when_flat() {
        let mut acct = Account::new(500.0);
        acct.refresh_liquidation(123.0, 0.01);
        assert_eq!(acct.liq_price, 0.0);
        assert_eq!(acct.liq_diff, 1.0);
    }

    #[test]
    fn liq_price_long_only() {
        // (size*avg - balance) / (size*(1-mmr))
        let pos = long(10.0, 100.0);
        let liq = calc_liq_price_binance(100.0, &pos, 0.0);
        assert!((liq - 90.0).abs() < 1e-9);
        // well-capitalized long has no positive liquidation price
        assert_eq!(calc_liq_price_binance(10_000.0, &pos, 0.01), 0.0);
    }

    #[test]
    fn liq_price_short_only() {
        let pos = Position { long: SidePosition::default(), shrt: SidePosition { size: 10.0, avg_price: 100.0 } };
        let liq = calc_liq_price_binance(100.0, &pos, 0.0);
        assert!((liq - 110.0).abs() < 1e-9);
    }

    #[test]
    fn available_margin_cross() {
        let pos = long(10.0, 100.0);
        // equity 1000 - 50, used 1000/10
        assert_eq!(pos.available_margin(1000.0, 95.0, 10.0), 850.0);
        assert_eq!(pos.available_margin(10.0, 50.0, 10.0), 0.0);
        assert_eq!(Position::flat().available_margin(10.0, 50.0, 10.0), 10.0);
    }

    #[test]
    fn liquidation_flattens_account() {
        let mut pos = long(2.0, 100.0);
        pos.shrt = SidePosition { size: 1.0, avg_price: 120.0 };
        let pnl = pos.liquidate(PSide::Long, 80.0);
        assert_eq!(pnl, -40.0);
        assert!(pos.is_flat());
        assert_eq!(pos.long.avg_price, 0.0);
    }
}
