// ===============================
// src/strategy.rs
// ===============================
//
// Grid order generator.
//
// 1) Entry grid  -> `EntryGrid` (lazy iterator, long + shrt interleaved)
//    Idea: first entry rests just outside the EMA band; every re-entry doubles
//          down further away from the position price. Spacing widens with
//          volatility and with how much margin the position already uses.
//    Stops: qty rounds below the min entry qty, margin is exhausted, or the
//           resulting position would sit too close to liquidation.
//
// 2) Close ladder -> `long_closes` / `shrt_closes`
//    Idea: spread the whole position over n take-profit prices between
//          min_markup and min_markup + markup_range.
//
// Everything here is a pure function of (balance, position, indicators,
// config).
//
use crate::config::BacktestConfig;
use crate::domain::{Order, OrderKind, PSide, Position, SidePosition};
use crate::numeric::{
    calc_diff, calc_margin_cost, calc_min_entry_qty, linspace, round_, round_dn, round_up,
};
use crate::positions::{calc_liq_price_binance, calc_new_psize_pprice};

/// Hard ceiling on entries per generation; margin runs out long before.
pub const MAX_ENTRY_ORDERS: usize = 256;

/// Share of the remaining size above which a close order takes everything.
const CLOSE_ALL_RATIO: f64 = 0.75;

/// EMA band the initial entries rest outside of.
pub fn calc_bid_ask_thresholds(ema: f64, ema_spread: f64, volatility: f64, volatility_grid_coeff: f64) -> (f64, f64) {
    let spread = ema_spread + volatility * volatility_grid_coeff;
    (ema * (1.0 - spread), ema * (1.0 + spread))
}

/// Market view handed to the generator at refresh time.
#[derive(Debug, Clone, Copy)]
pub struct GridInput {
    pub balance: f64,
    pub position: Position,
    pub highest_bid: f64,
    pub lowest_ask: f64,
    pub ema: f64,
    pub volatility: f64,
    pub last_price: f64,
}

pub struct EntryGrid<'a> {
    cfg: &'a BacktestConfig,
    balance: f64,
    long: SidePosition,
    shrt: SidePosition,
    highest_bid: f64,
    lowest_ask: f64,
    bid_thr: f64,
    ask_thr: f64,
    volatility: f64,
    last_price: f64,
    available_margin: f64,
    emitted: usize,
    done: bool,
}

impl<'a> EntryGrid<'a> {
    pub fn new(cfg: &'a BacktestConfig, input: &GridInput) -> Self {
        let (bid_thr, ask_thr) =
            calc_bid_ask_thresholds(input.ema, cfg.ema_spread, input.volatility, cfg.volatility_grid_coeff);
        Self {
            cfg,
            balance: input.balance,
            long: input.position.long,
            shrt: input.position.shrt,
            highest_bid: input.highest_bid,
            lowest_ask: input.lowest_ask,
            bid_thr,
            ask_thr,
            volatility: input.volatility,
            last_price: input.last_price,
            available_margin: input.position.available_margin(input.balance, input.last_price, cfg.leverage),
            emitted: 0,
            done: false,
        }
    }

    fn min_entry_qty(&self, price: f64) -> f64 {
        calc_min_entry_qty(price, self.cfg.qty_step, self.cfg.min_qty, self.cfg.min_cost)
    }

    fn initial_qty(&self, price: f64) -> f64 {
        let c = self.cfg;
        let min_entry_qty = self.min_entry_qty(price);
        let wanted = self.balance / price * c.leverage * c.qty_pct * (1.0 + self.volatility * c.volatility_qty_coeff);
        let qty = round_dn((self.available_margin * c.leverage / price).min(min_entry_qty.max(wanted)), c.qty_step);
        if qty >= min_entry_qty { qty } else { 0.0 }
    }

    fn reentry_qty(&self, psize: f64, price: f64) -> f64 {
        let c = self.cfg;
        let min_entry_qty = self.min_entry_qty(price);
        let qty = round_dn(self.available_margin * c.leverage / price, c.qty_step)
            .min(min_entry_qty.max(round_dn(psize * c.ddown_factor, c.qty_step)));
        if qty >= min_entry_qty { qty } else { 0.0 }
    }

    fn grid_spacing(&self, leg: &SidePosition) -> f64 {
        let c = self.cfg;
        c.grid_spacing
            * (1.0
                + calc_margin_cost(leg.size, leg.avg_price, c.leverage) / self.balance * c.pos_margin_grid_coeff
                + self.volatility * c.volatility_grid_coeff)
    }

    /// Reject entries whose resulting position sits closer to liquidation
    /// than `entry_liq_diff_thr`.
    fn too_close_to_liq(&self, pside: PSide, resulting: SidePosition, price: f64) -> bool {
        if self.cfg.entry_liq_diff_thr <= 0.0 {
            return false;
        }
        let mut pos = Position { long: self.long, shrt: self.shrt };
        *pos.side_mut(pside) = resulting;
        let liq = calc_liq_price_binance(self.balance, &pos, self.cfg.maintenance_margin_rate);
        calc_diff(liq, price) < self.cfg.entry_liq_diff_thr
    }

    fn next_long(&self) -> Option<Order> {
        let c = self.cfg;
        let leg = self.long;
        let (qty, price, resulting) = if leg.size == 0.0 {
            let price = self.highest_bid.min(round_dn(self.bid_thr, c.price_step));
            if price <= 0.0 {
                return None;
            }
            let qty = self.initial_qty(price);
            (qty, price, SidePosition { size: qty, avg_price: price })
        } else {
            let price = self.highest_bid.min(round_dn(leg.avg_price * (1.0 - self.grid_spacing(&leg)), c.price_step));
            if price <= c.price_step {
                return None;
            }
            let qty = self.reentry_qty(leg.size, price);
            let (size, avg_price) = calc_new_psize_pprice(leg.size, leg.avg_price, qty, price, c.qty_step);
            (qty, price, SidePosition { size, avg_price })
        };
        if qty <= 0.0 || self.too_close_to_liq(PSide::Long, resulting, price) {
            return None;
        }
        Some(Order {
            qty,
            price,
            resulting_size: resulting.size,
            resulting_avg_price: resulting.avg_price,
            reference_price: if leg.size == 0.0 { price } else { leg.avg_price },
            kind: OrderKind::Entry,
            pside: PSide::Long,
        })
    }

    fn next_shrt(&self) -> Option<Order> {
        let c = self.cfg;
        let leg = self.shrt;
        let (qty, price, resulting) = if leg.size == 0.0 {
            let price = self.lowest_ask.max(round_up(self.ask_thr, c.price_step));
            if price <= 0.0 {
                return None;
            }
            let qty = self.initial_qty(price);
            (qty, price, SidePosition { size: qty, avg_price: price })
        } else {
            let price = self.lowest_ask.max(round_up(leg.avg_price * (1.0 + self.grid_spacing(&leg)), c.price_step));
            let qty = self.reentry_qty(leg.size, price);
            let (size, avg_price) = calc_new_psize_pprice(leg.size, leg.avg_price, qty, price, c.qty_step);
            (qty, price, SidePosition { size, avg_price })
        };
        if qty <= 0.0 || self.too_close_to_liq(PSide::Shrt, resulting, price) {
            return None;
        }
        Some(Order {
            qty: -qty,
            price,
            resulting_size: resulting.size,
            resulting_avg_price: resulting.avg_price,
            reference_price: if leg.size == 0.0 { price } else { leg.avg_price },
            kind: OrderKind::Entry,
            pside: PSide::Shrt,
        })
    }
}

impl Iterator for EntryGrid<'_> {
    type Item = Order;

    fn next(&mut self) -> Option<Order> {
        if self.done || self.emitted >= MAX_ENTRY_ORDERS {
            return None;
        }
        let long = if self.cfg.do_long { self.next_long() } else { None };
        let shrt = if self.cfg.do_shrt { self.next_shrt() } else { None };

        // closest to the last traded price goes first
        let pick = match (long, shrt) {
            (Some(l), Some(s)) => {
                if calc_diff(l.price, self.last_price) < calc_diff(s.price, self.last_price) { l } else { s }
            }
            (Some(l), None) => l,
            (None, Some(s)) => s,
            (None, None) => {
                self.done = true;
                return None;
            }
        };

        let leg = SidePosition { size: pick.resulting_size, avg_price: pick.resulting_avg_price };
        match pick.pside {
            PSide::Long => {
                self.long = leg;
                self.highest_bid = self.highest_bid.min(pick.price);
            }
            PSide::Shrt => {
                self.shrt = leg;
                self.lowest_ask = self.lowest_ask.max(pick.price);
            }
        }
        self.available_margin -= calc_margin_cost(pick.qty, pick.price, self.cfg.leverage);
        self.emitted += 1;
        Some(pick)
    }
}

fn close_ladder(cfg: &BacktestConfig, pside: PSide, leg: SidePosition, bound: f64) -> Vec<Order> {
    let mut out = Vec::new();
    if leg.size == 0.0 || leg.avg_price == 0.0 {
        return out;
    }
    let (n, dir) = match pside {
        PSide::Long => (cfg.n_close_orders_long, 1.0),
        PSide::Shrt => (cfg.n_close_orders_shrt, -1.0),
    };
    let pprice = leg.avg_price;
    let first = pprice * (1.0 + dir * cfg.min_markup);
    let last = pprice * (1.0 + dir * (cfg.min_markup + cfg.markup_range));
    let round_away = |p: f64| match pside {
        PSide::Long => round_up(p, cfg.price_step),
        PSide::Shrt => round_dn(p, cfg.price_step),
    };

    let mut prices: Vec<f64> = linspace(first, last, n).into_iter().map(round_away).collect();
    match pside {
        PSide::Long => prices.sort_by(|a, b| a.total_cmp(b)),
        PSide::Shrt => prices.sort_by(|a, b| b.total_cmp(a)),
    }
    prices.dedup();
    prices.retain(|p| match pside { PSide::Long => *p >= bound, PSide::Shrt => *p <= bound });

    let order = |qty: f64, price: f64, remaining: f64| Order {
        qty: -dir * qty,
        price,
        resulting_size: remaining,
        resulting_avg_price: if remaining == 0.0 { 0.0 } else { pprice },
        reference_price: pprice,
        kind: OrderKind::Close,
        pside,
    };
    let tail_price = |edge: f64| match pside {
        PSide::Long => edge.max(round_up(first, cfg.price_step)),
        PSide::Shrt => edge.min(round_dn(first, cfg.price_step)),
    };

    let mut remaining = leg.size;
    let mut edge = bound;
    if !prices.is_empty() {
        let by_min_qty = if cfg.min_qty > 0.0 { (remaining / cfg.min_qty) as usize } else { usize::MAX };
        let mut n_orders = n.min(prices.len()).min(by_min_qty);
        for price in prices {
            if n_orders == 0 {
                break;
            }
            let mut qty = remaining.min(cfg.min_qty.max(round_up(remaining / n_orders as f64, cfg.qty_step)));
            if qty / remaining > CLOSE_ALL_RATIO {
                qty = remaining;
            }
            if qty == 0.0 {
                break;
            }
            remaining = round_(remaining - qty, cfg.qty_step).max(0.0);
            out.push(order(qty, price, remaining));
            edge = price;
            n_orders -= 1;
            if remaining == 0.0 {
                break;
            }
        }
    }
    // whatever is left rides on the last (or first reachable) price
    if remaining > 0.0 {
        out.push(order(remaining, tail_price(edge), 0.0));
    }
    out
}

/// Take-profit ladder for the long leg; asks at or above `lowest_ask`.
pub fn long_closes(cfg: &BacktestConfig, leg: SidePosition, lowest_ask: f64) -> Vec<Order> {
    close_ladder(cfg, PSide::Long, leg, lowest_ask)
}

/// Take-profit ladder for the shrt leg; bids at or below `highest_bid`.
pub fn shrt_closes(cfg: &BacktestConfig, leg: SidePosition, highest_bid: f64) -> Vec<Order> {
    close_ladder(cfg, PSide::Shrt, leg, highest_bid)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(position: Position) -> GridInput {
        GridInput {
            balance: 1000.0,
            position,
            highest_bid: 100.0,
            lowest_ask: 100.0,
            ema: 100.0,
            volatility: 0.0,
            last_price: 100.0,
        }
    }

    fn long_only() -> BacktestConfig {
        BacktestConfig { do_shrt: false, ..BacktestConfig::test_defaults() }
    }

    #[test]
    fn thresholds_widen_with_volatility() {
        let (b, a) = calc_bid_ask_thresholds(100.0, 0.01, 0.0, 0.5);
        assert!((b - 99.0).abs() < 1e-9 && (a - 101.0).abs() < 1e-9);
        let (b2, a2) = calc_bid_ask_thresholds(100.0, 0.01, 0.02, 0.5);
        assert!(b2 < b && a2 > a);
    }

    #[test]
    fn initial_long_entry_below_ema_band() {
        let cfg = long_only();
        let first = EntryGrid::new(&cfg, &input(Position::flat())).next().unwrap();
        assert_eq!(first.pside, PSide::Long);
        assert_eq!(first.kind, OrderKind::Entry);
        assert_eq!(first.price, 99.9);
        // 1000 / 99.9 * 10 * 0.1 = 10.01 -> 10
        assert_eq!(first.qty, 10.0);
        assert_eq!(first.resulting_size, 10.0);
        assert_eq!(first.resulting_avg_price, 99.9);
    }

    #[test]
    fn reentries_double_down_and_step_away() {
        let cfg = long_only();
        let orders: Vec<Order> = EntryGrid::new(&cfg, &input(Position::flat())).collect();
        assert!(orders.len() >= 3, "got {orders:?}");
        assert_eq!(orders[1].price, 98.9);
        assert_eq!(orders[1].qty, 10.0);
        assert_eq!(orders[1].resulting_size, 20.0);
        assert!((orders[1].resulting_avg_price - 99.4).abs() < 1e-9);
        for w in orders.windows(2) {
            assert!(w[1].price < w[0].price);
            assert!(w[1].resulting_size > w[0].resulting_size);
        }
        // margin bound: total committed never exceeds balance * leverage
        let notional: f64 = orders.iter().map(|o| o.qty * o.price).sum();
        assert!(notional <= 1000.0 * 10.0 + 1e-6);
    }

    #[test]
    fn disabled_sides_generate_nothing() {
        let cfg = BacktestConfig { do_long: false, do_shrt: false, ..BacktestConfig::test_defaults() };
        assert_eq!(EntryGrid::new(&cfg, &input(Position::flat())).count(), 0);
    }

    #[test]
    fn both_sides_interleave() {
        let cfg = BacktestConfig::test_defaults();
        let orders: Vec<Order> = EntryGrid::new(&cfg, &input(Position::flat())).take(6).collect();
        assert!(orders.iter().any(|o| o.qty > 0.0));
        assert!(orders.iter().any(|o| o.qty < 0.0));
        for o in &orders {
            match o.pside {
                PSide::Long => assert!(o.qty > 0.0 && o.price < 100.0),
                PSide::Shrt => assert!(o.qty < 0.0 && o.price > 100.0),
            }
        }
    }

    #[test]
    fn liq_threshold_stops_grid() {
        let cfg = BacktestConfig { do_shrt: false, entry_liq_diff_thr: 0.5, ..BacktestConfig::test_defaults() };
        let orders: Vec<Order> = EntryGrid::new(&cfg, &input(Position::flat())).collect();
        let unguarded = EntryGrid::new(&long_only(), &input(Position::flat())).count();
        assert!(orders.len() < unguarded);
    }

    #[test]
    fn close_ladder_sums_to_position() {
        let cfg = BacktestConfig::test_defaults();
        for size in [1.0, 3.0, 7.0, 10.0, 23.0, 101.0] {
            let leg = SidePosition { size, avg_price: 100.0 };
            let closes = long_closes(&cfg, leg, 0.0);
            let total: f64 = closes.iter().map(|o| -o.qty).sum();
            assert!((total - size).abs() <= cfg.qty_step * 0.5, "size {size}: {closes:?}");
            assert!(closes.iter().all(|o| o.qty < 0.0 && o.price >= 100.2));
            assert_eq!(closes.last().unwrap().resulting_size, 0.0);
        }
    }

    #[test]
    fn close_ladder_spans_markup_range() {
        let cfg = BacktestConfig::test_defaults();
        let leg = SidePosition { size: 10.0, avg_price: 100.0 };
        let closes = long_closes(&cfg, leg, 0.0);
        assert_eq!(closes.len(), 5);
        assert_eq!(closes[0].price, 100.2);
        assert_eq!(closes[4].price, 100.7);
        assert!(closes.windows(2).all(|w| w[1].price > w[0].price));
        assert!(closes.iter().all(|o| o.qty == -2.0));
    }

    #[test]
    fn shrt_closes_mirror_below_price() {
        let cfg = BacktestConfig::test_defaults();
        let leg = SidePosition { size: 10.0, avg_price: 100.0 };
        let closes = shrt_closes(&cfg, leg, f64::MAX);
        assert_eq!(closes.len(), 5);
        assert_eq!(closes[0].price, 99.8);
        assert_eq!(closes[4].price, 99.3);
        assert!(closes.iter().all(|o| o.qty == 2.0 && o.pside == PSide::Shrt));
    }

    #[test]
    fn closes_beyond_threshold_collapse_to_one() {
        let cfg = BacktestConfig::test_defaults();
        let leg = SidePosition { size: 10.0, avg_price: 100.0 };
        let closes = long_closes(&cfg, leg, 105.0);
        assert_eq!(closes.len(), 1);
        assert_eq!(closes[0].qty, -10.0);
        assert_eq!(closes[0].price, 105.0);
    }

    #[test]
    fn flat_leg_has_no_closes() {
        let cfg = BacktestConfig::test_defaults();
        assert!(long_closes(&cfg, SidePosition::default(), 0.0).is_empty());
    }
}
