// ===============================
// src/numeric.rs
// ===============================
//
// Step rounding & small pricing helpers shared by every module.
// Semua rounding pakai ties-to-even + 10 desimal "safety rounding" supaya
// hasilnya identik dengan engine referensi (bit-for-bit).
//

const SAFETY_DECIMALS: f64 = 1e10;

/// Round to 10 decimals, ties-to-even.
#[inline]
pub fn round10(x: f64) -> f64 {
    (x * SAFETY_DECIMALS).round_ties_even() / SAFETY_DECIMALS
}

/// Round `n` to the nearest multiple of `step`.
#[inline]
pub fn round_(n: f64, step: f64) -> f64 {
    round10((n / step).round_ties_even() * step)
}

/// Round `n` up to a multiple of `step`.
#[inline]
pub fn round_up(n: f64, step: f64) -> f64 {
    round10(round10(n / step).ceil() * step)
}

/// Round `n` down to a multiple of `step`.
#[inline]
pub fn round_dn(n: f64, step: f64) -> f64 {
    round10(round10(n / step).floor() * step)
}

/// Relative distance of `x` from `y`.
#[inline]
pub fn calc_diff(x: f64, y: f64) -> f64 {
    (x - y).abs() / y.abs()
}

/// Non-finite values collapse to 0.0.
#[inline]
pub fn nan_to_0(x: f64) -> f64 {
    if x.is_finite() {
        x
    } else {
        0.0
    }
}

#[inline]
pub fn calc_ema(alpha: f64, alpha_: f64, prev_ema: f64, new_val: f64) -> f64 {
    prev_ema * alpha_ + new_val * alpha
}

#[inline]
pub fn calc_cost(qty: f64, price: f64) -> f64 {
    (qty * price).abs()
}

#[inline]
pub fn calc_margin_cost(qty: f64, price: f64, leverage: f64) -> f64 {
    calc_cost(qty, price) / leverage
}

#[inline]
pub fn calc_long_pnl(entry_price: f64, close_price: f64, qty: f64) -> f64 {
    qty.abs() * (close_price - entry_price)
}

#[inline]
pub fn calc_shrt_pnl(entry_price: f64, close_price: f64, qty: f64) -> f64 {
    qty.abs() * (entry_price - close_price)
}

/// Smallest entry qty that satisfies both `min_qty` and `min_cost`.
pub fn calc_min_entry_qty(price: f64, qty_step: f64, min_qty: f64, min_cost: f64) -> f64 {
    let by_cost = if price > 0.0 { min_cost / price } else { 0.0 };
    min_qty.max(round_up(by_cost, qty_step))
}

/// `n` evenly spaced values over `[start, stop]`, endpoint exact.
pub fn linspace(start: f64, stop: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (stop - start) / (n - 1) as f64;
            let mut out: Vec<f64> = (0..n).map(|i| start + i as f64 * step).collect();
            out[n - 1] = stop;
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounding_modes() {
        assert_eq!(round_(0.123456, 0.001), 0.123);
        assert_eq!(round_up(0.1231, 0.001), 0.124);
        assert_eq!(round_dn(0.1239, 0.001), 0.123);
        assert_eq!(round_(2.5, 1.0), 2.0);
        assert_eq!(round_(3.5, 1.0), 4.0);
        // exact multiples stay put despite fp noise in n / step
        assert_eq!(round_up(0.3, 0.1), 0.3);
        assert_eq!(round_dn(0.3, 0.1), 0.3);
    }

    #[test]
    fn rounding_is_idempotent() {
        let steps = [1e-3, 0.01, 0.5, 1.0, 10.0];
        let xs = [0.0013, 1.23456789, 97.531, 42.0];
        for &s in &steps {
            for &x in &xs {
                let r = round_(x, s);
                assert_eq!(round_(r, s), r, "x={x} step={s}");
                let u = round_up(x, s);
                assert_eq!(round_up(u, s), u, "x={x} step={s}");
                let d = round_dn(x, s);
                assert_eq!(round_dn(d, s), d, "x={x} step={s}");
            }
        }
    }

    #[test]
    fn diff_and_pnl() {
        assert!((calc_diff(95.0, 100.0) - 0.05).abs() < 1e-12);
        assert_eq!(calc_diff(0.0, 100.0), 1.0);
        assert_eq!(calc_long_pnl(100.0, 110.0, 2.0), 20.0);
        assert_eq!(calc_shrt_pnl(100.0, 110.0, -2.0), -20.0);
        assert_eq!(calc_margin_cost(-2.0, 50.0, 10.0), 10.0);
    }

    #[test]
    fn nan_substitution() {
        assert_eq!(nan_to_0(f64::NAN), 0.0);
        assert_eq!(nan_to_0(f64::INFINITY), 0.0);
        assert_eq!(nan_to_0(f64::NEG_INFINITY), 0.0);
        assert_eq!(nan_to_0(1.5), 1.5);
    }

    #[test]
    fn linspace_endpoints() {
        let v = linspace(1.0, 2.0, 5);
        assert_eq!(v, vec![1.0, 1.25, 1.5, 1.75, 2.0]);
        assert_eq!(linspace(3.0, 9.0, 1), vec![3.0]);
        assert!(linspace(3.0, 9.0, 0).is_empty());
    }

    #[test]
    fn min_entry_qty_respects_cost_floor() {
        assert_eq!(calc_min_entry_qty(10.0, 1.0, 1.0, 5.0), 1.0);
        assert_eq!(calc_min_entry_qty(2.0, 1.0, 1.0, 5.0), 3.0);
        assert_eq!(calc_min_entry_qty(0.0, 1.0, 1.0, 5.0), 1.0);
    }
}
