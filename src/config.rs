// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : grid_backtest_rust — deterministic tick-level grid backtester
Module  : config.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Replays aggregated trade ticks against a simulated perpetual
          futures exchange, runs a doubling-down grid with a take-profit
          ladder, tracks hedge-mode positions, margin & liquidation, and
          records fills / stats / state snapshots as JSONL.
=============================================================================
*/
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use ahash::AHashMap as HashMap;
use clap::Parser;
use dotenvy::dotenv;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::indicators::DEFAULT_CHUNK_LEN;
use crate::positions::mmr_for_max_leverage;

/// Resolved numeric config map, as handed over by the config loader.
pub type ConfigMap = HashMap<String, f64>;

/// Every key the backtester reads. Env override: `BACKTEST_<KEY>`.
pub const FIELDS: &[&str] = &[
    "starting_balance", "max_leverage", "leverage", "qty_step", "price_step",
    "min_qty", "min_cost", "maker_fee", "taker_fee", "ema_span", "ema_spread",
    "grid_spacing", "ddown_factor", "qty_pct", "n_close_orders",
    "n_close_orders_long", "n_close_orders_shrt", "min_markup", "markup_range",
    "latency_simulation_ms", "pos_margin_grid_coeff", "volatility_grid_coeff",
    "volatility_qty_coeff", "entry_liq_diff_thr", "do_long", "do_shrt",
    "maintenance_margin_rate", "forced_refresh_ms", "stats_interval_ms",
    "snapshot_interval", "indicator_chunk_len", "liquidation_fill_at_tick",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing config field `{0}`")]
    Missing(&'static str),
    #[error("config field `{field}` is not finite: {value}")]
    NonFinite { field: &'static str, value: f64 },
    #[error("config field `{field}` out of range: {value} ({reason})")]
    OutOfRange { field: &'static str, value: f64, reason: &'static str },
    #[error("reading config {path}: {source}")]
    Io { path: String, #[source] source: std::io::Error },
    #[error("parsing config {path}: {source}")]
    Parse { path: String, #[source] source: serde_json::Error },
    #[error("env override {key}={value} is not a number")]
    BadOverride { key: String, value: String },
}

/// Price used for a forced liquidation fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LiquidationFill {
    /// Exchange closes at the computed liquidation price.
    LiquidationPrice,
    /// Close at the tick that breached it (matches tick-replay references).
    TickPrice,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BacktestConfig {
    pub starting_balance: f64,
    pub max_leverage: f64,
    pub leverage: f64,
    pub qty_step: f64,
    pub price_step: f64,
    pub min_qty: f64,
    pub min_cost: f64,
    pub maker_fee: f64,
    pub taker_fee: f64,
    pub ema_span: usize,
    pub ema_spread: f64,
    pub grid_spacing: f64,
    pub ddown_factor: f64,
    pub qty_pct: f64,
    pub n_close_orders_long: usize,
    pub n_close_orders_shrt: usize,
    pub min_markup: f64,
    pub markup_range: f64,
    pub latency_simulation_ms: u64,
    pub pos_margin_grid_coeff: f64,
    pub volatility_grid_coeff: f64,
    pub volatility_qty_coeff: f64,
    pub entry_liq_diff_thr: f64,
    pub do_long: bool,
    pub do_shrt: bool,
    pub maintenance_margin_rate: f64,
    pub forced_refresh_ms: u64,
    pub stats_interval_ms: u64,
    pub snapshot_interval: usize,
    pub indicator_chunk_len: usize,
    pub liquidation_fill: LiquidationFill,
}

impl BacktestConfig {
    /// Single validation point: every numeric field must be present (or
    /// have a default) and finite.
    pub fn from_map(map: &ConfigMap) -> Result<Self, ConfigError> {
        let req = |k: &'static str| -> Result<f64, ConfigError> {
            let v = *map.get(k).ok_or(ConfigError::Missing(k))?;
            if !v.is_finite() {
                return Err(ConfigError::NonFinite { field: k, value: v });
            }
            Ok(v)
        };
        let opt = |k: &'static str, default: f64| -> Result<f64, ConfigError> {
            match map.get(k) {
                None => Ok(default),
                Some(v) if v.is_finite() => Ok(*v),
                Some(v) => Err(ConfigError::NonFinite { field: k, value: *v }),
            }
        };
        let positive = |k: &'static str, v: f64| -> Result<f64, ConfigError> {
            if v > 0.0 { Ok(v) } else { Err(ConfigError::OutOfRange { field: k, value: v, reason: "must be > 0" }) }
        };
        let non_negative = |k: &'static str, v: f64| -> Result<f64, ConfigError> {
            if v >= 0.0 { Ok(v) } else { Err(ConfigError::OutOfRange { field: k, value: v, reason: "must be >= 0" }) }
        };

        let max_leverage = positive("max_leverage", req("max_leverage")?)?;
        let n_close_orders = positive("n_close_orders", req("n_close_orders")?.round())?;
        let ema_span = positive("ema_span", req("ema_span")?.round())?;

        Ok(Self {
            starting_balance: positive("starting_balance", req("starting_balance")?)?,
            max_leverage,
            leverage: positive("leverage", req("leverage")?)?,
            qty_step: positive("qty_step", req("qty_step")?)?,
            price_step: positive("price_step", req("price_step")?)?,
            min_qty: non_negative("min_qty", req("min_qty")?)?,
            min_cost: non_negative("min_cost", req("min_cost")?)?,
            maker_fee: req("maker_fee")?,
            taker_fee: req("taker_fee")?,
            ema_span: ema_span as usize,
            ema_spread: req("ema_spread")?,
            grid_spacing: req("grid_spacing")?,
            ddown_factor: non_negative("ddown_factor", req("ddown_factor")?)?,
            qty_pct: non_negative("qty_pct", req("qty_pct")?)?,
            n_close_orders_long: positive("n_close_orders_long", opt("n_close_orders_long", n_close_orders)?.round())? as usize,
            n_close_orders_shrt: positive("n_close_orders_shrt", opt("n_close_orders_shrt", n_close_orders)?.round())? as usize,
            min_markup: req("min_markup")?,
            markup_range: non_negative("markup_range", req("markup_range")?)?,
            latency_simulation_ms: non_negative("latency_simulation_ms", req("latency_simulation_ms")?)? as u64,
            pos_margin_grid_coeff: opt("pos_margin_grid_coeff", 0.0)?,
            volatility_grid_coeff: opt("volatility_grid_coeff", 0.0)?,
            volatility_qty_coeff: opt("volatility_qty_coeff", 0.0)?,
            entry_liq_diff_thr: opt("entry_liq_diff_thr", 0.0)?,
            do_long: opt("do_long", 1.0)? != 0.0,
            do_shrt: opt("do_shrt", 1.0)? != 0.0,
            maintenance_margin_rate: non_negative(
                "maintenance_margin_rate",
                opt("maintenance_margin_rate", mmr_for_max_leverage(max_leverage))?,
            )?,
            forced_refresh_ms: non_negative("forced_refresh_ms", opt("forced_refresh_ms", 5_000.0)?)? as u64,
            stats_interval_ms: non_negative("stats_interval_ms", opt("stats_interval_ms", 1_800_000.0)?)? as u64,
            snapshot_interval: positive("snapshot_interval", opt("snapshot_interval", 1_000.0)?.round())? as usize,
            indicator_chunk_len: positive("indicator_chunk_len", opt("indicator_chunk_len", DEFAULT_CHUNK_LEN as f64)?.round())? as usize,
            liquidation_fill: if opt("liquidation_fill_at_tick", 0.0)? != 0.0 {
                LiquidationFill::TickPrice
            } else {
                LiquidationFill::LiquidationPrice
            },
        })
    }

    /// Small, well-capitalized config used across the test suite.
    #[doc(hidden)]
    pub fn test_defaults() -> Self {
        Self::from_map(&test_map()).expect("test map is complete")
    }
}

/// Map backing [`BacktestConfig::test_defaults`].
#[doc(hidden)]
pub fn test_map() -> ConfigMap {
    [
        ("starting_balance", 1000.0),
        ("max_leverage", 20.0),
        ("leverage", 10.0),
        ("qty_step", 1.0),
        ("price_step", 0.01),
        ("min_qty", 1.0),
        ("min_cost", 5.0),
        ("maker_fee", 0.0002),
        ("taker_fee", 0.0004),
        ("ema_span", 10.0),
        ("ema_spread", 0.001),
        ("grid_spacing", 0.01),
        ("ddown_factor", 1.0),
        ("qty_pct", 0.1),
        ("n_close_orders", 5.0),
        ("min_markup", 0.002),
        ("markup_range", 0.005),
        ("latency_simulation_ms", 1000.0),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

/// Flatten a JSON object into the numeric map. Strings and nested values
/// (symbol, user, dates...) belong to other tools and are skipped.
pub fn map_from_json(path: &str, text: &str) -> Result<ConfigMap, ConfigError> {
    let obj: serde_json::Map<String, Value> =
        serde_json::from_str(text).map_err(|source| ConfigError::Parse { path: path.to_string(), source })?;
    let mut map = ConfigMap::new();
    for (k, v) in obj {
        match v {
            Value::Number(n) => {
                if let Some(x) = n.as_f64() {
                    map.insert(k, x);
                }
            }
            Value::Bool(b) => {
                map.insert(k, if b { 1.0 } else { 0.0 });
            }
            other => debug!(key = %k, value = %other, "config: skip non-numeric field"),
        }
    }
    Ok(map)
}

/// Apply `BACKTEST_<KEY>` overrides from the environment.
pub fn apply_env_overrides(map: &mut ConfigMap) -> Result<(), ConfigError> {
    for key in FIELDS {
        let env_key = format!("BACKTEST_{}", key.to_ascii_uppercase());
        if let Ok(raw) = env::var(&env_key) {
            let v: f64 = raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::BadOverride { key: env_key.clone(), value: raw.clone() })?;
            map.insert(key.to_string(), v);
        }
    }
    Ok(())
}

/// JSON file -> env overrides -> validated config.
pub fn load_file(path: &Path) -> Result<BacktestConfig, ConfigError> {
    let shown = path.display().to_string();
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Io { path: shown.clone(), source })?;
    let mut map = map_from_json(&shown, &text)?;
    apply_env_overrides(&mut map)?;
    BacktestConfig::from_map(&map)
}

// ===== CLI =====
#[derive(Parser, Clone, Debug)]
#[command(name = "grid_backtest", version, about = "Tick-level grid strategy backtester")]
pub struct Args {
    /// Tick file: CSV (price,is_buyer_maker,timestamp) or JSON array of triples
    #[arg(long, env = "TICKS_FILE", required_unless_present = "mock")]
    pub ticks: Option<PathBuf>,

    /// Generate N synthetic ticks instead of reading a file
    #[arg(long, env = "MOCK_TICKS", conflicts_with = "ticks")]
    pub mock: Option<usize>,

    /// Seed for --mock
    #[arg(long, env = "MOCK_SEED", default_value_t = 42)]
    pub seed: u64,

    /// One or more JSON config files; each runs as an independent backtest
    #[arg(long = "config", env = "BACKTEST_CONFIGS", value_delimiter = ',', required = true)]
    pub configs: Vec<PathBuf>,

    /// Output directory, one sub-directory per config
    #[arg(long, env = "OUT_DIR", default_value = "backtests")]
    pub out_dir: PathBuf,

    /// Merge consecutive ticks with identical (price, side)
    #[arg(long, env = "COMPRESS_TICKS")]
    pub compress: bool,

    /// Write prometheus text metrics here when all runs are done
    #[arg(long, env = "METRICS_FILE")]
    pub metrics_file: Option<PathBuf>,

    /// Stop each run after this many simulated ticks
    #[arg(long, env = "MAX_TICKS")]
    pub max_ticks: Option<usize>,
}

pub fn load_args() -> Args {
    // Pastikan .env dibaca dulu supaya atribut `env = ...` ikut ter-load
    let _ = dotenv();
    Args::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_optional_fields() {
        let cfg = BacktestConfig::test_defaults();
        assert_eq!(cfg.n_close_orders_long, 5);
        assert_eq!(cfg.n_close_orders_shrt, 5);
        assert!(cfg.do_long && cfg.do_shrt);
        assert_eq!(cfg.forced_refresh_ms, 5_000);
        assert_eq!(cfg.stats_interval_ms, 1_800_000);
        assert_eq!(cfg.snapshot_interval, 1_000);
        assert_eq!(cfg.maintenance_margin_rate, 0.025);
        assert_eq!(cfg.liquidation_fill, LiquidationFill::LiquidationPrice);
    }

    #[test]
    fn missing_field_is_invalid() {
        let mut map = test_map();
        map.remove("qty_step");
        assert!(matches!(BacktestConfig::from_map(&map), Err(ConfigError::Missing("qty_step"))));
    }

    #[test]
    fn non_finite_field_is_invalid() {
        let mut map = test_map();
        map.insert("leverage".into(), f64::NAN);
        assert!(matches!(
            BacktestConfig::from_map(&map),
            Err(ConfigError::NonFinite { field: "leverage", .. })
        ));
        let mut map = test_map();
        map.insert("entry_liq_diff_thr".into(), f64::INFINITY);
        assert!(matches!(
            BacktestConfig::from_map(&map),
            Err(ConfigError::NonFinite { field: "entry_liq_diff_thr", .. })
        ));
    }

    #[test]
    fn zero_step_is_out_of_range() {
        let mut map = test_map();
        map.insert("price_step".into(), 0.0);
        assert!(matches!(
            BacktestConfig::from_map(&map),
            Err(ConfigError::OutOfRange { field: "price_step", .. })
        ));
    }

    #[test]
    fn json_numbers_and_bools() {
        let text = r#"{"symbol": "XMRUSDT", "do_shrt": false, "ema_span": 120.4, "n_close_orders_long": 3}"#;
        let map = map_from_json("inline", text).unwrap();
        assert_eq!(map.get("do_shrt"), Some(&0.0));
        assert_eq!(map.get("ema_span"), Some(&120.4));
        assert!(!map.contains_key("symbol"));

        let mut full = test_map();
        full.extend(map);
        let cfg = BacktestConfig::from_map(&full).unwrap();
        assert!(!cfg.do_shrt);
        assert_eq!(cfg.ema_span, 120);
        assert_eq!(cfg.n_close_orders_long, 3);
        assert_eq!(cfg.n_close_orders_shrt, 5);
    }

    #[test]
    fn bad_json_reports_parse_error() {
        assert!(matches!(map_from_json("x.json", "[1,2"), Err(ConfigError::Parse { .. })));
    }
}
