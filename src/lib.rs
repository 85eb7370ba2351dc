// ===============================
// src/lib.rs
// ===============================
pub mod backtest;
pub mod book;
pub mod config;
pub mod domain;
pub mod feed;
pub mod indicators;
pub mod metrics;
pub mod numeric;
pub mod positions;
pub mod posttrade;
pub mod recorder;
pub mod risk;
pub mod strategy;

pub use backtest::{run_backtest, BacktestError, BacktestResult, RunControl, RunOutcome, StopReason};
pub use config::BacktestConfig;
pub use domain::{Fill, FillKind, Order, PSide, Position, SidePosition, StateSnapshot, StatsRecord, Tick};
