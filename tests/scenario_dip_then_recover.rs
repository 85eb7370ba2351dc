use grid_backtest_rust::domain::{FillKind, PSide, SnapshotTrigger};
use grid_backtest_rust::positions::replay_ledger;
use grid_backtest_rust::recorder::MemoryRecorder;
use grid_backtest_rust::{run_backtest, BacktestConfig, RunControl, RunOutcome, Tick};

fn config() -> BacktestConfig {
    BacktestConfig { do_shrt: false, n_close_orders_long: 1, ..BacktestConfig::test_defaults() }
}

/// Flat at 100 through warm-up, one sell print at 99.8, then a rally that
/// trades through the take-profit.
fn tape() -> Vec<Tick> {
    let mut ticks: Vec<Tick> = (0..13u64).map(|i| Tick::new(100.0, i % 2 == 0, i * 1000)).collect();
    ticks.push(Tick::new(99.8, true, 13_000));
    ticks.push(Tick::new(100.0, false, 14_000));
    ticks.push(Tick::new(100.2, false, 15_000));
    for i in 16..40u64 {
        ticks.push(Tick::new(100.2, i % 2 == 0, i * 1000));
    }
    ticks
}

#[test]
fn scenario_dip_fills_entry_and_rally_takes_profit() {
    let cfg = config();
    let ticks = tape();
    let mut rec = MemoryRecorder::default();
    let res = run_backtest(&ticks, &cfg, &mut rec, &RunControl::default()).unwrap();

    assert_eq!(res.outcome, RunOutcome::Finished);
    assert!(res.outcome.did_finish());
    assert_eq!(res.fills.len(), 2, "{:#?}", res.fills);

    let entry = &res.fills[0];
    assert_eq!(entry.kind, FillKind::Entry);
    assert_eq!(entry.pside, PSide::Long);
    assert_eq!(entry.tick_index, 13);
    assert_eq!(entry.qty, 10.0);
    assert_eq!(entry.price, 99.9);
    assert_eq!(entry.pnl, 0.0);
    assert!(entry.fee_paid < 0.0);
    assert_eq!(entry.position.long.size, 10.0);

    let close = &res.fills[1];
    assert_eq!(close.kind, FillKind::Close);
    assert_eq!(close.tick_index, 15);
    assert_eq!(close.qty, -10.0);
    assert_eq!(close.price, 100.1);
    assert!(close.pnl > 0.0);
    assert!((close.pnl - 2.0).abs() < 1e-9);
    assert!(close.position.is_flat());

    assert!(res.final_account.position.is_flat());
    let expected = cfg.starting_balance + close.pnl + entry.fee_paid + close.fee_paid;
    assert!((res.final_account.balance - expected).abs() < 1e-9);
    assert!(res.final_account.balance > cfg.starting_balance);
}

#[test]
fn scenario_dip_records_stats_and_fill_snapshots() {
    let cfg = config();
    let ticks = tape();
    let mut rec = MemoryRecorder::default();
    let res = run_backtest(&ticks, &cfg, &mut rec, &RunControl::default()).unwrap();

    // opening, first simulated tick, closing
    assert_eq!(rec.stats.len(), 3);
    assert_eq!(rec.stats[0].timestamp_ms, 0);
    assert_eq!(rec.stats[2].timestamp_ms, 39_000);
    assert_eq!(rec.stats[2].balance, res.final_account.balance);

    let fill_snaps: Vec<_> = rec.snapshots.iter().filter(|s| s.trigger == SnapshotTrigger::Fill).collect();
    assert_eq!(fill_snaps.len(), 2);
    assert_eq!(fill_snaps[0].fill_kind, Some(FillKind::Entry));
    assert_eq!(fill_snaps[1].fill_kind, Some(FillKind::Close));
    assert!(fill_snaps.iter().all(|s| s.bids.is_empty() && s.bid_thr.is_none()));
    assert_eq!(rec.fills, res.fills);
}

#[test]
fn scenario_dip_ledger_replays_to_final_account() {
    let cfg = config();
    let res = run_backtest(&tape(), &cfg, &mut MemoryRecorder::default(), &RunControl::default()).unwrap();
    let replayed = replay_ledger(cfg.starting_balance, &res.fills, cfg.qty_step);
    assert_eq!(replayed.balance, res.final_account.balance);
    assert_eq!(replayed.position, res.final_account.position);
}
