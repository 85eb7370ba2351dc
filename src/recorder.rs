// ===============================
// src/recorder.rs
// ===============================
//
// Output sinks for one backtest run.
// - `Recorder`: callback trait the simulation loop writes into (sync).
// - `MemoryRecorder`: keeps everything in Vecs (tests, summaries).
// - `ChannelRecorder`: forwards Events into a tokio mpsc channel.
// - `run`: async JSONL writer on the other end of that channel.
//   Flush tiap 1000 event dan tiap 1 detik; parent directory dibuat otomatis.
//
use std::path::{Path, PathBuf};
use tokio::{
    fs::{self, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::mpsc,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{error, info};

use crate::domain::{Event, Fill, StateSnapshot, StatsRecord};

pub trait Recorder {
    fn on_fill(&mut self, fill: &Fill);
    fn on_stats(&mut self, stats: &StatsRecord);
    fn on_snapshot(&mut self, snapshot: &StateSnapshot);
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NullRecorder;

impl Recorder for NullRecorder {
    fn on_fill(&mut self, _: &Fill) {}
    fn on_stats(&mut self, _: &StatsRecord) {}
    fn on_snapshot(&mut self, _: &StateSnapshot) {}
}

#[derive(Debug, Default, Clone)]
pub struct MemoryRecorder {
    pub fills: Vec<Fill>,
    pub stats: Vec<StatsRecord>,
    pub snapshots: Vec<StateSnapshot>,
}

impl Recorder for MemoryRecorder {
    fn on_fill(&mut self, fill: &Fill) { self.fills.push(fill.clone()); }
    fn on_stats(&mut self, stats: &StatsRecord) { self.stats.push(*stats); }
    fn on_snapshot(&mut self, snapshot: &StateSnapshot) { self.snapshots.push(snapshot.clone()); }
}

/// Bridge from the blocking simulation thread to the async writer.
/// Must not be used from inside an async context (`blocking_send`).
pub struct ChannelRecorder {
    tx: mpsc::Sender<Event>,
    dropped: u64,
}

impl ChannelRecorder {
    pub fn new(tx: mpsc::Sender<Event>) -> Self { Self { tx, dropped: 0 } }

    /// Events lost because the writer side went away.
    pub fn dropped(&self) -> u64 { self.dropped }

    fn send(&mut self, ev: Event) {
        if self.tx.blocking_send(ev).is_err() {
            self.dropped += 1;
        }
    }
}

impl Recorder for ChannelRecorder {
    fn on_fill(&mut self, fill: &Fill) { self.send(Event::Fill(fill.clone())); }
    fn on_stats(&mut self, stats: &StatsRecord) { self.send(Event::Stats(*stats)); }
    fn on_snapshot(&mut self, snapshot: &StateSnapshot) { self.send(Event::Snapshot(snapshot.clone())); }
}

async fn open_writer(path: &Path) -> std::io::Result<BufWriter<tokio::fs::File>> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    let file = OpenOptions::new().create(true).write(true).truncate(true).open(path).await?;
    Ok(BufWriter::new(file))
}

/// Drain `rx` into `path` as one JSON object per line. Returns the number of
/// events written once the channel closes.
pub async fn run(mut rx: mpsc::Receiver<Event>, path: PathBuf) -> std::io::Result<u64> {
    info!(path = %path.display(), "recorder: started");
    let mut writer = open_writer(&path).await?;

    let mut tick = interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut written: u64 = 0;
    let mut since_last_flush: u32 = 0;
    const FLUSH_EVERY_N_EVENTS: u32 = 1000;

    loop {
        tokio::select! {
            maybe_ev = rx.recv() => {
                let Some(ev) = maybe_ev else {
                    writer.flush().await?;
                    info!(path = %path.display(), events = written, "recorder: channel closed, stopped");
                    return Ok(written);
                };
                let mut line = match serde_json::to_string(&ev) {
                    Ok(s) => s,
                    Err(e) => {
                        error!(?e, "recorder: serialize error, skip event");
                        continue;
                    }
                };
                line.push('\n');
                writer.write_all(line.as_bytes()).await?;
                written += 1;

                since_last_flush += 1;
                if since_last_flush >= FLUSH_EVERY_N_EVENTS {
                    writer.flush().await?;
                    since_last_flush = 0;
                }
            }

            _ = tick.tick() => {
                writer.flush().await?;
                since_last_flush = 0;
            }
        }
    }
}
