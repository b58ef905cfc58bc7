//! The real time replay scheduler.
//!
//! Replay walks an absolute timeline. Every slot file is played in a definite
//! cycle: an offset recorded at `o` seconds into the cycle is due at the start
//! of that cycle plus `o`. Seeking loads the file of the current slot and skips
//! the offsets already played or passed. Streaming waits for each remaining
//! offset to come due, dispatches what was recorded there and, once the file
//! is exhausted, hands the next slot in cyclic order back to Seeking. Moving
//! from the last slot to slot 0 moves the timeline into the next cycle.
//!
//! A slot without a file saw no traffic: the scheduler sleeps one slot
//! interval and seeks again from the current time. An offset that came due
//! while a previous dispatch was still running fires immediately. A slot
//! entered after its whole span has passed is skipped by seeking again from
//! the current time.
//!
//! The loop has no end of its own. It stops, returning [`Status::Stopped`],
//! when the shutdown signal fires while it is waiting or dispatching.
//!
//! ## Metrics
//!
//! `slot_missing`: Slots skipped because no slot file exists
//! `points_dispatched`: Datapoints accepted by the sink
//! `dispatch_failure`: Batches the sink failed to accept
//! `replay_lag`: Offsets dispatched late because a previous dispatch overran
//! `replay_resync`: Times replay fell a full slot behind and skipped ahead
//!

use std::{path::PathBuf, pin::Pin, time::Duration};

use chrono::{DateTime, Local};
use metrics::counter;
use timeloop_signal::Watcher;
use tracing::{debug, error, info, warn};

use crate::{
    classify::classify,
    clock::Clock,
    cycle::{self, SlotLayout, TimeRange},
    metadata::Metadata,
    sink::Sink,
    slot::{Entry, JSON_SUFFIX, SlotFile},
};

/// Replay configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// How the recording was cut into slots
    pub layout: SlotLayout,
    /// Directory holding the JSON slot files
    pub ts_dir: PathBuf,
    /// Log per-kind counts and the original time of every dispatch
    pub verbose: bool,
}

/// How a replay run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The shutdown signal was observed.
    Stopped,
}

/// Position of `now_ms` within its cycle, milliseconds.
#[must_use]
pub fn shift_ms(range: TimeRange, now_ms: i64) -> i64 {
    range.offset_in_cycle(now_ms.div_euclid(1000)) * 1000 + now_ms.rem_euclid(1000)
}

/// A place on the replay timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    /// The slot being played
    pub slot: i64,
    /// Absolute start of the cycle `slot` is played in, milliseconds
    pub cycle_start_ms: i64,
    /// Offsets due before this absolute time, milliseconds, are not played
    pub from_ms: i64,
}

impl Position {
    /// The position of wall clock time `now_ms`. Offsets due at `now_ms` are
    /// still played.
    #[must_use]
    pub fn at(layout: SlotLayout, now_ms: i64) -> Self {
        Self {
            slot: layout.slot_number(now_ms.div_euclid(1000)),
            cycle_start_ms: now_ms - shift_ms(layout.range(), now_ms),
            from_ms: now_ms,
        }
    }

    /// The following slot. Leaving the last slot enters the next cycle.
    #[must_use]
    pub fn next(self, layout: SlotLayout) -> Self {
        let slot = layout.next_slot(self.slot);
        let cycle_start_ms = if slot == 0 {
            self.cycle_start_ms + layout.range().cycle_seconds() * 1000
        } else {
            self.cycle_start_ms
        };
        Self {
            slot,
            cycle_start_ms,
            ..self
        }
    }

    /// Seek to wall clock time `now_ms` without replaying anything already
    /// passed by `self`.
    #[must_use]
    pub fn resync(self, layout: SlotLayout, now_ms: i64) -> Self {
        let at = Self::at(layout, now_ms);
        Self {
            from_ms: at.from_ms.max(self.from_ms),
            ..at
        }
    }

    /// Absolute time the recorded `offset` is due, milliseconds.
    #[must_use]
    pub fn due_ms(self, offset: i64) -> i64 {
        self.cycle_start_ms + offset * 1000
    }

    /// Absolute time the slot ends, milliseconds, exclusive.
    #[must_use]
    pub fn slot_end_ms(self, layout: SlotLayout) -> i64 {
        self.cycle_start_ms + (self.slot + 1) * layout.interval() * 1000
    }

    /// Index into ascending `offsets` of the first offset still to play.
    #[must_use]
    pub fn first_pending(self, offsets: &[i64]) -> usize {
        offsets.partition_point(|offset| self.due_ms(*offset) < self.from_ms)
    }

    /// Mark the offset due at `due_ms` as played.
    pub fn played(&mut self, due_ms: i64) {
        self.from_ms = self.from_ms.max(due_ms + 1);
    }
}

/// Replays a recording against a [`Sink`].
#[derive(Debug)]
pub struct Scheduler<C, S> {
    config: Config,
    metadata: Metadata,
    clock: C,
    sink: S,
    shutdown: Watcher,
}

impl<C, S> Scheduler<C, S>
where
    C: Clock,
    S: Sink,
{
    /// Create a new [`Scheduler`].
    #[must_use]
    pub fn new(config: Config, metadata: Metadata, clock: C, sink: S, shutdown: Watcher) -> Self {
        Self {
            config,
            metadata,
            clock,
            sink,
            shutdown,
        }
    }

    /// Replay until the shutdown signal fires.
    pub async fn run(self) -> Status {
        let Self {
            config,
            metadata,
            clock,
            sink,
            shutdown,
        } = self;
        let layout = config.layout;
        let interval = Duration::from_secs(layout.interval().unsigned_abs());

        let shutdown = shutdown.recv();
        tokio::pin!(shutdown);

        info!(
            "replaying {range} cycle of {slots} slots from {dir:?}",
            range = layout.range(),
            slots = layout.slots_per_cycle(),
            dir = config.ts_dir,
        );
        let mut position = Position::at(layout, clock.now_ms());

        loop {
            // Seeking
            let now_ms = clock.now_ms();
            if now_ms >= position.slot_end_ms(layout) {
                warn!(
                    "slot {slot} ended {behind}ms ago, skipping ahead",
                    slot = position.slot,
                    behind = now_ms - position.slot_end_ms(layout),
                );
                counter!("replay_resync").increment(1);
                position = position.resync(layout, now_ms);
            }

            let path = cycle::slot_file(&config.ts_dir, position.slot, JSON_SUFFIX);
            let file = match SlotFile::load(&path) {
                Ok(file) => file,
                Err(err) => {
                    error!("skipping unreadable slot file: {err}");
                    None
                }
            };
            let Some(file) = file else {
                debug!("no slot file {path:?}, sleeping {interval:?}");
                counter!("slot_missing").increment(1);
                if !pause(&clock, interval, &mut shutdown).await {
                    return Status::Stopped;
                }
                position = position.resync(layout, clock.now_ms());
                continue;
            };

            // Streaming
            let index = position.first_pending(&file.offsets());
            debug!(
                "streaming {path:?} from offset index {index} of {len}",
                len = file.len()
            );

            for (offset, entry) in file.iter().skip(index) {
                let due_ms = position.due_ms(offset);
                let wait_ms = due_ms - clock.now_ms();
                if wait_ms < 0 {
                    warn!(
                        "offset {offset} of slot {slot} is {late}ms late",
                        slot = position.slot,
                        late = -wait_ms
                    );
                    counter!("replay_lag").increment(1);
                }

                let wait = Duration::from_millis(wait_ms.max(0).unsigned_abs());
                if !pause(&clock, wait, &mut shutdown).await {
                    return Status::Stopped;
                }
                let sent = tokio::select! {
                    biased;

                    () = shutdown.as_mut() => false,
                    () = dispatch(&sink, &metadata, offset, entry, clock.now_ms(), config.verbose) => true,
                };
                if !sent {
                    info!("shutdown signal received during dispatch");
                    return Status::Stopped;
                }
                position.played(due_ms);
            }

            position = position.next(layout);
        }
    }
}

/// Wait for `duration` unless shutdown fires first. Returns `false` on
/// shutdown.
async fn pause<C, F>(clock: &C, duration: Duration, shutdown: &mut Pin<&mut F>) -> bool
where
    C: Clock,
    F: Future<Output = ()>,
{
    tokio::select! {
        biased;

        () = shutdown.as_mut() => {
            info!("shutdown signal received");
            false
        }
        () = clock.wait(duration) => true,
    }
}

async fn dispatch<S>(
    sink: &S,
    metadata: &Metadata,
    offset: i64,
    entry: &Entry,
    now_ms: i64,
    verbose: bool,
) where
    S: Sink,
{
    let batch = classify(&entry.data, metadata, now_ms);
    if verbose {
        let recorded = DateTime::from_timestamp(entry.old_time, 0).map_or_else(
            || entry.old_time.to_string(),
            |t| t.with_timezone(&Local).format("%a %b %e %H:%M:%S %Y").to_string(),
        );
        info!("offset {offset} originally recorded {recorded}");
        info!(
            "gauges: {gauges}, counters: {counters}, cumulative counters: {cumulative}",
            gauges = batch.gauges.len(),
            counters = batch.counters.len(),
            cumulative = batch.cumulative_counters.len(),
        );
    } else {
        info!("sending {count} datapoints", count = batch.len());
    }

    match sink.send(&batch).await {
        Ok(()) => counter!("points_dispatched").increment(batch.len() as u64),
        Err(err) => {
            error!("failed to dispatch offset {offset}: {err}");
            counter!("dispatch_failure").increment(1);
        }
    }
}
