//! Cyclic time arithmetic.
//!
//! A recording covers exactly one repetition of a [`TimeRange`]. Every point is
//! filed by its offset within that repetition, the "shift", and every shift
//! belongs to one slot of fixed width. Replay interprets the wall clock the
//! same way, which is what lets a week of data recorded months ago line up with
//! this week's Monday morning.
//!
//! All functions here are pure. Timestamps are whole seconds since the unix
//! epoch and may be negative.

use std::{
    fmt,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

/// Width of the zero-padded slot number in slot file names. Fixed so that
/// lexical and numeric ordering of slot files agree.
pub const SLOT_NAME_WIDTH: usize = 5;

/// Errors produced by [`SlotLayout`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The slot interval is zero or negative.
    #[error("Slot interval must be positive, got {0} seconds")]
    NonPositiveInterval(i64),
    /// The slot interval does not evenly divide the cycle.
    #[error("Slot interval of {interval} seconds does not divide the {range} cycle of {cycle} seconds")]
    UnevenInterval {
        /// The offending interval, in seconds
        interval: i64,
        /// The time range being divided
        range: TimeRange,
        /// The length of one cycle of `range`, in seconds
        cycle: i64,
    },
    /// The path does not name a slot file.
    #[error("Not a slot file path: {0:?}")]
    SlotPath(PathBuf),
}

/// A repeating period that replay timing is relative to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeRange {
    /// One hour, aligned to the top of the hour.
    Hour,
    /// One day, aligned to local midnight of the reference zone.
    Day,
    /// One week, aligned to Monday midnight of the reference zone.
    Week,
    /// A six minute cycle for exercising replay by hand.
    Debug,
}

impl TimeRange {
    /// Every time range.
    pub const ALL: [TimeRange; 4] = [
        TimeRange::Hour,
        TimeRange::Day,
        TimeRange::Week,
        TimeRange::Debug,
    ];

    /// Length of one cycle, in seconds.
    #[must_use]
    pub const fn cycle_seconds(self) -> i64 {
        match self {
            TimeRange::Hour => 60 * 60,
            TimeRange::Day => 24 * 60 * 60,
            TimeRange::Week => 7 * 24 * 60 * 60,
            TimeRange::Debug => 6 * 60,
        }
    }

    /// Seconds added to an absolute timestamp so that cycle boundaries fall on
    /// the reference instant. The reference zone is UTC-8, where the unix
    /// epoch fell on Wednesday 16:00, so a day is shifted by 16 hours and a
    /// week by two days and 16 hours.
    #[must_use]
    pub const fn epoch_shift(self) -> i64 {
        match self {
            TimeRange::Hour | TimeRange::Debug => 0,
            TimeRange::Day => 16 * 60 * 60,
            TimeRange::Week => (2 * 24 + 16) * 60 * 60,
        }
    }

    /// The configuration name of this range.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            TimeRange::Hour => "hour",
            TimeRange::Day => "day",
            TimeRange::Week => "week",
            TimeRange::Debug => "debug",
        }
    }

    /// Seconds elapsed between the start of the cycle containing `t` and `t`.
    ///
    /// Result is in `[0, cycle_seconds)`. Floored division keeps this correct
    /// for timestamps before the epoch.
    #[must_use]
    pub fn offset_in_cycle(self, t: i64) -> i64 {
        let cycle = self.cycle_seconds();
        let shift = self.epoch_shift();
        let cycle_index = (t + shift).div_euclid(cycle);
        let cycle_origin = cycle_index * cycle - shift;
        (t - cycle_origin).rem_euclid(cycle)
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A [`TimeRange`] cut into slots of equal width.
///
/// Construction checks that the interval divides the cycle, so every method
/// here may rely on `slots_per_cycle` being exact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotLayout {
    range: TimeRange,
    interval: i64,
}

impl SlotLayout {
    /// Create a new [`SlotLayout`].
    ///
    /// # Errors
    ///
    /// Fails if `interval` is not positive or does not evenly divide the cycle
    /// of `range`.
    pub fn new(range: TimeRange, interval: i64) -> Result<Self, Error> {
        if interval <= 0 {
            return Err(Error::NonPositiveInterval(interval));
        }
        let cycle = range.cycle_seconds();
        if cycle % interval != 0 {
            return Err(Error::UnevenInterval {
                interval,
                range,
                cycle,
            });
        }
        Ok(Self { range, interval })
    }

    /// The time range this layout divides.
    #[must_use]
    pub const fn range(self) -> TimeRange {
        self.range
    }

    /// Width of one slot, in seconds.
    #[must_use]
    pub const fn interval(self) -> i64 {
        self.interval
    }

    /// Number of slots in one cycle.
    #[must_use]
    pub const fn slots_per_cycle(self) -> i64 {
        self.range.cycle_seconds() / self.interval
    }

    /// The number of the final slot of the cycle.
    #[must_use]
    pub const fn last_slot(self) -> i64 {
        self.slots_per_cycle() - 1
    }

    /// The slot containing `t`, in `[0, slots_per_cycle)`.
    #[must_use]
    pub fn slot_number(self, t: i64) -> i64 {
        // offset is never negative, plain division is floored
        self.range.offset_in_cycle(t) / self.interval
    }

    /// The slot following `slot`, wrapping from the last slot to the first.
    #[must_use]
    pub fn next_slot(self, slot: i64) -> i64 {
        (slot + 1).rem_euclid(self.slots_per_cycle())
    }

    /// Path of the slot file containing `t`.
    #[must_use]
    pub fn slot_path(self, t: i64, dir: &Path, suffix: &str) -> PathBuf {
        slot_file(dir, self.slot_number(t), suffix)
    }

    /// Path of the slot file following `path`, wrapping from the last slot of
    /// the cycle to the first. Directory and suffix are preserved.
    ///
    /// # Errors
    ///
    /// Fails if `path` is not a slot file name.
    pub fn next_slot_path(self, path: &Path) -> Result<PathBuf, Error> {
        let slot = slot_of(path)?;
        let suffix = path
            .extension()
            .and_then(|ext| ext.to_str())
            .ok_or_else(|| Error::SlotPath(path.to_path_buf()))?;
        let dir = path.parent().unwrap_or_else(|| Path::new(""));
        Ok(slot_file(dir, self.next_slot(slot), suffix))
    }
}

/// Render the path of slot `slot` in `dir`.
#[must_use]
pub fn slot_file(dir: &Path, slot: i64, suffix: &str) -> PathBuf {
    dir.join(format!("{slot:0SLOT_NAME_WIDTH$}.{suffix}"))
}

/// Parse the slot number out of a slot file path.
///
/// # Errors
///
/// Fails if the file stem is not made of ASCII digits.
pub fn slot_of(path: &Path) -> Result<i64, Error> {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .filter(|stem| !stem.is_empty() && stem.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|stem| stem.parse().ok())
        .ok_or_else(|| Error::SlotPath(path.to_path_buf()))
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use proptest::prelude::*;

    use super::*;

    fn time_range() -> impl Strategy<Value = TimeRange> {
        prop::sample::select(TimeRange::ALL.to_vec())
    }

    // Every interval here divides every cycle.
    fn layout() -> impl Strategy<Value = SlotLayout> {
        (time_range(), prop::sample::select(vec![60_i64, 120, 360])).prop_map(
            |(range, interval)| SlotLayout::new(range, interval).expect("interval must divide"),
        )
    }

    #[test]
    fn shift_constants_are_smaller_than_cycles() {
        for range in TimeRange::ALL {
            assert!(range.epoch_shift() < range.cycle_seconds(), "{range}");
        }
    }

    #[test]
    fn cycle_origin_lands_on_reference_instant() {
        assert_eq!(TimeRange::Week.offset_in_cycle(-230_400), 0);
        assert_eq!(TimeRange::Week.offset_in_cycle(0), 230_400);
        assert_eq!(TimeRange::Day.offset_in_cycle(-57_600), 0);
        assert_eq!(TimeRange::Day.offset_in_cycle(0), 57_600);
        assert_eq!(TimeRange::Hour.offset_in_cycle(3_600 * 7 + 59), 59);
        assert_eq!(TimeRange::Debug.offset_in_cycle(365), 5);
    }

    #[test]
    fn negative_timestamps_use_floored_division() {
        assert_eq!(TimeRange::Hour.offset_in_cycle(-1), 3_599);
        assert_eq!(TimeRange::Debug.offset_in_cycle(-361), 359);
        let layout = SlotLayout::new(TimeRange::Debug, 60).expect("valid layout");
        assert_eq!(layout.slot_number(-1), 5);
    }

    #[test]
    fn debug_slots() {
        let layout = SlotLayout::new(TimeRange::Debug, 60).expect("valid layout");
        assert_eq!(layout.slots_per_cycle(), 6);
        assert_eq!(layout.last_slot(), 5);
        assert_eq!(layout.slot_number(5), 0);
        assert_eq!(layout.slot_number(65), 1);
        assert_eq!(layout.slot_number(125), 2);
        assert_eq!(layout.slot_number(359), 5);
        assert_eq!(layout.slot_number(360), 0);
    }

    #[test]
    fn layout_rejects_bad_intervals() {
        assert_eq!(
            SlotLayout::new(TimeRange::Hour, 0),
            Err(Error::NonPositiveInterval(0))
        );
        assert_eq!(
            SlotLayout::new(TimeRange::Debug, 7),
            Err(Error::UnevenInterval {
                interval: 7,
                range: TimeRange::Debug,
                cycle: 360
            })
        );
    }

    #[test]
    fn slot_paths_are_zero_padded() {
        let layout = SlotLayout::new(TimeRange::Week, 60).expect("valid layout");
        let dir = Path::new("/data/ts_data");
        // Monday 00:02:05 in the reference zone
        let path = layout.slot_path(-230_400 + 125, dir, "json");
        assert_eq!(path, PathBuf::from("/data/ts_data/00002.json"));
        assert_eq!(slot_of(&path), Ok(2));
    }

    #[test]
    fn next_slot_path_wraps() {
        let layout = SlotLayout::new(TimeRange::Debug, 60).expect("valid layout");
        let last = slot_file(Path::new("ts"), 5, "json");
        assert_eq!(
            layout.next_slot_path(&last),
            Ok(PathBuf::from("ts/00000.json"))
        );
        let first = slot_file(Path::new("ts"), 0, "data");
        assert_eq!(
            layout.next_slot_path(&first),
            Ok(PathBuf::from("ts/00001.data"))
        );
    }

    #[test]
    fn next_slot_path_rejects_foreign_names() {
        let layout = SlotLayout::new(TimeRange::Debug, 60).expect("valid layout");
        for bad in ["ts/metadata.json", "ts/-0001.json", "ts/00001", "ts/+0001.json"] {
            assert_eq!(
                layout.next_slot_path(Path::new(bad)),
                Err(Error::SlotPath(PathBuf::from(bad))),
                "{bad}"
            );
        }
    }

    proptest! {
        #[test]
        fn offset_is_within_cycle(range in time_range(), t in -10_i64.pow(10)..10_i64.pow(10)) {
            let offset = range.offset_in_cycle(t);
            prop_assert!((0..range.cycle_seconds()).contains(&offset));
        }

        #[test]
        fn offsets_advance_with_time_inside_a_cycle(
            range in time_range(),
            t1 in -10_i64.pow(10)..10_i64.pow(10),
            seed in 0_i64..604_800,
        ) {
            let start = range.offset_in_cycle(t1);
            let delta = seed % (range.cycle_seconds() - start);
            let t2 = t1 + delta;
            prop_assert_eq!(range.offset_in_cycle(t2) - start, t2 - t1);
        }

        #[test]
        fn slot_number_is_periodic(layout in layout(), t in -10_i64.pow(10)..10_i64.pow(10)) {
            let cycle = layout.range().cycle_seconds();
            let slot = layout.slot_number(t);
            prop_assert!((0..layout.slots_per_cycle()).contains(&slot));
            prop_assert_eq!(slot, layout.slot_number(t + cycle));
            prop_assert_eq!(slot, layout.slot_number(t - cycle));
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 32,
            .. ProptestConfig::default()
        })]
        #[test]
        fn next_slot_path_closes_the_cycle(layout in layout(), t in -10_i64.pow(10)..10_i64.pow(10)) {
            let start = layout.slot_path(t, Path::new("ts_data"), "json");
            let mut path = start.clone();
            for _ in 0..layout.slots_per_cycle() {
                path = layout.next_slot_path(&path).expect("slot path");
            }
            prop_assert_eq!(path, start);
        }
    }
}
