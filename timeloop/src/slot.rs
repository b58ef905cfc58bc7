//! Slot file storage.
//!
//! Recording appends every point to the raw slot file of its slot, one
//! `timestamp,metric_id,value` line per point. Once every metric is recorded,
//! each raw file is converted into a JSON slot file keyed by cycle offset and
//! the raw file is removed. Replay only ever reads the JSON form.
//!
//! ## Metrics
//!
//! `points_recorded`: Points appended to raw slot files
//! `points_not_finite`: Points dropped because their value is NaN or infinite
//!

use std::{
    collections::BTreeMap,
    fs::{self, File, OpenOptions},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};

use metrics::counter;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, error, info, warn};

use crate::{
    cycle::{self, SlotLayout, TimeRange},
    point::Point,
};

/// Suffix of raw slot files.
pub const RAW_SUFFIX: &str = "data";
/// Suffix of converted slot files.
pub const JSON_SUFFIX: &str = "json";

#[derive(thiserror::Error, Debug)]
/// Errors produced while writing, converting or loading slot files
pub enum Error {
    /// Filesystem operation failed.
    #[error("Slot file {path:?}: {source}")]
    Io {
        /// The file operated on
        path: PathBuf,
        /// The underlying IO error
        source: io::Error,
    },
    /// A raw slot file holds a line that is not `timestamp,metric_id,value`.
    #[error("Malformed line {line} of {path:?}: {content:?}")]
    Malformed {
        /// The raw slot file
        path: PathBuf,
        /// One-based line number
        line: usize,
        /// The offending line
        content: String,
    },
    /// A JSON slot file could not be encoded or decoded.
    #[error("Slot file {path:?} is not valid: {source}")]
    Json {
        /// The JSON slot file
        path: PathBuf,
        /// The underlying serde error
        source: serde_json::Error,
    },
    /// A slot file name could not be interpreted.
    #[error(transparent)]
    Cycle(#[from] cycle::Error),
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> Error + '_ {
    move |source| Error::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// One metric value recorded at an offset.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Reading {
    /// Metric id
    pub id: String,
    /// Recorded value
    pub value: f64,
}

/// Everything recorded at one cycle offset.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Entry {
    /// Absolute time, seconds, of the first point recorded at this offset
    #[serde(deserialize_with = "int_or_string")]
    pub old_time: i64,
    /// Readings in recording order
    pub data: Vec<Reading>,
}

fn int_or_string<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(i64),
        Str(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Int(t) => Ok(t),
        Raw::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// A converted slot: recorded entries keyed by cycle offset, seconds.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct SlotFile {
    entries: BTreeMap<i64, Entry>,
}

impl SlotFile {
    /// Load the slot file at `path`. A file that does not exist yields
    /// `Ok(None)`: the slot saw no traffic.
    ///
    /// # Errors
    ///
    /// Fails if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Option<Self>, Error> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_error(path)(err)),
        };
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|source| Error::Json {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Every offset holding an entry, ascending.
    #[must_use]
    pub fn offsets(&self) -> Vec<i64> {
        self.entries.keys().copied().collect()
    }

    /// Entries with their offsets, ascending by offset.
    pub fn iter(&self) -> impl Iterator<Item = (i64, &Entry)> {
        self.entries.iter().map(|(offset, entry)| (*offset, entry))
    }

    /// The entry recorded at `offset`.
    #[must_use]
    pub fn entry(&self, offset: i64) -> Option<&Entry> {
        self.entries.get(&offset)
    }

    /// Number of offsets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the slot holds no offsets.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug)]
struct OpenSlot {
    path: PathBuf,
    writer: BufWriter<File>,
}

/// Appends points to raw slot files, keeping at most one file open.
#[derive(Debug)]
pub struct SlotWriter {
    layout: SlotLayout,
    ts_dir: PathBuf,
    open: Option<OpenSlot>,
}

impl SlotWriter {
    /// Create a new [`SlotWriter`] writing into `ts_dir`.
    #[must_use]
    pub fn new(layout: SlotLayout, ts_dir: impl Into<PathBuf>) -> Self {
        Self {
            layout,
            ts_dir: ts_dir.into(),
            open: None,
        }
    }

    /// Append `point` to the raw file of its slot. A point whose value is not
    /// finite has no JSON form and is dropped with a warning.
    ///
    /// # Errors
    ///
    /// Fails if the previous file cannot be flushed or the new file cannot be
    /// opened or written.
    pub fn record(&mut self, point: &Point) -> Result<(), Error> {
        if !point.value.is_finite() {
            warn!(
                "dropping {id} at {t}: value {value} is not finite",
                id = point.metric_id,
                t = point.timestamp_seconds,
                value = point.value,
            );
            counter!("points_not_finite").increment(1);
            return Ok(());
        }
        let path = self
            .layout
            .slot_path(point.timestamp_seconds, &self.ts_dir, RAW_SUFFIX);

        let slot = match self.open.take() {
            Some(slot) if slot.path == path => slot,
            previous => {
                if let Some(previous) = previous {
                    Self::finish(previous)?;
                }
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .map_err(io_error(&path))?;
                debug!("opened {path:?}");
                OpenSlot {
                    path,
                    writer: BufWriter::new(file),
                }
            }
        };
        let slot = self.open.insert(slot);

        writeln!(
            slot.writer,
            "{},{},{}",
            point.timestamp_seconds, point.metric_id, point.value
        )
        .map_err(io_error(&slot.path))?;
        counter!("points_recorded").increment(1);
        Ok(())
    }

    /// Flush and close the open file, if any.
    ///
    /// # Errors
    ///
    /// Fails if buffered lines cannot be written out.
    pub fn close(&mut self) -> Result<(), Error> {
        match self.open.take() {
            Some(slot) => Self::finish(slot),
            None => Ok(()),
        }
    }

    /// Path of the currently open raw file.
    #[must_use]
    pub fn current_path(&self) -> Option<&Path> {
        self.open.as_ref().map(|slot| slot.path.as_path())
    }

    fn finish(mut slot: OpenSlot) -> Result<(), Error> {
        slot.writer.flush().map_err(io_error(&slot.path))
    }
}

impl Drop for SlotWriter {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            error!("failed to flush slot file on drop: {err}");
        }
    }
}

fn parse_line(line: &str) -> Option<(i64, &str, f64)> {
    let (timestamp, rest) = line.split_once(',')?;
    let (metric_id, value) = rest.rsplit_once(',')?;
    if metric_id.is_empty() {
        return None;
    }
    Some((
        timestamp.trim().parse().ok()?,
        metric_id,
        value.trim().parse().ok()?,
    ))
}

/// Convert the raw slot file at `raw` into its JSON form, next to it, and
/// remove `raw`. Returns the path of the JSON file.
///
/// # Errors
///
/// Fails on unreadable or malformed input, or if the output cannot be
/// written. `raw` is left in place on failure.
pub fn convert(raw: &Path, range: TimeRange) -> Result<PathBuf, Error> {
    let contents = fs::read_to_string(raw).map_err(io_error(raw))?;

    let mut slot = SlotFile::default();
    for (index, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let (timestamp, metric_id, value) =
            parse_line(line).ok_or_else(|| Error::Malformed {
                path: raw.to_path_buf(),
                line: index + 1,
                content: line.to_string(),
            })?;
        if !value.is_finite() {
            warn!("{raw:?} line {line}: dropping non-finite value {value}", line = index + 1);
            counter!("points_not_finite").increment(1);
            continue;
        }
        slot.entries
            .entry(range.offset_in_cycle(timestamp))
            .or_insert_with(|| Entry {
                old_time: timestamp,
                data: Vec::new(),
            })
            .data
            .push(Reading {
                id: metric_id.to_string(),
                value,
            });
    }

    let json = raw.with_extension(JSON_SUFFIX);
    let encoded = serde_json::to_vec(&slot).map_err(|source| Error::Json {
        path: json.clone(),
        source,
    })?;
    fs::write(&json, encoded).map_err(io_error(&json))?;
    fs::remove_file(raw).map_err(io_error(raw))?;
    Ok(json)
}

/// Convert every raw slot file in `ts_dir`. Returns the number converted.
///
/// # Errors
///
/// Fails on the first file that cannot be converted.
pub fn convert_all(ts_dir: &Path, range: TimeRange) -> Result<usize, Error> {
    let mut raws = Vec::new();
    for dir_entry in fs::read_dir(ts_dir).map_err(io_error(ts_dir))? {
        let path = dir_entry.map_err(io_error(ts_dir))?.path();
        if path.extension().and_then(|ext| ext.to_str()) == Some(RAW_SUFFIX) {
            cycle::slot_of(&path)?;
            raws.push(path);
        }
    }
    raws.sort();

    for raw in &raws {
        convert(raw, range)?;
    }
    info!("converted {count} slot files in {ts_dir:?}", count = raws.len());
    Ok(raws.len())
}
