//! Recording configuration and data directory layout.
//!
//! A recording is described by a JSON document. The document is copied
//! verbatim into the data directory it produces, so replay learns the time
//! range and slot interval from the same source recording used.
//!
//! Parsing only checks shape. [`RecordConfig::validate`] turns a parsed
//! document into [`RecordSettings`], rejecting anything recording cannot act
//! on. Crashes on bad input are expected to originate here.

use std::{
    fs, io,
    path::{Path, PathBuf},
    str::FromStr,
};

use chrono::{Local, NaiveDateTime, TimeZone};
use serde::{Deserialize, Serialize};

use crate::cycle::{self, SlotLayout, TimeRange};

/// Name of the copied recording configuration inside a data directory.
pub const CONFIG_FILE: &str = "configuration.json";
/// Name of the metadata file inside a data directory.
pub const METADATA_FILE: &str = "metadata.json";
/// Name of the slot file directory inside a data directory.
pub const TS_DATA_DIR: &str = "ts_data";
/// Pattern of `start_time`, interpreted in local time.
pub const START_TIME_PATTERN: &str = "%m.%d.%Y %H:%M:%S";

/// Errors produced by [`RecordConfig`] and [`DataDir`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error reading a configuration file
    #[error("Failed to read config file {path:?}: {source}")]
    Read {
        /// File path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: io::Error,
    },
    /// Error for a serde [`serde_json`].
    #[error("Failed to deserialize json: {0}")]
    Json(#[from] serde_json::Error),
    /// `start_time` does not match [`START_TIME_PATTERN`].
    #[error("start_time {value:?} does not match {pattern}: {source}", pattern = START_TIME_PATTERN)]
    StartTime {
        /// The configured value
        value: String,
        /// Underlying parse error
        #[source]
        source: chrono::ParseError,
    },
    /// `start_time` names a local time skipped by a clock change.
    #[error("start_time {0:?} does not exist in the local time zone")]
    NonexistentStartTime(String),
    /// The recording window has not fully elapsed.
    #[error("Recording window ends at {end}, after the current time {now}")]
    WindowInFuture {
        /// End of the window, seconds since the unix epoch
        end: i64,
        /// The current time, seconds since the unix epoch
        now: i64,
    },
    /// `data_file_interval` is not a whole, positive number of seconds.
    #[error("data_file_interval of {0} hours is not a whole positive number of seconds")]
    Interval(f64),
    /// The slot interval does not fit the time range.
    #[error(transparent)]
    Layout(#[from] cycle::Error),
    /// No query expression is configured.
    #[error("At least one query is required")]
    NoQueries,
    /// The data directory does not exist.
    #[error("Data directory {0:?} does not exist")]
    MissingDataDirectory(PathBuf),
    /// The data directory lacks a required member.
    #[error("Data directory {root:?} is not complete, missing {missing}")]
    IncompleteDataDirectory {
        /// The data directory
        root: PathBuf,
        /// The missing member
        missing: &'static str,
    },
}

/// The recording configuration document.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RecordConfig {
    /// Base URL of the metric catalog API
    pub api_server: String,
    /// Token for the catalog and time series APIs
    pub record_token: String,
    /// Base URL of the time series store
    pub ts_server: String,
    /// Catalog query expressions selecting the metrics to record
    pub query: Vec<String>,
    /// Directory the recording is written to
    pub data_directory: PathBuf,
    /// Start of the recording window, see [`START_TIME_PATTERN`]
    pub start_time: String,
    /// The repeating period recorded
    pub time_range: TimeRange,
    /// Width of one slot, in hours
    pub data_file_interval: f64,
}

/// A validated recording configuration.
#[derive(Debug, Clone)]
pub struct RecordSettings {
    /// Base URL of the metric catalog API
    pub api_server: String,
    /// Token for the catalog and time series APIs
    pub record_token: String,
    /// Base URL of the time series store
    pub ts_server: String,
    /// Catalog query expressions
    pub queries: Vec<String>,
    /// Output directory
    pub data_dir: DataDir,
    /// Start of the window, seconds since the unix epoch
    pub start: i64,
    /// End of the window, exclusive
    pub end: i64,
    /// Slot layout of the recording
    pub layout: SlotLayout,
}

impl FromStr for RecordConfig {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(serde_json::from_str(s)?)
    }
}

impl RecordConfig {
    /// Read the configuration at `path`.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read or does not hold a configuration
    /// document.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let contents = fs::read_to_string(path).map_err(|source| Error::Read {
            path: path.to_path_buf(),
            source,
        })?;
        contents.parse()
    }

    /// The slot layout described by `time_range` and `data_file_interval`.
    ///
    /// # Errors
    ///
    /// Fails if the interval is not a whole number of seconds dividing the
    /// time range.
    pub fn layout(&self) -> Result<SlotLayout, Error> {
        let interval = interval_seconds(self.data_file_interval)?;
        Ok(SlotLayout::new(self.time_range, interval)?)
    }

    /// Validate this configuration at wall clock time `now`, seconds.
    ///
    /// # Errors
    ///
    /// Fails if no query is given, the start time does not parse, the window
    /// has not elapsed by `now` or the interval does not fit the time range.
    pub fn validate(&self, now: i64) -> Result<RecordSettings, Error> {
        if self.query.is_empty() {
            return Err(Error::NoQueries);
        }
        let layout = self.layout()?;
        let start = parse_start_time(&self.start_time)?;
        let end = start + self.time_range.cycle_seconds();
        if end > now {
            return Err(Error::WindowInFuture { end, now });
        }

        Ok(RecordSettings {
            api_server: self.api_server.clone(),
            record_token: self.record_token.clone(),
            ts_server: self.ts_server.clone(),
            queries: self.query.clone(),
            data_dir: DataDir::new(&self.data_directory),
            start,
            end,
            layout,
        })
    }
}

/// Parse `value` per [`START_TIME_PATTERN`] in local time. Returns seconds
/// since the unix epoch. An ambiguous local time resolves to the earlier
/// instant.
///
/// # Errors
///
/// Fails if `value` does not match the pattern or names a local time that
/// does not exist.
pub fn parse_start_time(value: &str) -> Result<i64, Error> {
    let naive = NaiveDateTime::parse_from_str(value.trim(), START_TIME_PATTERN).map_err(
        |source| Error::StartTime {
            value: value.to_string(),
            source,
        },
    )?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|t| t.timestamp())
        .ok_or_else(|| Error::NonexistentStartTime(value.to_string()))
}

/// Convert a slot interval in hours to whole seconds.
///
/// # Errors
///
/// Fails unless `hours` is positive and amounts to a whole number of seconds.
#[allow(clippy::cast_possible_truncation)]
pub fn interval_seconds(hours: f64) -> Result<i64, Error> {
    let seconds = hours * 3600.0;
    let whole = seconds.round();
    if !seconds.is_finite() || whole < 1.0 || (seconds - whole).abs() > 1e-6 {
        return Err(Error::Interval(hours));
    }
    Ok(whole as i64)
}

/// The layout of a recording's data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Create a new [`DataDir`] rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The data directory itself.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the copied recording configuration.
    #[must_use]
    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    /// Path of the metadata file.
    #[must_use]
    pub fn metadata_path(&self) -> PathBuf {
        self.root.join(METADATA_FILE)
    }

    /// Path of the slot file directory.
    #[must_use]
    pub fn ts_dir(&self) -> PathBuf {
        self.root.join(TS_DATA_DIR)
    }

    /// Check that this directory holds a complete recording.
    ///
    /// # Errors
    ///
    /// Fails if the directory, its configuration, its metadata or its slot
    /// directory is missing.
    pub fn validate(&self) -> Result<(), Error> {
        if !self.root.is_dir() {
            return Err(Error::MissingDataDirectory(self.root.clone()));
        }
        let missing = if !self.config_path().is_file() {
            Some(CONFIG_FILE)
        } else if !self.metadata_path().is_file() {
            Some(METADATA_FILE)
        } else if !self.ts_dir().is_dir() {
            Some(TS_DATA_DIR)
        } else {
            None
        };
        match missing {
            Some(missing) => Err(Error::IncompleteDataDirectory {
                root: self.root.clone(),
                missing,
            }),
            None => Ok(()),
        }
    }
}
