//! The recording session.
//!
//! Recording resolves every configured query to its metrics, downloads one
//! full cycle of each metric starting at the configured start time, files the
//! points into raw slot files and finally converts every slot file into the
//! form replay reads. The data directory is recreated from scratch.
//!
//! ## Metrics
//!
//! `metric_skipped`: Metrics left out because the source could not serve them
//!
//! Additional metrics are emitted by the range fetcher and the slot writer.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use metrics::counter;
use tracing::{info, warn};

use crate::{
    config::RecordSettings,
    fetch::RangeFetcher,
    metadata::{self, Metadata},
    slot::{self, SlotWriter},
    source::{self, Catalog, Source},
};

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`record`]
pub enum Error {
    /// The data directory could not be prepared.
    #[error("Failed to prepare {path:?}: {source}")]
    Io {
        /// The path operated on
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: io::Error,
    },
    /// The catalog could not resolve a query.
    #[error("Catalog lookup for {query:?} failed: {source}")]
    Catalog {
        /// The failing query expression
        query: String,
        /// Underlying source error
        #[source]
        source: source::Error,
    },
    /// Writing or converting slot files failed.
    #[error(transparent)]
    Slot(#[from] slot::Error),
    /// Writing the metadata file failed.
    #[error(transparent)]
    Metadata(#[from] metadata::Error),
}

/// What a recording session produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Summary {
    /// Metrics whose window was recorded
    pub metrics: usize,
    /// Metrics skipped because the source could not serve them
    pub skipped: usize,
    /// Points written
    pub points: usize,
    /// Slot files produced
    pub slot_files: usize,
}

fn prepare(path: &Path) -> impl FnOnce(io::Error) -> Error + '_ {
    move |source| Error::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Run one recording session.
///
/// `raw_config` is the configuration document `settings` was validated from.
/// It is written into the data directory unchanged.
///
/// # Errors
///
/// Fails if the data directory cannot be written or the catalog fails. A
/// metric the source cannot serve is logged and skipped instead.
pub async fn record<K, S>(
    settings: &RecordSettings,
    raw_config: &str,
    catalog: &K,
    source: &S,
) -> Result<Summary, Error>
where
    K: Catalog + ?Sized,
    S: Source + ?Sized,
{
    let data_dir = &settings.data_dir;
    let root = data_dir.root();
    let ts_dir = data_dir.ts_dir();
    if root.exists() {
        fs::remove_dir_all(root).map_err(prepare(root))?;
    }
    fs::create_dir_all(&ts_dir).map_err(prepare(&ts_dir))?;
    let config_path = data_dir.config_path();
    fs::write(&config_path, raw_config).map_err(prepare(&config_path))?;

    let mut metadata = Metadata::new();
    for query in &settings.queries {
        let found = catalog
            .lookup(query)
            .await
            .map_err(|source| Error::Catalog {
                query: query.clone(),
                source,
            })?;
        info!("query {query:?} matched {count} metrics", count = found.len());
        metadata.extend(found);
    }

    let fetcher = RangeFetcher::new(source);
    let mut writer = SlotWriter::new(settings.layout, &ts_dir);
    let mut summary = Summary::default();
    let ids = metadata.ids();
    let total = ids.len();
    for (n, id) in ids.into_iter().enumerate() {
        let Some(meta) = metadata.get(id) else {
            continue;
        };
        info!("{done}/{total} recording {id} ({name})", done = n + 1, name = meta.display_name);
        match fetcher.fetch(id, settings.start, settings.end, meta.kind).await {
            Ok(points) => {
                for point in &points {
                    writer.record(point)?;
                }
                writer.close()?;
                summary.metrics += 1;
                summary.points += points.len();
            }
            Err(err) => {
                warn!("skipping metric: {err}");
                counter!("metric_skipped").increment(1);
                summary.skipped += 1;
            }
        }
    }
    writer.close()?;

    metadata.store(&data_dir.metadata_path())?;
    summary.slot_files = slot::convert_all(&ts_dir, settings.layout.range())?;
    info!(
        "recorded {metrics} metrics, {points} points into {slot_files} slot files, skipped {skipped}",
        metrics = summary.metrics,
        points = summary.points,
        slot_files = summary.slot_files,
        skipped = summary.skipped,
    );
    Ok(summary)
}
