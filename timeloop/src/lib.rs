//! The timeloop metrics record and replay tool.
//!
//! Recording pulls one cycle of metric time series out of a source store and
//! files every point into a slot keyed by its position within a repeating time
//! range. Replay walks those slots in cyclic order forever, waiting until each
//! recorded offset recurs on the wall clock and pushing the points recorded
//! there to an ingest endpoint, stamped with the current time.
//!
//! This library supports the timeloop binary found elsewhere in this project.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]

pub mod classify;
pub mod clock;
pub mod config;
pub mod cycle;
pub mod fetch;
pub mod metadata;
pub mod point;
pub mod record;
pub mod replay;
pub mod sink;
pub mod slot;
pub mod source;
