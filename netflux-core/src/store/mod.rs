//! Pluggable persistence. [`RelationalStore`] and [`TimeSeriesStore`] are
//! the seam the concrete SQL/time-series client lives behind; [`sqlite`]
//! provides the default, runnable implementation of both.

pub mod sqlite;

use crate::flow::{PersistedFlow, TimeseriesPoint};

#[derive(Debug, snafu::Snafu)]
pub enum StoreError {
    #[snafu(display("relational store error: {message}"))]
    Relational { message: String },
    #[snafu(display("time-series store error: {message}"))]
    TimeSeries { message: String },
}

/// The `flows` table. One long-lived handle per writer, serializing its own
/// writes — not a connection opened per entry.
pub trait RelationalStore: Send {
    fn insert_flow(&mut self, flow: &PersistedFlow) -> Result<(), StoreError>;
}

/// The `activities` time-series measurement.
pub trait TimeSeriesStore: Send {
    fn insert_points(&mut self, points: &[TimeseriesPoint]) -> Result<(), StoreError>;
}
