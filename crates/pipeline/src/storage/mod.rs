//! Storage Layer
//!
//! Durable stores backed by embedded SQLite: the append-only time-series
//! point store and the aggregated-metrics / health-score store. Both keep
//! their connection behind an async mutex for single-writer discipline.

pub mod metrics_store;
pub mod timeseries;

pub use metrics_store::{MetricsStore, MetricsSummary, TrendReport};
pub use timeseries::TimeSeriesStore;

use rusqlite::Connection;

use crate::error::{PipelineError, PipelineResult};

/// Open a connection at `path`, or in memory when no path is configured
pub(crate) fn open_connection(
    path: Option<&std::path::Path>,
) -> PipelineResult<Connection> {
    let conn = match path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            Connection::open(path)?
        }
        None => Connection::open_in_memory()?,
    };

    // WAL keeps readers unblocked during writes; a no-op for :memory:
    conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))
        .map_err(|e| PipelineError::storage("pragma", e.to_string()))?;
    conn.execute("PRAGMA synchronous=NORMAL", [])
        .map_err(|e| PipelineError::storage("pragma", e.to_string()))?;

    Ok(conn)
}
