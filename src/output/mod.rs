//! Time-series backends for buffered measurements.
//!
//! The writer only depends on the [`Backend`] trait so flushing can be tested
//! without a database. [`influxdb`] provides the production implementation.

pub mod influxdb;

use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

pub use influxdb::DataPoint;

/// Error returned when a batch could not be stored.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    /// Connection or transport level failure
    #[error("HTTP error: {0}")]
    Http(String),
    /// The database answered with a non-success status
    #[error("Backend rejected batch with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// A store that accepts batches of points.
pub trait Backend: Send + Sync {
    /// Submit all `points` as one batch.
    fn write<'a>(
        &'a self,
        points: &'a [DataPoint],
    ) -> Pin<Box<dyn Future<Output = Result<(), BackendError>> + Send + 'a>>;
}
