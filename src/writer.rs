//! Buffered metric writer.
//!
//! Decoded measurements are appended to an in-memory queue. A background task
//! wakes every [`TICK_INTERVAL`] and flushes the queue to the [`Backend`] when
//! it holds at least `max_items` points or when it is non-empty and more than
//! `max_wait` passed since the last successful flush.
//!
//! The queue lock is only held to append, to copy the batch and to remove the
//! flushed prefix; the backend call runs without it. A failed flush leaves the
//! queue untouched and the next tick tries again.

use crate::config::BufferConfig;
use crate::measurement::Measurement;
use crate::output::{Backend, BackendError, DataPoint};
use log::{debug, error};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// How often the flush triggers are evaluated.
pub const TICK_INTERVAL: Duration = Duration::from_secs(2);

/// Why a flush was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    Size,
    Time,
}

impl fmt::Display for FlushTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlushTrigger::Size => write!(f, "buffer"),
            FlushTrigger::Time => write!(f, "time"),
        }
    }
}

#[derive(Debug)]
struct Buffer {
    points: Vec<Measurement>,
    last_flush: Instant,
}

/// Handle to the shared buffer. Cloning is cheap; all clones share one queue.
#[derive(Clone)]
pub struct MetricWriter {
    buffer: Arc<Mutex<Buffer>>,
    // Serialises flushes so a batch is never submitted twice
    flushing: Arc<tokio::sync::Mutex<()>>,
    backend: Arc<dyn Backend>,
    config: BufferConfig,
}

impl MetricWriter {
    /// Create a writer. `config` must have passed [`BufferConfig::validate`].
    pub fn new(backend: Arc<dyn Backend>, config: BufferConfig) -> Self {
        MetricWriter {
            buffer: Arc::new(Mutex::new(Buffer {
                points: Vec::new(),
                last_flush: Instant::now(),
            })),
            flushing: Arc::new(tokio::sync::Mutex::new(())),
            backend,
            config,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Buffer> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a measurement to the queue.
    pub fn enqueue(&self, measurement: Measurement) {
        self.lock().points.push(measurement);
    }

    /// Append measurements in order, under a single lock.
    pub fn enqueue_all(&self, measurements: impl IntoIterator<Item = Measurement>) {
        self.lock().points.extend(measurements);
    }

    pub fn len(&self) -> usize {
        self.lock().points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the queued measurements, oldest first.
    pub fn queued(&self) -> Vec<Measurement> {
        self.lock().points.clone()
    }

    /// Which trigger, if any, currently calls for a flush.
    pub fn due(&self) -> Option<FlushTrigger> {
        let buffer = self.lock();
        if buffer.points.len() >= self.config.max_items() {
            Some(FlushTrigger::Size)
        } else if !buffer.points.is_empty() && buffer.last_flush.elapsed() > self.config.max_wait()
        {
            Some(FlushTrigger::Time)
        } else {
            None
        }
    }

    /// Submit everything queued right now as one batch.
    ///
    /// On success the submitted points are removed and the flush time is
    /// recorded; points enqueued while the backend call was running stay
    /// queued. Returns the number of points written.
    pub async fn flush(&self) -> Result<usize, BackendError> {
        let _flushing = self.flushing.lock().await;

        let batch: Vec<DataPoint> = self.lock().points.iter().map(DataPoint::from).collect();
        if batch.is_empty() {
            return Ok(0);
        }

        self.backend.write(&batch).await?;

        let mut buffer = self.lock();
        buffer.points.drain(..batch.len());
        buffer.last_flush = Instant::now();
        Ok(batch.len())
    }

    /// Evaluate the triggers once and flush if one fires.
    pub async fn tick(&self) -> Option<FlushTrigger> {
        let trigger = self.due()?;
        debug!(
            "Buffer has {} items, flushing ({trigger})...",
            self.len()
        );
        match self.flush().await {
            Ok(written) => debug!("Flushed {written} points"),
            Err(e) => error!("Cannot write to the database, keeping {} points: {e}", self.len()),
        }
        Some(trigger)
    }

    /// Spawn the periodic flush task.
    pub fn start(&self) -> JoinHandle<()> {
        let writer = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + TICK_INTERVAL, TICK_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                writer.tick().await;
            }
        })
    }
}

impl fmt::Debug for MetricWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricWriter")
            .field("queued", &self.len())
            .field("config", &self.config)
            .finish()
    }
}
