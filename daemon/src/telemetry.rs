//! Hash-rate time series: in-memory, lazily loaded, periodically persisted

use crate::db::Database;
use crate::events::{Event, EventBus};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::{broadcast, oneshot, Notify};
use tracing::{debug, error, info, warn};

/// Stand-in for "no hash rate". Never exactly zero.
pub const FLOOR_RATE: f64 = 1.0 / 10_000.0;

/// Only this trailing window is written back to disk.
pub const MAX_PERSIST_DAYS: i64 = 7;

/// Queries pad with at least this many steps across the span.
const MIN_PAD_DENSITY: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SummaryPoint {
    pub timestamp: DateTime<Utc>,
    pub kilohashes_5s: f64,
    pub hardware_errors: i64,
    pub stale: i64,
}

impl SummaryPoint {
    pub fn placeholder(timestamp: DateTime<Utc>) -> Self {
        Self { timestamp, kilohashes_5s: FLOOR_RATE, hardware_errors: 0, stale: 0 }
    }

    pub fn is_placeholder(&self) -> bool {
        self.kilohashes_5s <= FLOOR_RATE && self.hardware_errors == 0 && self.stale == 0
    }
}

/// Hook for resampling a query result to the requested density.
pub trait DensityPolicy: Send + Sync {
    fn normalize(
        &self,
        points: &mut Vec<SummaryPoint>,
        start: DateTime<Utc>,
        span: Duration,
        density: f64,
    );
}

/// Leaves points untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

impl DensityPolicy for Passthrough {
    fn normalize(&self, _: &mut Vec<SummaryPoint>, _: DateTime<Utc>, _: Duration, _: f64) {}
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error on {path}: {source}")]
    Database {
        path: PathBuf,
        source: rusqlite::Error,
    },
    #[error("failed to create {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("query worker stopped before answering")]
    WorkerGone,
    #[error("query span must be positive")]
    EmptySpan,
}

#[derive(Default)]
struct Series {
    points: Option<Vec<SummaryPoint>>,
    dirty: bool,
}

pub struct TelemetryStore {
    series: Mutex<Series>,
    path: PathBuf,
    save_interval: Option<std::time::Duration>,
    loaded: Notify,
    events: EventBus,
    density: Box<dyn DensityPolicy>,
}

impl TelemetryStore {
    /// `save_interval` of `None` disables the flush timer.
    pub fn new(path: PathBuf, save_interval: Option<std::time::Duration>, events: EventBus) -> Self {
        Self {
            series: Mutex::new(Series::default()),
            path,
            save_interval,
            loaded: Notify::new(),
            events,
            density: Box::new(Passthrough),
        }
    }

    pub fn with_density_policy(mut self, policy: impl DensityPolicy + 'static) -> Self {
        self.density = Box::new(policy);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, Series> {
        self.series.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn loaded<'a>(&self, series: &'a mut Series) -> &'a mut Vec<SummaryPoint> {
        if series.points.is_none() {
            let mut points = self.read_from_disk();
            bridge_outage(&mut points, Utc::now());
            series.points = Some(points);
            series.dirty = false;
            self.loaded.notify_one();
        }
        series.points.get_or_insert_with(Vec::new)
    }

    fn read_from_disk(&self) -> Vec<SummaryPoint> {
        if !self.path.exists() {
            debug!("No telemetry store at {:?}, starting empty", self.path);
            return Vec::new();
        }

        let result = Database::open_existing(&self.path).and_then(|db| db.load_points());
        match result {
            Ok(points) => {
                info!("Loaded {} telemetry points from {:?}", points.len(), self.path);
                points
            }
            Err(e) => {
                let aside = self.path.with_extension("db.corrupt");
                let text = format!(
                    "Telemetry store {} is unreadable ({}); moved to {} and starting empty.",
                    self.path.display(),
                    e,
                    aside.display()
                );
                warn!("{}", text);
                if let Err(e) = std::fs::rename(&self.path, &aside) {
                    error!("Failed to move unreadable store aside: {}", e);
                }
                self.events.message(text);
                Vec::new()
            }
        }
    }

    pub fn add(&self, point: SummaryPoint) {
        let mut series = self.lock();
        self.loaded(&mut series).push(point);
        series.dirty = true;
    }

    pub fn len(&self) -> usize {
        let mut series = self.lock();
        self.loaded(&mut series).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write the trailing window to disk. Returns whether anything was written.
    ///
    /// Failures are reported as a message and leave the series dirty for the next attempt.
    pub fn flush(&self) -> bool {
        match self.try_flush() {
            Ok(written) => written,
            Err(e) => {
                error!("Telemetry flush failed: {}", e);
                self.events.message(format!("Failed to save telemetry: {}", e));
                false
            }
        }
    }

    fn try_flush(&self) -> Result<bool, StoreError> {
        let mut series = self.lock();
        let dirty = series.dirty;
        let Some(points) = series.points.as_mut() else {
            return Ok(false);
        };
        if !dirty || points.is_empty() {
            return Ok(false);
        }

        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)
                .map_err(|source| StoreError::Io { path: dir.to_path_buf(), source })?;
        }

        let cutoff = Utc::now() - Duration::days(MAX_PERSIST_DAYS);
        let window: Vec<SummaryPoint> =
            points.iter().filter(|p| p.timestamp > cutoff).copied().collect();

        let db_err = |source| StoreError::Database { path: self.path.clone(), source };
        let mut db = Database::open(&self.path).map_err(db_err)?;
        db.init_schema().map_err(db_err)?;
        let written = db.replace_points(&window).map_err(db_err)?;

        *points = window;
        series.dirty = false;
        debug!("Flushed {} telemetry points to {:?}", written, self.path);
        Ok(true)
    }

    /// Read the persisted series on a blocking worker.
    pub async fn preload(self: &Arc<Self>) {
        let store = Arc::clone(self);
        if let Err(e) = tokio::task::spawn_blocking(move || store.len()).await {
            error!("Telemetry load task failed: {}", e);
        }
    }

    /// Append every summary point from `events` until the bus closes.
    pub async fn run_ingest(self: Arc<Self>, mut events: broadcast::Receiver<Event>) {
        loop {
            match events.recv().await {
                Ok(Event::Summary { point }) => {
                    let store = Arc::clone(&self);
                    if let Err(e) = tokio::task::spawn_blocking(move || store.add(point)).await {
                        error!("Telemetry ingest task failed: {}", e);
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Telemetry ingest fell behind, dropped {} events", missed);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// Flush every `save_interval`, starting once the series has been loaded.
    pub async fn run_flusher(self: Arc<Self>) {
        let Some(interval) = self.save_interval else {
            info!("Telemetry persistence disabled");
            return;
        };

        self.loaded.notified().await;
        info!("Telemetry flush timer started ({}s)", interval.as_secs());

        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let store = Arc::clone(&self);
            if let Err(e) = tokio::task::spawn_blocking(move || store.flush()).await {
                error!("Telemetry flush task failed: {}", e);
            }
        }
    }

    /// Run a windowed query on a blocking worker; `callback` fires exactly once.
    pub fn query_with<F>(
        self: &Arc<Self>,
        start: DateTime<Utc>,
        span: Duration,
        density: f64,
        callback: F,
    ) where
        F: FnOnce(Vec<SummaryPoint>) + Send + 'static,
    {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            let points = store.window(start, span, density);
            callback(points);
        });
    }

    pub async fn query(
        self: &Arc<Self>,
        start: DateTime<Utc>,
        span: Duration,
        density: f64,
    ) -> Result<Vec<SummaryPoint>, StoreError> {
        if span <= Duration::zero() {
            return Err(StoreError::EmptySpan);
        }
        let (tx, rx) = oneshot::channel();
        self.query_with(start, span, density, move |points| {
            let _ = tx.send(points);
        });
        rx.await.map_err(|_| StoreError::WorkerGone)
    }

    /// Points at or after `start`, padded and time-ordered. Holds the series lock throughout.
    pub fn window(&self, start: DateTime<Utc>, span: Duration, density: f64) -> Vec<SummaryPoint> {
        let mut series = self.lock();
        let points = self.loaded(&mut series);

        let mut data: Vec<SummaryPoint> =
            points.iter().filter(|p| p.timestamp >= start).copied().collect();

        if data.is_empty() {
            data.push(SummaryPoint::placeholder(start + span - Duration::seconds(1)));
            return data;
        }

        self.density.normalize(&mut data, start, span, density);
        prefix_pad(&mut data, start, span, density);
        data.sort_by_key(|p| p.timestamp);
        data
    }
}

/// Mark the time the daemon was not watching as a drop to the floor rate.
fn bridge_outage(points: &mut Vec<SummaryPoint>, outage_end: DateTime<Utc>) {
    if let Some(last) = points.iter().map(|p| p.timestamp).max() {
        points.push(SummaryPoint::placeholder(last + Duration::milliseconds(1)));
        points.push(SummaryPoint::placeholder(outage_end));
    }
}

/// Floor-rate points from `start` up to the first real point, never past `start + span`.
fn prefix_pad(data: &mut Vec<SummaryPoint>, start: DateTime<Utc>, span: Duration, density: f64) {
    let Some(first) = data.iter().map(|p| p.timestamp).min() else {
        return;
    };
    let end = first.min(start + span);
    let step_us = span.num_microseconds().unwrap_or(i64::MAX) as f64 / density.max(MIN_PAD_DENSITY);
    let step = Duration::microseconds(step_us.max(1.0) as i64);

    let mut time = start;
    while time < end {
        data.push(SummaryPoint::placeholder(time));
        time += step;
    }
}
