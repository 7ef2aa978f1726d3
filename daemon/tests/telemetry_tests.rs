use chrono::{Duration, DurationRound, Utc};
use minerguard_daemon::db::Database;
use minerguard_daemon::events::{Event, EventBus};
use minerguard_daemon::telemetry::{
    DensityPolicy, StoreError, SummaryPoint, TelemetryStore, FLOOR_RATE,
};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

fn point(minutes_ago: i64, rate: f64) -> SummaryPoint {
    let now = Utc::now().duration_trunc(Duration::milliseconds(1)).unwrap();
    SummaryPoint {
        timestamp: now - Duration::minutes(minutes_ago),
        kilohashes_5s: rate,
        hardware_errors: 1,
        stale: 0,
    }
}

fn store_at(dir: &TempDir) -> (PathBuf, TelemetryStore) {
    let path = dir.path().join("GraphData").join("datastore.db");
    let store = TelemetryStore::new(path.clone(), Some(std::time::Duration::from_secs(60)), EventBus::default());
    (path, store)
}

#[test]
fn test_flush_then_reload_bridges_outage() {
    let dir = TempDir::new().unwrap();
    let (path, store) = store_at(&dir);
    let points: Vec<_> = (0..5).map(|i| point(50 - i * 10, 300.0 + i as f64)).collect();
    for p in &points {
        store.add(*p);
    }
    assert!(store.flush());
    assert!(path.exists());

    let (_, reloaded) = store_at(&dir);
    assert_eq!(reloaded.len(), points.len() + 2);

    let window = reloaded.window(Utc::now() - Duration::hours(2), Duration::hours(2), 1000.0);
    let data: Vec<_> = window.iter().filter(|p| !p.is_placeholder()).collect();
    assert_eq!(data.len(), 5);
    assert_eq!(data[0].kilohashes_5s, 300.0);
    assert_eq!(data[4].timestamp, points[4].timestamp);

    let tail: Vec<_> = window.iter().rev().take(2).collect();
    assert!(tail.iter().all(|p| p.kilohashes_5s == FLOOR_RATE));
    assert_eq!(tail[1].timestamp, points[4].timestamp + Duration::milliseconds(1));
}

#[test]
fn test_flush_keeps_only_last_seven_days() {
    let dir = TempDir::new().unwrap();
    let (path, store) = store_at(&dir);
    store.add(point(8 * 24 * 60, 250.0));
    store.add(point(5, 260.0));
    assert!(store.flush());
    assert_eq!(store.len(), 1);

    let db = Database::open(&path).unwrap();
    assert_eq!(db.count_points().unwrap(), 1);
}

#[test]
fn test_flush_without_changes_writes_nothing() {
    let dir = TempDir::new().unwrap();
    let (path, store) = store_at(&dir);
    assert!(!store.flush());
    assert_eq!(store.len(), 0);
    assert!(!store.flush());
    assert!(!path.exists());

    store.add(point(1, 100.0));
    assert!(store.flush());
    assert!(!store.flush());
}

#[test]
fn test_unreadable_store_is_moved_aside() {
    let dir = TempDir::new().unwrap();
    let (path, _) = store_at(&dir);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, vec![b'x'; 4096]).unwrap();

    let events = EventBus::default();
    let mut rx = events.subscribe();
    let store = TelemetryStore::new(path.clone(), None, events);

    assert!(store.is_empty());
    assert!(!path.exists());
    assert!(path.with_extension("db.corrupt").exists());
    assert!(matches!(rx.try_recv(), Ok(Event::Message { .. })));

    store.add(point(1, 100.0));
    assert!(store.flush());
    assert_eq!(Database::open(&path).unwrap().count_points().unwrap(), 1);
}

#[test]
fn test_failed_flush_keeps_points_for_retry() {
    let dir = TempDir::new().unwrap();
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, b"not a directory").unwrap();

    let events = EventBus::default();
    let mut rx = events.subscribe();
    let store = TelemetryStore::new(blocker.join("datastore.db"), None, events);
    store.add(point(1, 100.0));

    assert!(!store.flush());
    assert_eq!(store.len(), 1);
    assert!(matches!(rx.try_recv(), Ok(Event::Message { text }) if text.starts_with("Failed to save telemetry")));

    std::fs::remove_file(&blocker).unwrap();
    assert!(store.flush());
}

#[tokio::test]
async fn test_query_empty_store_returns_single_placeholder() {
    let dir = TempDir::new().unwrap();
    let (_, store) = store_at(&dir);
    let store = Arc::new(store);

    let start = Utc::now() - Duration::hours(1);
    let span = Duration::hours(1);
    let points = store.query(start, span, 500.0).await.unwrap();

    assert_eq!(points.len(), 1);
    assert_eq!(points[0].timestamp, start + span - Duration::seconds(1));
    assert_eq!(points[0].kilohashes_5s, FLOOR_RATE);
}

#[tokio::test]
async fn test_query_pads_before_first_point() {
    let dir = TempDir::new().unwrap();
    let (_, store) = store_at(&dir);
    let store = Arc::new(store);

    let start = Utc::now().duration_trunc(Duration::seconds(1)).unwrap() - Duration::hours(1);
    let span = Duration::hours(1);
    // outside the window
    store.add(SummaryPoint { timestamp: start - Duration::minutes(1), ..point(0, 999.0) });
    store.add(SummaryPoint { timestamp: start + Duration::minutes(30), ..point(0, 320.0) });

    // density below 100 pads every span / 100 = 36s
    let points = store.query(start, span, 10.0).await.unwrap();
    assert_eq!(points.len(), 51);
    assert_eq!(points[0].timestamp, start);
    assert_eq!(points[1].timestamp, start + Duration::seconds(36));
    assert!(points.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    assert_eq!(points.last().unwrap().kilohashes_5s, 320.0);
    assert!(points[..50].iter().all(SummaryPoint::is_placeholder));
}

#[tokio::test]
async fn test_query_callback_runs_once() {
    let dir = TempDir::new().unwrap();
    let (_, store) = store_at(&dir);
    let store = Arc::new(store);
    store.add(point(5, 280.0));

    let (tx, rx) = tokio::sync::oneshot::channel();
    store.query_with(Utc::now() - Duration::hours(1), Duration::hours(1), 800.0, move |points| {
        tx.send(points.len()).unwrap();
    });
    assert!(rx.await.unwrap() > 1);
}

#[test]
fn test_concurrent_adds_are_all_kept() {
    let dir = TempDir::new().unwrap();
    let (_, store) = store_at(&dir);
    let store = Arc::new(store);

    let writers: Vec<_> = (0..4)
        .map(|_| {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for i in 0..250 {
                    store.add(point(i % 60, 100.0));
                }
            })
        })
        .collect();
    let reader = {
        let store = Arc::clone(&store);
        std::thread::spawn(move || {
            for _ in 0..50 {
                store.window(Utc::now() - Duration::hours(1), Duration::hours(1), 800.0);
            }
        })
    };

    for w in writers {
        w.join().unwrap();
    }
    reader.join().unwrap();
    assert_eq!(store.len(), 1000);
}

#[tokio::test]
async fn test_disabled_persistence_never_flushes() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("datastore.db");
    let store = Arc::new(TelemetryStore::new(path.clone(), None, EventBus::default()));
    store.add(point(1, 100.0));

    // returns immediately when there is no save interval
    Arc::clone(&store).run_flusher().await;
    assert!(!path.exists());
}

/// Keeps every other point.
struct Halve;

impl DensityPolicy for Halve {
    fn normalize(&self, points: &mut Vec<SummaryPoint>, _: chrono::DateTime<Utc>, _: Duration, _: f64) {
        let mut keep = false;
        points.retain(|_| {
            keep = !keep;
            keep
        });
    }
}

#[test]
fn test_density_policy_runs_before_padding() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("datastore.db");
    let store = TelemetryStore::new(path, None, EventBus::default()).with_density_policy(Halve);

    let start = Utc::now() - Duration::minutes(10);
    for i in 0..6 {
        store.add(SummaryPoint { timestamp: start + Duration::minutes(i), ..point(0, 200.0) });
    }

    let window = store.window(start, Duration::minutes(10), 800.0);
    assert_eq!(window.len(), 3);
    assert!(window.iter().all(|p| !p.is_placeholder()));
}

#[tokio::test]
async fn test_query_padding_is_bounded_by_span() {
    let dir = TempDir::new().unwrap();
    let (_, store) = store_at(&dir);
    let store = Arc::new(store);
    store.add(point(0, 300.0));

    // a one-second window a day before the only point
    let points = store.query(Utc::now() - Duration::days(1), Duration::seconds(1), 800.0).await.unwrap();
    assert_eq!(points.len(), 801);
    assert_eq!(points.last().unwrap().kilohashes_5s, 300.0);
}

#[tokio::test]
async fn test_query_rejects_empty_span() {
    let dir = TempDir::new().unwrap();
    let (_, store) = store_at(&dir);
    let store = Arc::new(store);
    store.add(point(0, 300.0));

    let result = store.query(Utc::now() - Duration::days(1), Duration::zero(), 800.0).await;
    assert!(matches!(result, Err(StoreError::EmptySpan)));
}
