//! End-to-end behavior of a table through its public handle

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strata_core::chunk::{BincodeSerializer, ChunkMeta, CompressionKind};
use strata_core::kv::StoreBackend;
use strata_core::segment::{FixedSegmentFinder, SegmentFinder, SingleSegmentFinder};
use strata_core::update::{OnFlush, UpdateProgress, WriteStrategy};
use strata_core::{
    Closeable, LiveSegmentMode, Result, StorageConfig, StrataError, TableRegistry, TimeSeriesDb, TimeSeriesValue,
    Timestamp, MAX_TIME, MIN_TIME,
};
use tempfile::TempDir;

/// A bar covering `[start, end]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Bar {
    start: Timestamp,
    end: Timestamp,
    close: f64,
}

impl TimeSeriesValue for Bar {
    fn start_time(&self) -> Timestamp {
        self.start
    }

    fn end_time(&self) -> Timestamp {
        self.end
    }
}

fn bar(end: Timestamp) -> Bar {
    Bar {
        start: end - 5,
        end,
        close: end as f64 / 10.0,
    }
}

fn config(dir: &TempDir) -> StorageConfig {
    StorageConfig {
        data_dir: dir.path().to_path_buf(),
        write_strategy: WriteStrategy::Sequential,
        update_lock_timeout: Duration::from_millis(100),
        delete_lock_timeout: Duration::from_millis(100),
        ..Default::default()
    }
}

fn open_i64(config: StorageConfig, finder: Arc<dyn SegmentFinder<String>>) -> Arc<TimeSeriesDb<String, i64>> {
    TimeSeriesDb::builder("series")
        .config(config)
        .serializer(Arc::new(BincodeSerializer::<i64>::new()))
        .segment_finder(finder)
        .open()
        .unwrap()
}

fn all(db: &TimeSeriesDb<String, i64>, key: &String) -> Vec<i64> {
    db.range_values(key, MIN_TIME, MAX_TIME)
        .unwrap()
        .collect::<Result<_>>()
        .unwrap()
}

#[test]
fn test_yearly_live_segments() {
    let dir = TempDir::new().unwrap();
    let db = open_i64(config(&dir), Arc::new(FixedSegmentFinder::new(1)));
    let key = "asdf".to_string();

    for year in 2000..=2010 {
        db.put_next_live_value(&key, year).unwrap();
    }
    assert_eq!(db.segments(&key).unwrap().len(), 10);

    for i in 1..=10u64 {
        let expected = 2010 - i as i64;
        assert_eq!(db.get_previous_value(&key, 2010, i).unwrap(), Some(expected));
        assert_eq!(db.get_previous_value(&key, MAX_TIME, i).unwrap(), Some(expected));
        assert_eq!(db.get_previous_value(&key, MIN_TIME, i).unwrap(), Some(2000));

        let expected = 2000 + i as i64;
        assert_eq!(db.get_next_value(&key, 2000, i).unwrap(), Some(expected));
        assert_eq!(db.get_next_value(&key, MIN_TIME, i).unwrap(), Some(expected));
        assert_eq!(db.get_next_value(&key, MAX_TIME, i).unwrap(), Some(2010));
    }
    assert_eq!(all(&db, &key), (2000..=2010).collect::<Vec<_>>());
}

#[test]
fn test_bulk_update_flushes_every_batch() {
    let dir = TempDir::new().unwrap();
    let db = open_i64(
        StorageConfig {
            batch_size: 10_000,
            ..config(&dir)
        },
        Arc::new(SingleSegmentFinder),
    );
    let key = "bulk".to_string();

    let mut flushes: Vec<(ChunkMeta, UpdateProgress)> = Vec::new();
    let mut listener = OnFlush(|meta: &ChunkMeta, progress: &UpdateProgress| {
        flushes.push((meta.clone(), *progress));
    });
    let summary = db.update(&key, 0..100_000i64, &mut listener).unwrap();

    assert_eq!(summary.value_count, 100_000);
    assert_eq!(summary.chunk_count, 10);
    assert_eq!(flushes.len(), 10);
    assert_eq!(flushes[9].1.value_count, 100_000);
    assert_eq!(flushes[9].1.max_time, Some(99_999));
    assert_eq!(db.chunks(&key, MIN_TIME).unwrap().len(), 10);

    for boundary in (0..100_000i64).step_by(10_000) {
        for t in [boundary - 1, boundary, boundary + 1] {
            if t < 0 {
                continue;
            }
            for n in [0u64, 1, 9_999, 10_000, 10_001, 35_000] {
                let previous = (t - n as i64).max(0);
                let next = (t + n as i64).min(99_999);
                assert_eq!(db.get_previous_value(&key, t, n).unwrap(), Some(previous));
                assert_eq!(db.get_next_value(&key, t, n).unwrap(), Some(next));
            }
        }
    }
}

#[test]
fn test_chunk_skip_matches_small_and_large_batches() {
    let values: Vec<i64> = (0..3_000).map(|i| i * 7).collect();
    let mut answers = Vec::new();
    for batch_size in [1usize, 13, 10_000] {
        let dir = TempDir::new().unwrap();
        let db = open_i64(
            StorageConfig {
                batch_size,
                ..config(&dir)
            },
            Arc::new(FixedSegmentFinder::new(5_000)),
        );
        let key = "skip".to_string();
        db.update(&key, values.clone(), &mut ()).unwrap();

        let mut results = Vec::new();
        for t in [MIN_TIME, 0, 3, 700, 9_999, 15_000, 20_993, MAX_TIME] {
            for n in [0u64, 1, 12, 13, 14, 400, 2_999, 5_000] {
                results.push(db.get_previous_value(&key, t, n).unwrap());
                results.push(db.get_next_value(&key, t, n).unwrap());
            }
        }
        answers.push(results);
    }
    assert_eq!(answers[0], answers[1]);
    assert_eq!(answers[1], answers[2]);
}

#[test]
fn test_re_update_does_not_duplicate() {
    let dir = TempDir::new().unwrap();
    let finder: Arc<dyn SegmentFinder<String>> = Arc::new(FixedSegmentFinder::new(1_000));
    let once = open_i64(
        StorageConfig {
            batch_size: 64,
            ..config(&dir)
        },
        finder.clone(),
    );
    let key = "dup".to_string();

    once.update(&key, 0..1_500i64, &mut ()).unwrap();
    let second = once.update(&key, 1_000..2_500i64, &mut ()).unwrap();
    assert_eq!(second.skipped, 500);
    assert_eq!(second.value_count, 1_000);
    let twice_values = all(&once, &key);
    let twice_layout = once.chunks(&key, 2_000).unwrap();

    let union_dir = TempDir::new().unwrap();
    let union = open_i64(
        StorageConfig {
            batch_size: 64,
            ..config(&union_dir)
        },
        finder,
    );
    union.update(&key, 0..2_500i64, &mut ()).unwrap();

    assert_eq!(twice_values, all(&union, &key));
    assert_eq!(twice_layout, union.chunks(&key, 2_000).unwrap());
}

#[test]
fn test_segment_transparency() {
    let values: Vec<i64> = (0..400).map(|i| i * 5).collect();
    let windows = [(0, 180), (100, 1_200), (1_510, 1_995), (-50, 5_000), (333, 333)];

    // The same data once fully historical, once with a live tail
    let dir = TempDir::new().unwrap();
    let sealed = open_i64(
        StorageConfig {
            batch_size: 16,
            ..config(&dir)
        },
        Arc::new(FixedSegmentFinder::new(500)),
    );
    let key = "t".to_string();
    sealed.update(&key, values.clone(), &mut ()).unwrap();

    let live_dir = TempDir::new().unwrap();
    let mixed = open_i64(
        StorageConfig {
            batch_size: 16,
            ..config(&live_dir)
        },
        Arc::new(FixedSegmentFinder::new(500)),
    );
    mixed
        .update(&key, values.iter().copied().filter(|v| *v < 1_500), &mut ())
        .unwrap();
    for v in values.iter().copied().filter(|v| *v >= 1_500) {
        mixed.put_next_live_value(&key, v).unwrap();
    }
    assert_eq!(mixed.live_segment(&key).unwrap().map(|(range, _)| range.from), Some(1_500));

    for (from, to) in windows {
        let expected: Vec<i64> = values.iter().copied().filter(|v| *v >= from && *v <= to).collect();
        for db in [&sealed, &mixed] {
            let forward: Vec<i64> = db.range_values(&key, from, to).unwrap().collect::<Result<_>>().unwrap();
            assert_eq!(forward, expected);
            let mut reverse: Vec<i64> = db
                .range_values_reverse(&key, to, from)
                .unwrap()
                .collect::<Result<_>>()
                .unwrap();
            reverse.reverse();
            assert_eq!(reverse, expected);
        }
    }
    for t in [-1, 0, 1_497, 1_500, 1_503, 2_000] {
        for n in [0u64, 1, 2, 50, 500] {
            assert_eq!(
                sealed.get_previous_value(&key, t, n).unwrap(),
                mixed.get_previous_value(&key, t, n).unwrap()
            );
            assert_eq!(
                sealed.get_next_value(&key, t, n).unwrap(),
                mixed.get_next_value(&key, t, n).unwrap()
            );
        }
        assert_eq!(
            sealed.get_latest_value(&key, t).unwrap(),
            mixed.get_latest_value(&key, t).unwrap()
        );
    }
}

#[test]
fn test_interval_values_and_ordering() {
    let dir = TempDir::new().unwrap();
    let db: Arc<TimeSeriesDb<String, Bar>> = TimeSeriesDb::builder("bars")
        .config(StorageConfig {
            batch_size: 4,
            ..config(&dir)
        })
        .serializer(Arc::new(BincodeSerializer::<Bar>::new()))
        .segment_finder(Arc::new(FixedSegmentFinder::new(100)))
        .open()
        .unwrap();
    let key = "bars".to_string();

    db.update(&key, (1..=20).map(|i| bar(i * 5)), &mut ()).unwrap();
    assert_eq!(db.get_latest_value(&key, 52).unwrap(), Some(bar(50)));

    // Starts before the previous bar ended
    let overlapping = Bar {
        start: 99,
        end: 130,
        close: 1.0,
    };
    let err = db.update(&key, vec![overlapping], &mut ()).unwrap_err();
    assert!(matches!(err, StrataError::InvariantViolation(_)));
    assert!(err.is_fatal());

    // The failed update left its marker behind
    let err = db.update(&key, vec![bar(200)], &mut ()).unwrap_err();
    assert!(matches!(err, StrataError::IncompleteUpdate { .. }));

    db.delete_range(&key).unwrap();
    db.update(&key, vec![bar(200)], &mut ()).unwrap();
    assert_eq!(db.get_first_value(&key).unwrap(), Some(bar(200)));
}

#[test]
fn test_empty_update_is_noop() {
    let dir = TempDir::new().unwrap();
    let db = open_i64(config(&dir), Arc::new(SingleSegmentFinder));
    let key = "empty".to_string();

    let summary = db.update(&key, Vec::new(), &mut ()).unwrap();
    assert_eq!(summary.chunk_count, 0);
    assert!(db.is_empty_or_inconsistent(&key).unwrap());
    assert_eq!(db.get_latest_value(&key, 0).unwrap(), None);
    assert!(db.keys().unwrap().is_empty());
}

#[test]
fn test_parallel_update_matches_sequential() {
    let values: Vec<i64> = (0..50_000).collect();
    let mut tables = Vec::new();
    let mut dirs = Vec::new();
    for strategy in [WriteStrategy::Sequential, WriteStrategy::Parallel { workers: 4 }] {
        let dir = TempDir::new().unwrap();
        let db = open_i64(
            StorageConfig {
                batch_size: 1_000,
                write_strategy: strategy,
                compression: CompressionKind::Lz4,
                ..config(&dir)
            },
            Arc::new(FixedSegmentFinder::new(7_000)),
        );
        db.update(&"p".to_string(), values.clone(), &mut ()).unwrap();
        tables.push(db);
        dirs.push(dir);
    }

    let key = "p".to_string();
    assert_eq!(tables[0].segments(&key).unwrap(), tables[1].segments(&key).unwrap());
    assert_eq!(all(&tables[0], &key), all(&tables[1], &key));
}

#[test]
fn test_reader_blocks_bounded_writers_from_another_thread() {
    let dir = TempDir::new().unwrap();
    let db = open_i64(config(&dir), Arc::new(SingleSegmentFinder));
    let key = "locked".to_string();
    db.update(&key, 0..10i64, &mut ()).unwrap();

    let scan = db.range_values(&key, 0, 5).unwrap();
    let writer = {
        let db = db.clone();
        let key = key.clone();
        thread::spawn(move || db.delete_range(&key))
    };
    let err = writer.join().unwrap().unwrap_err();
    assert!(err.is_retryable());

    drop(scan);
    db.delete_range(&key).unwrap();
}

#[test]
fn test_write_through_live_segment_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let config = StorageConfig {
        backend: StoreBackend::Log,
        live_mode: LiveSegmentMode::WriteThrough,
        ..config(&dir)
    };
    let key = "wt".to_string();

    let db = open_i64(config.clone(), Arc::new(FixedSegmentFinder::new(10)));
    for t in 0..25 {
        db.put_next_live_value(&key, t).unwrap();
    }
    db.close().unwrap();

    let db = open_i64(config, Arc::new(FixedSegmentFinder::new(10)));
    assert_eq!(db.keys().unwrap(), vec![key.clone()]);
    assert_eq!(db.live_segment(&key).unwrap().map(|(_, len)| len), Some(5));
    assert_eq!(all(&db, &key), (0..25).collect::<Vec<_>>());
    db.put_next_live_value(&key, 25).unwrap();
    assert_eq!(db.get_last_value(&key).unwrap(), Some(25));
}

#[test]
fn test_registry_closes_open_tables() {
    let dir = TempDir::new().unwrap();
    let registry = TableRegistry::new();
    let open = |name: &str| {
        TimeSeriesDb::<String, i64>::builder(name)
            .config(config(&dir))
            .serializer(Arc::new(BincodeSerializer::<i64>::new()))
            .registry(&registry)
            .open()
            .unwrap()
    };
    let a = open("a");
    let b = open("b");
    assert_eq!(registry.len(), 2);

    b.close().unwrap();
    assert_eq!(registry.len(), 1);

    registry.close_all().unwrap();
    assert!(a.is_closed());
    assert!(registry.is_empty());
    assert!(matches!(a.get_first_value(&"k".to_string()), Err(StrataError::Closed(_))));
}

#[test]
fn test_expired_table_is_purged() {
    let dir = TempDir::new().unwrap();
    let config = StorageConfig {
        max_table_age: Some(Duration::from_millis(500)),
        ..config(&dir)
    };
    let db = open_i64(config, Arc::new(FixedSegmentFinder::new(10)));
    let key = "old".to_string();

    db.update(&key, 0..30i64, &mut ()).unwrap();
    db.put_next_live_value(&key, 35).unwrap();
    let created = db.created().unwrap();
    assert_eq!(db.get_last_value(&key).unwrap(), Some(35));

    thread::sleep(Duration::from_millis(700));

    assert_eq!(db.get_last_value(&key).unwrap(), None);
    assert!(db.keys().unwrap().is_empty());
    assert!(db.created().unwrap() > created);

    db.update(&key, 0..5i64, &mut ()).unwrap();
    assert_eq!(all(&db, &key), (0..5).collect::<Vec<_>>());
}

#[test]
fn test_memory_backend_forgets_on_reopen() {
    let dir = TempDir::new().unwrap();
    let config = StorageConfig {
        backend: StoreBackend::Memory,
        ..config(&dir)
    };
    let key = "m".to_string();

    let db = open_i64(config.clone(), Arc::new(SingleSegmentFinder));
    db.update(&key, 0..100i64, &mut ()).unwrap();
    assert_eq!(db.get_last_value(&key).unwrap(), Some(99));
    db.close().unwrap();

    let db = open_i64(config, Arc::new(SingleSegmentFinder));
    assert_eq!(db.get_last_value(&key).unwrap(), None);
}
