//! Randomized checks of append ordering and shift symmetry

use std::sync::Arc;

use proptest::prelude::*;
use strata_core::chunk::BincodeSerializer;
use strata_core::segment::FixedSegmentFinder;
use strata_core::update::WriteStrategy;
use strata_core::{StorageConfig, TimeSeriesDb};
use tempfile::TempDir;

fn open(dir: &TempDir, batch_size: usize, width: i64) -> Arc<TimeSeriesDb<String, i64>> {
    TimeSeriesDb::builder("prop")
        .config(StorageConfig {
            data_dir: dir.path().to_path_buf(),
            batch_size,
            write_strategy: WriteStrategy::Sequential,
            ..Default::default()
        })
        .serializer(Arc::new(BincodeSerializer::<i64>::new()))
        .segment_finder(Arc::new(FixedSegmentFinder::new(width)))
        .open()
        .unwrap()
}

/// Strictly increasing times built from positive gaps
fn times(gaps: &[i64]) -> Vec<i64> {
    gaps.iter()
        .scan(0i64, |t, gap| {
            *t += gap;
            Some(*t)
        })
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_live_append_rejects_non_increasing(
        gaps in prop::collection::vec(1i64..20, 1..60),
        back in 0i64..40,
    ) {
        let dir = TempDir::new().unwrap();
        let db = open(&dir, 7, 50);
        let key = "k".to_string();
        let values = times(&gaps);
        for t in &values {
            db.put_next_live_value(&key, *t).unwrap();
        }
        let last = *values.last().unwrap();

        let err = db.put_next_live_value(&key, last - back).unwrap_err();
        prop_assert!(err.is_fatal());
        prop_assert_eq!(db.get_last_value(&key).unwrap(), Some(last));
        let stored: Vec<i64> = db
            .range_values(&key, i64::MIN, i64::MAX)
            .unwrap()
            .collect::<strata_core::Result<_>>()
            .unwrap();
        prop_assert_eq!(stored, values);
    }

    #[test]
    fn prop_previous_next_symmetry(
        gaps in prop::collection::vec(1i64..10, 1..200),
        live_share in 0usize..100,
        batch_size in 1usize..40,
        k in 0u64..60,
    ) {
        let dir = TempDir::new().unwrap();
        let db = open(&dir, batch_size, 100);
        let key = "k".to_string();
        let values = times(&gaps);

        // Bulk load whole segments, then feed the rest live
        let split_at = values.len() * live_share / 100;
        let live_from = (values[split_at.min(values.len() - 1)] / 100) * 100;
        let (bulk, live): (Vec<i64>, Vec<i64>) = values.iter().partition(|t| **t < live_from);
        db.update(&key, bulk, &mut ()).unwrap();
        for t in live {
            db.put_next_live_value(&key, t).unwrap();
        }

        let last = values.len() - 1;
        for (i, t) in values.iter().enumerate() {
            let next = (i + k as usize).min(last);
            let previous = i.saturating_sub(k as usize);
            prop_assert_eq!(db.get_next_value(&key, *t, k).unwrap(), Some(values[next]));
            prop_assert_eq!(db.get_previous_value(&key, *t, k).unwrap(), Some(values[previous]));
        }
    }
}
