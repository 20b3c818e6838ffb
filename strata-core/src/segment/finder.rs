//! Segment boundary policies

use crate::{TimeRange, Timestamp, MAX_TIME, MIN_TIME};
use chrono::{Datelike, NaiveDate, TimeZone, Utc};

/// Maps a timestamp of a key to the segment it belongs to
pub trait SegmentFinder<K>: Send + Sync {
    /// The inclusive segment range containing `time`
    fn segment_of(&self, key: &K, time: Timestamp) -> TimeRange;

    /// End of the newest segment that may already be historical when a value
    /// at `next_time` arrives. Defaults to the segment just before the one
    /// containing `next_time`.
    fn last_available_segment_to(&self, key: &K, next_time: Timestamp) -> Option<Timestamp> {
        self.segment_of(key, next_time).from.checked_sub(1)
    }
}

/// Segments of a fixed width, aligned to `origin`
#[derive(Debug, Clone, Copy)]
pub struct FixedSegmentFinder {
    width: i64,
    origin: Timestamp,
}

impl FixedSegmentFinder {
    /// Width must be positive
    pub fn new(width: i64) -> Self {
        Self::with_origin(width, 0)
    }

    pub fn with_origin(width: i64, origin: Timestamp) -> Self {
        Self {
            width: width.max(1),
            origin,
        }
    }
}

impl<K> SegmentFinder<K> for FixedSegmentFinder {
    fn segment_of(&self, _key: &K, time: Timestamp) -> TimeRange {
        let width = self.width as i128;
        let offset = (time as i128 - self.origin as i128).div_euclid(width);
        let from = self.origin as i128 + offset * width;
        let to = from + width - 1;
        TimeRange::new(clamp(from), clamp(to))
    }
}

fn clamp(value: i128) -> Timestamp {
    value.clamp(MIN_TIME as i128, MAX_TIME as i128) as Timestamp
}

/// Calendar periods in UTC
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalendarUnit {
    Day,
    Month,
    Year,
}

/// Segments aligned to UTC calendar periods; timestamps are milliseconds
#[derive(Debug, Clone, Copy)]
pub struct CalendarSegmentFinder {
    unit: CalendarUnit,
}

impl CalendarSegmentFinder {
    pub fn new(unit: CalendarUnit) -> Self {
        Self { unit }
    }

    fn period(&self, time: Timestamp) -> Option<(NaiveDate, NaiveDate)> {
        let date = Utc.timestamp_millis_opt(time).single()?.date_naive();
        match self.unit {
            CalendarUnit::Day => Some((date, date.succ_opt()?)),
            CalendarUnit::Month => {
                let start = NaiveDate::from_ymd_opt(date.year(), date.month(), 1)?;
                let next = if date.month() == 12 {
                    NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)?
                } else {
                    NaiveDate::from_ymd_opt(date.year(), date.month() + 1, 1)?
                };
                Some((start, next))
            }
            CalendarUnit::Year => Some((
                NaiveDate::from_ymd_opt(date.year(), 1, 1)?,
                NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)?,
            )),
        }
    }
}

fn start_millis(date: NaiveDate) -> Option<Timestamp> {
    let naive = date.and_hms_opt(0, 0, 0)?;
    Some(Utc.from_utc_datetime(&naive).timestamp_millis())
}

impl<K> SegmentFinder<K> for CalendarSegmentFinder {
    fn segment_of(&self, _key: &K, time: Timestamp) -> TimeRange {
        self.period(time)
            .and_then(|(start, next)| Some(TimeRange::new(start_millis(start)?, start_millis(next)? - 1)))
            .unwrap_or_else(TimeRange::all)
    }
}

/// One segment spanning all time
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleSegmentFinder;

impl<K> SegmentFinder<K> for SingleSegmentFinder {
    fn segment_of(&self, _key: &K, _time: Timestamp) -> TimeRange {
        TimeRange::all()
    }
}
