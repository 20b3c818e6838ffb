//! Live-segmented cache
//!
//! One per key. Historical values always precede live values, so every
//! read either goes to one side or walks the historical side first and
//! continues into the live side (reversed for backward reads).

use crate::chunk::ValueSerializer;
use crate::live::{LiveJournal, LiveSegment};
use crate::segment::{HistoricalRange, HistoricalSegmentTable, SegmentFinder};
use crate::types::Shifted;
use crate::update::{TimeSeriesUpdater, UpdateListener, UpdateSummary};
use crate::{Result, SeriesKey, StrataError, TimeRange, TimeSeriesValue, Timestamp};
use std::ops::Range;
use std::sync::Arc;
use tracing::{debug, warn};

/// Live and historical state of one key
pub struct LiveSegmentedCache<K, V> {
    key: K,
    table: Arc<HistoricalSegmentTable<K, V>>,
    finder: Arc<dyn SegmentFinder<K>>,
    /// Serializer of the live journal; `None` keeps live values in memory only
    journal_serializer: Option<Arc<dyn ValueSerializer<V>>>,
    live: Option<LiveSegment<K, V>>,
}

impl<K: SeriesKey, V: TimeSeriesValue> LiveSegmentedCache<K, V> {
    /// Open the cache of `key`, restoring a journaled live segment if any
    pub fn open(
        key: K,
        table: Arc<HistoricalSegmentTable<K, V>>,
        finder: Arc<dyn SegmentFinder<K>>,
        journal_serializer: Option<Arc<dyn ValueSerializer<V>>>,
    ) -> Result<Self> {
        let mut cache = Self {
            key,
            table,
            finder,
            journal_serializer,
            live: None,
        };
        if let Some(journal) = cache.journal() {
            let journaled = journal.load()?;
            if let Some((first, _)) = journaled.first() {
                let segment = cache.finder.segment_of(&cache.key, *first);
                if cache.table.segment(&cache.key, segment.from)?.is_some() {
                    // Sealed before the journal was cleared
                    warn!(
                        "Dropping live journal of {:?}: segment {} is already stored",
                        cache.key, segment
                    );
                    journal.clear()?;
                } else {
                    let live = LiveSegment::restore(cache.key.clone(), segment, journal)?;
                    debug!("Restored live segment {} of {:?}", segment, cache.key);
                    cache.live = Some(live);
                }
            }
        }
        Ok(cache)
    }

    fn journal(&self) -> Option<LiveJournal<V>> {
        self.journal_serializer.as_ref().map(|serializer| {
            LiveJournal::new(self.table.store().clone(), &self.key.hash_key(), serializer.clone())
        })
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn table(&self) -> &HistoricalSegmentTable<K, V> {
        &self.table
    }

    pub fn live(&self) -> Option<&LiveSegment<K, V>> {
        self.live.as_ref()
    }

    /// Start of the live segment
    pub fn live_from(&self) -> Option<Timestamp> {
        self.live.as_ref().map(|live| live.segment().from)
    }

    pub(crate) fn live_value(&self, index: usize) -> Option<V> {
        self.live.as_ref().and_then(|live| live.get(index)).cloned()
    }

    pub fn get_first_value(&self) -> Result<Option<V>> {
        match self.table.get_first_value(&self.key)? {
            Some(value) => Ok(Some(value)),
            None => Ok(self.live.as_ref().and_then(|live| live.get_first_value()).cloned()),
        }
    }

    pub fn get_last_value(&self) -> Result<Option<V>> {
        match self.live.as_ref().and_then(|live| live.get_last_value()) {
            Some(value) => Ok(Some(value.clone())),
            None => self.table.get_last_value(&self.key),
        }
    }

    /// Last value with `end_time <= t`, else the first value
    pub fn get_latest_value(&self, t: Timestamp) -> Result<Option<V>> {
        if let Some(live) = &self.live {
            if let Some(index) = live.floor_index(t) {
                return Ok(live.get(index).cloned());
            }
        }
        match self.table.get_latest_value(&self.key, t)? {
            Some(value) => Ok(Some(value)),
            None => self.get_first_value(),
        }
    }

    /// The value `n` positions before the last value with `end_time <= t`,
    /// clamped to the first value
    pub fn get_previous_value(&self, t: Timestamp, n: u64) -> Result<Option<V>> {
        if let Some(live) = &self.live {
            if let Some(anchor) = live.floor_index(t) {
                return match live.shift_back(anchor, n) {
                    Shifted::Found(index) => Ok(live.get(index).cloned()),
                    // One step past the first live value is the last stored value
                    Shifted::Exhausted { remaining } => match self.table.nth_from_last(&self.key, remaining - 1)? {
                        Shifted::Found(value) => Ok(Some(value)),
                        Shifted::Exhausted { .. } => self.get_first_value(),
                    },
                };
            }
        }
        match self.table.shift_back_from(&self.key, t, n)? {
            Some(Shifted::Found(value)) => Ok(Some(value)),
            _ => self.get_first_value(),
        }
    }

    /// The value `n` positions after the first value with `end_time >= t`,
    /// clamped to the last value
    pub fn get_next_value(&self, t: Timestamp, n: u64) -> Result<Option<V>> {
        if let Some(live) = &self.live {
            if t >= live.segment().from {
                return Ok(live.get_next_value(t, n).cloned());
            }
        }
        match self.table.shift_forward_from(&self.key, t, n)? {
            Some(Shifted::Found(value)) => Ok(Some(value)),
            Some(Shifted::Exhausted { remaining }) => match &self.live {
                Some(live) if !live.is_empty() => match live.shift_forward(0, remaining - 1) {
                    Shifted::Found(index) => Ok(live.get(index).cloned()),
                    Shifted::Exhausted { .. } => Ok(live.get_last_value().cloned()),
                },
                _ => self.get_last_value(),
            },
            None => match &self.live {
                Some(live) => Ok(live.get_next_value(t, n).cloned()),
                None => self.get_last_value(),
            },
        }
    }

    /// Append a value to the live segment, sealing the current live segment
    /// first when the value belongs to a later one
    pub fn put_next_live_value(&mut self, value: V) -> Result<()> {
        let next = value.end_time();
        let start = value.start_time();
        if next < start {
            return Err(StrataError::InvariantViolation(format!(
                "Value of {:?} ends at {} before it starts at {}",
                self.key, next, start
            )));
        }
        let prev_end = match self.live.as_ref().and_then(|live| live.last_key()) {
            Some(last) => Some(last),
            None => self.table.last_time(&self.key)?,
        };
        if let Some(prev) = prev_end {
            if start < prev {
                return Err(StrataError::InvariantViolation(format!(
                    "Value of {:?} starting at {} overlaps previous value ending at {}",
                    self.key, start, prev
                )));
            }
        }
        let segment = self.finder.segment_of(&self.key, next);
        if !segment.contains(next) {
            return Err(StrataError::InvariantViolation(format!(
                "Segment finder placed {} in {}",
                next, segment
            )));
        }
        let last_available = self.finder.last_available_segment_to(&self.key, next);
        if let Some(last_to) = last_available {
            if last_to >= segment.from && last_to != segment.to {
                return Err(StrataError::InvariantViolation(format!(
                    "Historical data of {:?} may reach {} inside live segment {}",
                    self.key, last_to, segment
                )));
            }
        }

        if let Some(live) = &self.live {
            let current = live.segment();
            if next > current.to {
                if last_available.map_or(true, |to| to < current.to) {
                    return Err(StrataError::InvariantViolation(format!(
                        "Live segment {} of {:?} cannot be sealed: historical data ends at {:?}",
                        current, self.key, last_available
                    )));
                }
                live.convert_to_historical(&self.table)?;
                self.live = None;
            } else if segment != current {
                return Err(StrataError::InvariantViolation(format!(
                    "Live segment {} requested for {:?} while {} is live",
                    segment, self.key, current
                )));
            }
        }

        match &mut self.live {
            Some(live) => live.put_next_live_value(next, value),
            None => {
                if let Some(stored) = self.table.last_segment(&self.key)? {
                    if stored.range.to >= segment.from {
                        return Err(StrataError::InvariantViolation(format!(
                            "Live segment {} of {:?} overlaps stored segment {}",
                            segment, self.key, stored.range
                        )));
                    }
                }
                let mut live = LiveSegment::new(self.key.clone(), segment, self.journal());
                live.put_next_live_value(next, value)?;
                debug!("Opened live segment {} of {:?}", segment, self.key);
                self.live = Some(live);
                Ok(())
            }
        }
    }

    /// Bulk load `source` below the live segment
    pub fn update<I, L>(&mut self, source: I, listener: &mut L) -> Result<UpdateSummary>
    where
        I: IntoIterator<Item = V>,
        L: UpdateListener,
    {
        let live_from = self.live_from();
        TimeSeriesUpdater::new(&self.table, &self.key).update(source, self.finder.as_ref(), live_from, listener)
    }

    /// Drop every live and historical value of the key
    pub fn delete_range(&mut self) -> Result<()> {
        if let Some(live) = &self.live {
            live.discard()?;
        }
        self.live = None;
        self.table.delete_range(&self.key)
    }

    /// Forget the live segment without touching stored data
    pub(crate) fn reset_live(&mut self) -> Result<()> {
        if let Some(live) = self.live.take() {
            live.discard()?;
        }
        Ok(())
    }

    /// Split a range query into its historical scan and live index range.
    ///
    /// For reverse scans `from` is the upper bound.
    pub(crate) fn plan_range(
        &self,
        from: Timestamp,
        to: Timestamp,
        reverse: bool,
    ) -> Result<(Option<HistoricalRange<V>>, Range<usize>)> {
        let (lo, hi) = if reverse { (to, from) } else { (from, to) };
        if lo > hi {
            return Ok((None, 0..0));
        }

        let live = match &self.live {
            Some(live) => live,
            None => return Ok((Some(self.historical_range(lo, hi, reverse)?), 0..0)),
        };
        let live_from = live.segment().from;
        let historical = if lo < live_from {
            Some(self.historical_range(lo, hi.min(live_from - 1), reverse)?)
        } else {
            None
        };
        let live_indices = if hi >= live_from {
            live.range_indices(lo.max(live_from), hi)
        } else {
            0..0
        };
        Ok((historical, live_indices))
    }

    fn historical_range(&self, lo: Timestamp, hi: Timestamp, reverse: bool) -> Result<HistoricalRange<V>> {
        if reverse {
            self.table.range_values_reverse(&self.key, hi, lo)
        } else {
            self.table.range_values(&self.key, lo, hi)
        }
    }

    /// Segments of the key, oldest first, with the live one last
    pub fn segment_ranges(&self) -> Result<Vec<TimeRange>> {
        let mut ranges: Vec<TimeRange> = self.table.segments(&self.key)?.iter().map(|s| s.range).collect();
        ranges.extend(self.live.as_ref().map(|live| live.segment()));
        Ok(ranges)
    }
}
