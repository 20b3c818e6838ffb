//! Trade tick value type and a synthetic tick generator

use rand::Rng;
use serde::{Deserialize, Serialize};
use strata_core::{TimeSeriesValue, Timestamp};

/// One trade
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    /// Trade time in milliseconds since the epoch
    pub time: Timestamp,
    pub price: f64,
    pub volume: u64,
}

impl TimeSeriesValue for Tick {
    fn start_time(&self) -> Timestamp {
        self.time
    }
}

/// Random walk of ticks at a fixed spacing
pub struct TickGenerator<R> {
    rng: R,
    next_time: Timestamp,
    interval: i64,
    price: f64,
    remaining: u64,
}

impl<R: Rng> TickGenerator<R> {
    pub fn new(rng: R, start: Timestamp, interval: i64, count: u64) -> Self {
        Self {
            rng,
            next_time: start,
            interval: interval.max(1),
            price: 100.0,
            remaining: count,
        }
    }
}

impl<R: Rng> Iterator for TickGenerator<R> {
    type Item = Tick;

    fn next(&mut self) -> Option<Tick> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let drift: f64 = self.rng.gen_range(-0.001..0.001);
        self.price = (self.price * (1.0 + drift)).max(0.01);
        let tick = Tick {
            time: self.next_time,
            price: (self.price * 100.0).round() / 100.0,
            volume: self.rng.gen_range(1..=500),
        };
        self.next_time = self.next_time.saturating_add(self.interval);
        Some(tick)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.remaining as usize;
        (remaining, Some(remaining))
    }
}
