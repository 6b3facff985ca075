//! Presentation timing queue.
//!
//! Turns an unordered, possibly duplicated stream of timestamped units into a
//! strictly increasing, at-most-once output. Units older than the timeout are
//! released on every call so a stalled consumer cannot grow the map.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::constants::{QUEUE_NOMINAL_CAPACITY, QUEUE_TIMEOUT};
use crate::frame::Release;

pub struct TimedUnit<T> {
    pub payload: T,
    pub received_at: Instant,
}

pub struct PresentationQueue<T: Release> {
    units: BTreeMap<i64, TimedUnit<T>>,
    last_presented: Option<i64>,
    timeout: Duration,
    capacity: usize,
    pub presented: u64,
    pub dropped: u64,
    pub late_drops: u64,
    pub timeout_drops: u64,
}

impl<T: Release> PresentationQueue<T> {
    pub fn new() -> Self {
        Self::with_limits(QUEUE_TIMEOUT, QUEUE_NOMINAL_CAPACITY)
    }

    pub fn with_limits(timeout: Duration, capacity: usize) -> Self {
        Self {
            units: BTreeMap::new(),
            last_presented: None,
            timeout,
            capacity: capacity.max(1),
            presented: 0,
            dropped: 0,
            late_drops: 0,
            timeout_drops: 0,
        }
    }

    pub fn insert(&mut self, pts: i64, payload: T) {
        self.insert_at(pts, payload, Instant::now());
    }

    pub(crate) fn insert_at(&mut self, pts: i64, payload: T, now: Instant) {
        self.collect_garbage(now);
        let unit = TimedUnit {
            payload,
            received_at: now,
        };
        if let Some(displaced) = self.units.insert(pts, unit) {
            debug!(pts, "duplicate timestamp, releasing previous unit");
            displaced.payload.release();
            self.dropped += 1;
        }
    }

    /// Presents at most one unit: the smallest key above the last presented one.
    /// Smaller keys met on the way are late and get released.
    pub fn present_next(&mut self) -> Option<(i64, T)> {
        self.present_next_at(Instant::now())
    }

    pub(crate) fn present_next_at(&mut self, now: Instant) -> Option<(i64, T)> {
        self.collect_garbage(now);
        while let Some((pts, unit)) = self.units.pop_first() {
            if self.last_presented.is_some_and(|last| pts <= last) {
                debug!(pts, last = ?self.last_presented, "late unit dropped");
                unit.payload.release();
                self.dropped += 1;
                self.late_drops += 1;
                continue;
            }
            self.last_presented = Some(pts);
            self.presented += 1;
            return Some((pts, unit.payload));
        }
        None
    }

    /// Releases every stored unit. Ordering history is kept.
    pub fn clear(&mut self) -> usize {
        let released = self.units.len();
        for (_, unit) in std::mem::take(&mut self.units) {
            unit.payload.release();
        }
        released
    }

    /// Releases every stored unit and forgets the last presented key.
    pub fn reset(&mut self) -> usize {
        self.last_presented = None;
        self.clear()
    }

    fn collect_garbage(&mut self, now: Instant) {
        let timeout = self.timeout;
        let expired: Vec<i64> = self
            .units
            .iter()
            .filter(|(_, unit)| now.saturating_duration_since(unit.received_at) > timeout)
            .map(|(&pts, _)| pts)
            .collect();
        for pts in expired {
            if let Some(unit) = self.units.remove(&pts) {
                debug!(pts, "unit timed out in presentation queue");
                unit.payload.release();
                self.dropped += 1;
                self.timeout_drops += 1;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn last_presented(&self) -> Option<i64> {
        self.last_presented
    }

    /// Occupancy against the nominal depth, 0-100
    pub fn occupancy_percent(&self) -> f64 {
        (self.units.len() as f64 * 100.0 / self.capacity as f64).min(100.0)
    }
}

impl<T: Release> Default for PresentationQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Release> Drop for PresentationQueue<T> {
    fn drop(&mut self) {
        self.clear();
    }
}
