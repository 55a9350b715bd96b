use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Traffic accounting category. `PeerPayload` counts block data only and is
/// a subset of `PeerProtocol`, so totals must skip it to avoid double
/// counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrafficCategory {
    PeerProtocol,
    PeerPayload,
    TrackerHttp,
    TrackerUdp,
    Dht,
}

impl TrafficCategory {
    pub const ALL: [TrafficCategory; 5] = [
        TrafficCategory::PeerProtocol,
        TrafficCategory::PeerPayload,
        TrafficCategory::TrackerHttp,
        TrafficCategory::TrackerUdp,
        TrafficCategory::Dht,
    ];

    pub fn counts_in_totals(&self) -> bool {
        !matches!(self, TrafficCategory::PeerPayload)
    }

    pub fn name(&self) -> &'static str {
        match self {
            TrafficCategory::PeerProtocol => "peer:protocol",
            TrafficCategory::PeerPayload => "peer:payload",
            TrafficCategory::TrackerHttp => "tracker:http",
            TrafficCategory::TrackerUdp => "tracker:udp",
            TrafficCategory::Dht => "dht",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Down,
    Up,
}

/// Byte-per-second pacing primitive with lazy refill.
#[derive(Debug)]
pub struct TokenBucket {
    rate: u64,
    capacity: u64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(rate: u64, capacity: u64, now: Instant) -> Self {
        Self {
            rate,
            capacity,
            tokens: capacity as f64,
            last_refill: now,
        }
    }

    pub fn rate(&self) -> u64 {
        self.rate
    }

    pub fn set_rate(&mut self, rate: u64, capacity: u64, now: Instant) {
        self.refill(now);
        self.rate = rate;
        self.capacity = capacity;
        self.tokens = self.tokens.min(capacity as f64);
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.last_refill = now;
        self.tokens =
            (self.tokens + elapsed.as_secs_f64() * self.rate as f64).min(self.capacity as f64);
    }

    /// Take `amount` tokens if available after refill.
    pub fn try_consume(&mut self, amount: u64, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= amount as f64 {
            self.tokens -= amount as f64;
            true
        } else {
            false
        }
    }

    /// Milliseconds until a consume of `amount` can succeed. Zero when it
    /// would succeed right now.
    pub fn ms_until_available(&mut self, amount: u64, now: Instant) -> u64 {
        self.refill(now);
        let deficit = amount as f64 - self.tokens;
        if deficit <= 0.0 {
            return 0;
        }
        if self.rate == 0 {
            return u64::MAX;
        }
        (deficit * 1000.0 / self.rate as f64).ceil() as u64
    }
}

const FINE_BUCKET_MS: u64 = 1_000;
const FINE_SLOTS: usize = 120;
const COARSE_BUCKET_MS: u64 = 30_000;
const COARSE_SLOTS: usize = 240;

#[derive(Debug, Clone, Copy, Default)]
struct Sample {
    bucket: u64,
    bytes: u64,
}

#[derive(Debug)]
struct Ring {
    bucket_ms: u64,
    slots: Vec<Sample>,
}

impl Ring {
    fn new(bucket_ms: u64, len: usize) -> Self {
        Self {
            bucket_ms,
            slots: vec![Sample::default(); len],
        }
    }

    fn record(&mut self, at_ms: u64, bytes: u64) {
        let bucket = at_ms / self.bucket_ms;
        let len = self.slots.len() as u64;
        let slot = &mut self.slots[(bucket % len) as usize];
        if slot.bucket != bucket {
            // slot belongs to a previous revolution
            *slot = Sample { bucket, bytes: 0 };
        }
        slot.bytes += bytes;
    }

    fn sum_since(&self, from_ms: u64, now_ms: u64) -> u64 {
        let from_bucket = from_ms / self.bucket_ms;
        let now_bucket = now_ms / self.bucket_ms;
        self.slots
            .iter()
            .filter(|s| s.bucket >= from_bucket && s.bucket <= now_bucket)
            .map(|s| s.bytes)
            .sum()
    }

    fn span_ms(&self) -> u64 {
        self.bucket_ms * self.slots.len() as u64
    }

    fn samples(&self, from_ms: u64, to_ms: u64, out: &mut HashMap<u64, u64>) {
        let from_bucket = from_ms / self.bucket_ms;
        let to_bucket = to_ms / self.bucket_ms;
        for slot in &self.slots {
            if slot.bucket >= from_bucket && slot.bucket <= to_bucket {
                *out.entry(slot.bucket * self.bucket_ms).or_default() += slot.bytes;
            }
        }
    }
}

/// Rolling byte counters for one category/direction: a fine ring covering
/// the last two minutes and a coarse ring covering the last two hours.
#[derive(Debug)]
pub struct RrdHistory {
    fine: Ring,
    coarse: Ring,
}

impl RrdHistory {
    pub fn new() -> Self {
        Self {
            fine: Ring::new(FINE_BUCKET_MS, FINE_SLOTS),
            coarse: Ring::new(COARSE_BUCKET_MS, COARSE_SLOTS),
        }
    }

    pub fn record(&mut self, at_ms: u64, bytes: u64) {
        self.fine.record(at_ms, bytes);
        self.coarse.record(at_ms, bytes);
    }

    /// Average bytes per second over the trailing window.
    pub fn rate(&self, window_ms: u64, now_ms: u64) -> u64 {
        let window_ms = window_ms.max(1);
        let from_ms = now_ms.saturating_sub(window_ms);
        let ring = if window_ms <= self.fine.span_ms() {
            &self.fine
        } else {
            &self.coarse
        };
        ring.sum_since(from_ms, now_ms) * 1000 / window_ms
    }

    fn collect(&self, from_ms: u64, to_ms: u64, max_points: usize, out: &mut HashMap<u64, u64>) {
        let needed_resolution = (to_ms.saturating_sub(from_ms)) / max_points.max(1) as u64;
        let ring = if needed_resolution <= FINE_BUCKET_MS && from_ms + self.fine.span_ms() >= to_ms
        {
            &self.fine
        } else {
            &self.coarse
        };
        ring.samples(from_ms, to_ms, out);
    }
}

impl Default for RrdHistory {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-torrent traffic meter over every [`TrafficCategory`].
#[derive(Debug)]
pub struct BandwidthTracker {
    start: Instant,
    histories: HashMap<(TrafficCategory, Direction), RrdHistory>,
}

impl BandwidthTracker {
    pub fn new(start: Instant) -> Self {
        Self {
            start,
            histories: HashMap::new(),
        }
    }

    fn ms(&self, at: Instant) -> u64 {
        at.saturating_duration_since(self.start).as_millis() as u64
    }

    pub fn record(
        &mut self,
        category: TrafficCategory,
        direction: Direction,
        bytes: u64,
        at: Instant,
    ) {
        let at_ms = self.ms(at);
        self.histories
            .entry((category, direction))
            .or_default()
            .record(at_ms, bytes);
    }

    pub fn category_rate(
        &self,
        category: TrafficCategory,
        direction: Direction,
        window: Duration,
        now: Instant,
    ) -> u64 {
        let now_ms = self.ms(now);
        self.histories
            .get(&(category, direction))
            .map_or(0, |h| h.rate(window.as_millis() as u64, now_ms))
    }

    /// Total rate across categories, excluding `peer:payload` which is
    /// already inside `peer:protocol`.
    pub fn rate(&self, direction: Direction, window: Duration, now: Instant) -> u64 {
        TrafficCategory::ALL
            .iter()
            .filter(|c| c.counts_in_totals())
            .map(|c| self.category_rate(*c, direction, window, now))
            .sum()
    }

    /// Bucketed samples for UI graphs, aggregated over `categories` and
    /// sorted by time. At most `max_points` points are returned.
    pub fn samples(
        &self,
        direction: Direction,
        categories: &[TrafficCategory],
        from: Instant,
        to: Instant,
        max_points: usize,
    ) -> Vec<(u64, u64)> {
        let from_ms = self.ms(from);
        let to_ms = self.ms(to);
        let mut merged: HashMap<u64, u64> = HashMap::new();
        for category in categories {
            if let Some(history) = self.histories.get(&(*category, direction)) {
                history.collect(from_ms, to_ms, max_points, &mut merged);
            }
        }
        let mut points: Vec<(u64, u64)> = merged.into_iter().collect();
        points.sort_unstable_by_key(|(ts, _)| *ts);
        if points.len() > max_points {
            points.truncate(max_points);
        }
        points
    }
}

#[cfg(test)]
mod test {
    use std::time::{Duration, Instant};

    use super::{BandwidthTracker, Direction, RrdHistory, TokenBucket, TrafficCategory};

    #[test]
    fn bucket_consume_and_refill() {
        let t0 = Instant::now();
        let mut bucket = TokenBucket::new(1000, 1000, t0);
        assert!(bucket.try_consume(600, t0));
        assert!(bucket.try_consume(400, t0));
        assert!(!bucket.try_consume(1, t0));
        // half a second refills 500 tokens
        let t1 = t0 + Duration::from_millis(500);
        assert!(bucket.try_consume(500, t1));
        assert!(!bucket.try_consume(1, t1));
    }

    #[test]
    fn bucket_exact_capacity() {
        let t0 = Instant::now();
        let mut bucket = TokenBucket::new(1000, 1000, t0);
        // a bucket holding exactly `rate` tokens accepts a consume of `rate`
        assert!(bucket.try_consume(1000, t0));
    }

    #[test]
    fn bucket_delay_estimate() {
        let t0 = Instant::now();
        let mut bucket = TokenBucket::new(1000, 2000, t0);
        assert_eq!(bucket.ms_until_available(2000, t0), 0);
        assert!(bucket.try_consume(2000, t0));
        assert_eq!(bucket.ms_until_available(500, t0), 500);
        assert_eq!(bucket.ms_until_available(1, t0), 1);
        let t1 = t0 + Duration::from_millis(500);
        assert_eq!(bucket.ms_until_available(500, t1), 0);
    }

    #[test]
    fn bucket_never_exceeds_capacity() {
        let t0 = Instant::now();
        let mut bucket = TokenBucket::new(1000, 1000, t0);
        let t1 = t0 + Duration::from_secs(100);
        assert!(bucket.try_consume(1000, t1));
        assert!(!bucket.try_consume(500, t1));
    }

    #[test]
    fn history_rate_window() {
        let mut history = RrdHistory::new();
        history.record(1_000, 5_000);
        history.record(2_000, 5_000);
        history.record(3_500, 10_000);
        // 10 second window sees all 20 KB
        assert_eq!(history.rate(10_000, 4_000), 2_000);
        // 2 second window starting at 4s sees only the last two buckets
        assert_eq!(history.rate(2_000, 4_000), 7_500);
    }

    #[test]
    fn history_old_buckets_expire() {
        let mut history = RrdHistory::new();
        history.record(0, 1_000);
        // the same slot two minutes later must not include the old sample
        history.record(120_000, 500);
        assert_eq!(history.rate(5_000, 121_000), 100);
    }

    #[test]
    fn totals_exclude_payload() {
        let t0 = Instant::now();
        let mut tracker = BandwidthTracker::new(t0);
        let at = t0 + Duration::from_secs(1);
        tracker.record(TrafficCategory::PeerProtocol, Direction::Down, 10_000, at);
        tracker.record(TrafficCategory::PeerPayload, Direction::Down, 9_000, at);
        tracker.record(TrafficCategory::TrackerUdp, Direction::Down, 100, at);
        let now = t0 + Duration::from_secs(2);
        let window = Duration::from_secs(10);
        assert_eq!(tracker.rate(Direction::Down, window, now), 1_010);
        assert_eq!(
            tracker.category_rate(TrafficCategory::PeerPayload, Direction::Down, window, now),
            900
        );
        assert_eq!(tracker.rate(Direction::Up, window, now), 0);
    }

    #[test]
    fn samples_are_sorted_and_bounded() {
        let t0 = Instant::now();
        let mut tracker = BandwidthTracker::new(t0);
        for i in 0..20u64 {
            tracker.record(
                TrafficCategory::PeerProtocol,
                Direction::Up,
                100,
                t0 + Duration::from_secs(i),
            );
        }
        let points = tracker.samples(
            Direction::Up,
            &[TrafficCategory::PeerProtocol],
            t0,
            t0 + Duration::from_secs(20),
            5,
        );
        assert!(points.len() <= 5);
        assert!(points.windows(2).all(|w| w[0].0 < w[1].0));
    }
}
