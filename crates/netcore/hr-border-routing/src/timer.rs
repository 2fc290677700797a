//! Deadline bookkeeping for the sans-io state machines.
//!
//! Nothing here sleeps: a `Timer` only remembers when it should fire, and
//! the owner polls it with the current time.

use std::time::{Duration, Instant};

use rand::Rng;

/// Longest delay any timer is armed for (2^31 ms, about 24.8 days).
pub const MAX_TIMER_DELAY: Duration = Duration::from_millis((1 << 31) - 1);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timer {
    fire_at: Option<Instant>,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self, now: Instant, delay: Duration) {
        self.fire_at = Some(now + delay.min(MAX_TIMER_DELAY));
    }

    pub fn fire_at(&mut self, time: Instant) {
        self.fire_at = Some(time);
    }

    /// Arms the timer at `time` unless it is already due earlier.
    pub fn fire_at_if_earlier(&mut self, time: Instant) {
        match self.fire_at {
            Some(current) if current <= time => {}
            _ => self.fire_at = Some(time),
        }
    }

    /// Arms the timer from a `NextFireTime`, or stops it if nothing is pending.
    pub fn fire_at_next(&mut self, next: &NextFireTime) {
        self.fire_at = next.get();
    }

    pub fn stop(&mut self) {
        self.fire_at = None;
    }

    pub fn is_running(&self) -> bool {
        self.fire_at.is_some()
    }

    pub fn fire_time(&self) -> Option<Instant> {
        self.fire_at
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        matches!(self.fire_at, Some(t) if t <= now)
    }

    /// Stops the timer and reports whether it was due.
    pub fn take_expired(&mut self, now: Instant) -> bool {
        if self.is_expired(now) {
            self.fire_at = None;
            true
        } else {
            false
        }
    }
}

/// Tracks the earliest of a set of candidate deadlines.
#[derive(Debug, Clone, Copy)]
pub struct NextFireTime {
    now: Instant,
    next: Option<Instant>,
}

impl NextFireTime {
    pub fn new(now: Instant) -> Self {
        Self { now, next: None }
    }

    pub fn now(&self) -> Instant {
        self.now
    }

    pub fn update_if_earlier(&mut self, time: Instant) {
        let time = time.max(self.now);
        self.next = Some(match self.next {
            Some(current) => current.min(time),
            None => time,
        });
    }

    pub fn update_opt(&mut self, time: Option<Instant>) {
        if let Some(time) = time {
            self.update_if_earlier(time);
        }
    }

    pub fn get(&self) -> Option<Instant> {
        self.next
    }
}

/// Earliest of two optional deadlines.
pub fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

/// Returns a uniformly random duration in `[value - jitter, value + jitter]`.
pub fn add_jitter(value: Duration, jitter: Duration) -> Duration {
    let jitter = jitter.min(value);
    let low = (value - jitter).as_millis() as u64;
    let high = (value + jitter).as_millis() as u64;
    Duration::from_millis(rand::rng().random_range(low..=high))
}

/// Returns a uniformly random duration in `[0, max]`.
pub fn random_delay(max: Duration) -> Duration {
    Duration::from_millis(rand::rng().random_range(0..=max.as_millis() as u64))
}

/// Expiration of something updated at `update` that lives `lifetime` seconds,
/// clamped to the longest supported timer delay.
pub fn clamped_expiration(update: Instant, lifetime: u32) -> Instant {
    update + Duration::from_secs(lifetime as u64).min(MAX_TIMER_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fire_at_if_earlier_keeps_earliest() {
        let now = Instant::now();
        let mut timer = Timer::new();

        timer.fire_at_if_earlier(now + Duration::from_secs(10));
        timer.fire_at_if_earlier(now + Duration::from_secs(20));
        assert_eq!(timer.fire_time(), Some(now + Duration::from_secs(10)));

        timer.fire_at_if_earlier(now + Duration::from_secs(5));
        assert_eq!(timer.fire_time(), Some(now + Duration::from_secs(5)));
    }

    #[test]
    fn test_take_expired() {
        let now = Instant::now();
        let mut timer = Timer::new();
        timer.start(now, Duration::from_millis(100));

        assert!(!timer.take_expired(now));
        assert!(timer.take_expired(now + Duration::from_millis(100)));
        assert!(!timer.is_running());
    }

    #[test]
    fn test_next_fire_time_never_before_now() {
        let now = Instant::now() + Duration::from_secs(60);
        let mut next = NextFireTime::new(now);
        next.update_if_earlier(now - Duration::from_secs(30));
        assert_eq!(next.get(), Some(now));
    }

    #[test]
    fn test_add_jitter_range() {
        for _ in 0..200 {
            let value = add_jitter(Duration::from_secs(16), Duration::from_secs(2));
            assert!(value >= Duration::from_secs(14));
            assert!(value <= Duration::from_secs(18));
        }
    }

    #[test]
    fn test_clamped_expiration() {
        let now = Instant::now();
        assert_eq!(clamped_expiration(now, 10), now + Duration::from_secs(10));
        assert_eq!(clamped_expiration(now, u32::MAX), now + MAX_TIMER_DELAY);
    }
}
