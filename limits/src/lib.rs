#![forbid(unsafe_code)]
#![deny(
    dead_code,
    unused_imports,
    unused_mut,
    missing_docs,
    missing_debug_implementations
)]

//! Local sliding windows rate limiting with temporary bans.
//!
//! Every key (usually a client IP) is tracked over three trailing windows:
//! one minute, one hour and one day. Hitting the ceiling of any window bans
//! the key for a fixed duration. Whitelisted keys are never counted.

/// Implement the rate-limiter on the `axum` library.
#[cfg(feature = "axum")]
pub mod axum;
mod clock;

pub use clock::{Clock, ManualClock, SystemClock};

use dashmap::DashMap;
use std::{
    collections::{HashSet, VecDeque},
    fmt,
    sync::Arc,
    time::{Duration, SystemTime},
};

/// Trailing windows tracked for every key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Window {
    /// Last 60 seconds.
    Minute,
    /// Last 3600 seconds.
    Hour,
    /// Last 86400 seconds.
    Day,
}

impl Window {
    /// Windows in the order they are checked.
    pub const ALL: [Window; 3] = [Window::Minute, Window::Hour, Window::Day];

    /// Length of the window.
    pub fn duration(self) -> Duration {
        match self {
            Window::Minute => Duration::from_secs(60),
            Window::Hour => Duration::from_secs(60 * 60),
            Window::Day => Duration::from_secs(60 * 60 * 24),
        }
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Window::Minute => "minute",
            Window::Hour => "hour",
            Window::Day => "day",
        })
    }
}

/// Request ceilings for each window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Maximum requests during the last minute.
    pub per_minute: usize,
    /// Maximum requests during the last hour.
    pub per_hour: usize,
    /// Maximum requests during the last day.
    pub per_day: usize,
}

impl Limits {
    /// Ceiling of a given window.
    pub fn of(&self, window: Window) -> usize {
        match window {
            Window::Minute => self.per_minute,
            Window::Hour => self.per_hour,
            Window::Day => self.per_day,
        }
    }
}

/// Why a request went through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allowance {
    /// The limiter is turned off.
    Disabled,
    /// The key is whitelisted and was not counted.
    Whitelisted,
    /// The request was recorded in every window.
    Counted,
}

/// Why a request was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Denial {
    /// The key is serving an earlier ban.
    Banned {
        /// End of the ban.
        until: SystemTime,
        /// Time left before the ban ends.
        remaining: Duration,
    },
    /// The request would have exceeded a window; the key is now banned.
    Exceeded {
        /// Window whose ceiling was reached.
        window: Window,
        /// Ceiling of that window.
        limit: usize,
        /// End of the new ban.
        until: SystemTime,
    },
}

impl fmt::Display for Denial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Denial::Banned { remaining, .. } => {
                write!(f, "IP banned for another {} seconds", remaining.as_secs())
            },
            Denial::Exceeded { window, limit, .. } => {
                write!(f, "Rate limit exceeded: {limit} requests per {window}")
            },
        }
    }
}

/// Outcome of [`RateLimiter::check`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Let the request through.
    Allowed(Allowance),
    /// Refuse the request.
    Denied(Denial),
}

impl Decision {
    /// Whether the request may proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed(_))
    }
}

/// Snapshot of a key's counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpStats {
    /// The key.
    pub ip: String,
    /// Requests counted during the last minute.
    pub requests_minute: usize,
    /// Requests counted during the last hour.
    pub requests_hour: usize,
    /// Requests counted during the last day.
    pub requests_day: usize,
    /// End of the active ban, if any.
    pub banned_until: Option<SystemTime>,
    /// Whether the key bypasses the limiter.
    pub whitelisted: bool,
}

#[derive(Debug, Default)]
struct Windows {
    minute: VecDeque<SystemTime>,
    hour: VecDeque<SystemTime>,
    day: VecDeque<SystemTime>,
}

impl Windows {
    fn queue(&self, window: Window) -> &VecDeque<SystemTime> {
        match window {
            Window::Minute => &self.minute,
            Window::Hour => &self.hour,
            Window::Day => &self.day,
        }
    }

    fn queue_mut(&mut self, window: Window) -> &mut VecDeque<SystemTime> {
        match window {
            Window::Minute => &mut self.minute,
            Window::Hour => &mut self.hour,
            Window::Day => &mut self.day,
        }
    }

    fn prune(&mut self, now: SystemTime) {
        for window in Window::ALL {
            let length = window.duration();
            let queue = self.queue_mut(window);

            while let Some(time) = queue.front() {
                if now.duration_since(*time).unwrap_or_default() > length {
                    queue.pop_front();
                } else {
                    break;
                }
            }
        }
    }

    fn record(&mut self, now: SystemTime) {
        for window in Window::ALL {
            self.queue_mut(window).push_back(now);
        }
    }

    fn is_empty(&self) -> bool {
        self.day.is_empty()
    }
}

/// Multi-window limiter.
#[derive(Debug)]
pub struct RateLimiter {
    enabled: bool,
    limits: Limits,
    ban_duration: Duration,
    whitelist: HashSet<String>,
    entries: DashMap<String, Windows>,
    bans: DashMap<String, SystemTime>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a new enabled rate limiter with an empty whitelist.
    ///
    /// # Example
    /// ```rust
    /// use lexica_limits::{Limits, RateLimiter};
    /// use std::time::Duration;
    ///
    /// let limits = Limits { per_minute: 1, per_hour: 5, per_day: 10 };
    /// let limiter = RateLimiter::new(limits, Duration::from_secs(300));
    ///
    /// assert!(limiter.check("10.0.0.1").is_allowed());
    /// assert!(!limiter.check("10.0.0.1").is_allowed());
    /// ```
    pub fn new(limits: Limits, ban_duration: Duration) -> Self {
        RateLimiter {
            enabled: true,
            limits,
            ban_duration,
            whitelist: HashSet::new(),
            entries: DashMap::new(),
            bans: DashMap::new(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Turn the limiter on or off.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Keys that are never limited.
    pub fn whitelist<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.whitelist = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Replace the time source.
    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Whether the limiter is active.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// How long a key stays banned after a violation.
    pub fn ban_duration(&self) -> Duration {
        self.ban_duration
    }

    /// Decide whether a request from `key` may proceed, and count it if so.
    pub fn check(&self, key: &str) -> Decision {
        if !self.enabled {
            return Decision::Allowed(Allowance::Disabled);
        }

        if self.whitelist.contains(key) {
            return Decision::Allowed(Allowance::Whitelisted);
        }

        let now = self.clock.now();

        if let Some(until) = self.bans.get(key).map(|ban| *ban.value()) {
            if let Ok(remaining) = until.duration_since(now) {
                if !remaining.is_zero() {
                    return Decision::Denied(Denial::Banned { until, remaining });
                }
            }

            self.bans.remove(key);
        }

        let mut windows = self.entries.entry(key.to_owned()).or_default();
        windows.prune(now);

        let exceeded = Window::ALL
            .into_iter()
            .find(|window| windows.queue(*window).len() >= self.limits.of(*window));

        match exceeded {
            Some(window) => {
                drop(windows);
                let until = self.ban(key, now);

                Decision::Denied(Denial::Exceeded {
                    window,
                    limit: self.limits.of(window),
                    until,
                })
            },
            None => {
                windows.record(now);
                Decision::Allowed(Allowance::Counted)
            },
        }
    }

    fn ban(&self, key: &str, now: SystemTime) -> SystemTime {
        let until = now + self.ban_duration;
        self.bans.insert(key.to_owned(), until);

        tracing::warn!(
            key,
            ban_seconds = self.ban_duration.as_secs(),
            "key banned after exceeding rate limit"
        );

        until
    }

    /// Counters of a key. Old timestamps are pruned first.
    pub fn stats(&self, key: &str) -> IpStats {
        let now = self.clock.now();

        let (requests_minute, requests_hour, requests_day) =
            match self.entries.get_mut(key) {
                Some(mut windows) => {
                    windows.prune(now);
                    (windows.minute.len(), windows.hour.len(), windows.day.len())
                },
                None => (0, 0, 0),
            };

        IpStats {
            ip: key.to_owned(),
            requests_minute,
            requests_hour,
            requests_day,
            banned_until: self
                .bans
                .get(key)
                .map(|ban| *ban.value())
                .filter(|until| *until > now),
            whitelisted: self.whitelist.contains(key),
        }
    }

    /// Keys currently serving a ban, with the end of each ban.
    pub fn banned(&self) -> Vec<(String, SystemTime)> {
        let now = self.clock.now();

        self.bans
            .iter()
            .filter(|ban| *ban.value() > now)
            .map(|ban| (ban.key().clone(), *ban.value()))
            .collect()
    }

    /// Forget idle keys and expired bans.
    pub fn sweep(&self) {
        let now = self.clock.now();

        self.bans.retain(|_, until| *until > now);
        self.entries.retain(|_, windows| {
            windows.prune(now);
            !windows.is_empty()
        });
    }

    /// Reset all values from the limiter.
    pub fn reset(&self) {
        self.entries.clear();
        self.bans.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IP: &str = "0.0.0.0";
    const OTHER_IP: &str = "1.1.1.1";

    fn limiter(clock: &Arc<ManualClock>) -> RateLimiter {
        let limits = Limits {
            per_minute: 2,
            per_hour: 3,
            per_day: 4,
        };

        RateLimiter::new(limits, Duration::from_secs(300)).clock(Arc::clone(clock))
    }

    #[test]
    fn test_minute_window() {
        let clock = Arc::new(ManualClock::default());
        let limiter = limiter(&clock);

        assert!(limiter.check(IP).is_allowed());
        assert!(limiter.check(IP).is_allowed());

        match limiter.check(IP) {
            Decision::Denied(denial @ Denial::Exceeded { window, limit, .. }) => {
                assert_eq!(window, Window::Minute);
                assert_eq!(limit, 2);
                assert_eq!(
                    denial.to_string(),
                    "Rate limit exceeded: 2 requests per minute"
                );
            },
            other => panic!("unexpected decision: {other:?}"),
        }

        // Banned for 300 seconds, even once the minute window is empty again.
        clock.advance(Duration::from_secs(120));
        match limiter.check(IP) {
            Decision::Denied(Denial::Banned { remaining, .. }) => {
                assert_eq!(remaining, Duration::from_secs(180))
            },
            other => panic!("unexpected decision: {other:?}"),
        }

        clock.advance(Duration::from_secs(180));
        assert!(limiter.check(IP).is_allowed());
    }

    #[test]
    fn test_hour_and_day_windows() {
        let clock = Arc::new(ManualClock::default());
        let limiter = limiter(&clock);

        for _ in 0..3 {
            assert!(limiter.check(IP).is_allowed());
            clock.advance(Duration::from_secs(61));
        }

        match limiter.check(IP) {
            Decision::Denied(Denial::Exceeded { window, .. }) => {
                assert_eq!(window, Window::Hour)
            },
            other => panic!("unexpected decision: {other:?}"),
        }

        // After the ban and the hour expire, only the day window remembers.
        clock.advance(Duration::from_secs(60 * 60));
        assert!(limiter.check(IP).is_allowed());

        match limiter.check(IP) {
            Decision::Denied(Denial::Exceeded { window, limit, .. }) => {
                assert_eq!(window, Window::Day);
                assert_eq!(limit, 4);
            },
            other => panic!("unexpected decision: {other:?}"),
        }
    }

    #[test]
    fn test_entry_exactly_one_window_old_still_counts() {
        let cases = [
            (Window::Minute, Limits { per_minute: 2, per_hour: 10, per_day: 10 }),
            (Window::Hour, Limits { per_minute: 10, per_hour: 2, per_day: 10 }),
            (Window::Day, Limits { per_minute: 10, per_hour: 10, per_day: 2 }),
        ];

        for (expected, limits) in cases {
            let clock = Arc::new(ManualClock::default());
            let limiter = RateLimiter::new(limits, Duration::from_secs(300))
                .clock(Arc::clone(&clock));

            assert!(limiter.check(IP).is_allowed());
            clock.advance(expected.duration());
            assert!(limiter.check(IP).is_allowed());

            match limiter.check(IP) {
                Decision::Denied(Denial::Exceeded { window, .. }) => {
                    assert_eq!(window, expected)
                },
                other => panic!("unexpected decision for {expected}: {other:?}"),
            }
        }
    }

    #[test]
    fn test_multiple_entries() {
        let clock = Arc::new(ManualClock::default());
        let limiter = limiter(&clock);

        // only IP is limited.
        assert!(limiter.check(IP).is_allowed());
        assert!(limiter.check(OTHER_IP).is_allowed());
        assert!(limiter.check(IP).is_allowed());
        assert!(!limiter.check(IP).is_allowed());
        assert!(limiter.check(OTHER_IP).is_allowed());
    }

    #[test]
    fn test_whitelist_and_disabled() {
        let clock = Arc::new(ManualClock::default());
        let limiter = limiter(&clock).whitelist([IP]);

        for _ in 0..10 {
            assert_eq!(
                limiter.check(IP),
                Decision::Allowed(Allowance::Whitelisted)
            );
        }
        assert_eq!(limiter.stats(IP).requests_day, 0);
        assert!(limiter.stats(IP).whitelisted);

        let limiter = self::limiter(&clock).enabled(false);
        for _ in 0..10 {
            assert_eq!(
                limiter.check(OTHER_IP),
                Decision::Allowed(Allowance::Disabled)
            );
        }
    }

    #[test]
    fn test_stats_and_banned() {
        let clock = Arc::new(ManualClock::default());
        let limiter = limiter(&clock);

        limiter.check(IP);
        clock.advance(Duration::from_secs(90));
        limiter.check(IP);

        let stats = limiter.stats(IP);
        assert_eq!(stats.requests_minute, 1);
        assert_eq!(stats.requests_hour, 2);
        assert_eq!(stats.requests_day, 2);
        assert_eq!(stats.banned_until, None);

        limiter.check(IP);
        assert!(!limiter.check(IP).is_allowed());

        let banned = limiter.banned();
        assert_eq!(banned.len(), 1);
        assert_eq!(banned[0].0, IP);
        assert_eq!(limiter.stats(IP).banned_until, Some(banned[0].1));

        clock.advance(Duration::from_secs(301));
        assert!(limiter.banned().is_empty());
    }

    #[test]
    fn test_sweep() {
        let clock = Arc::new(ManualClock::default());
        let limiter = limiter(&clock);

        limiter.check(IP);
        clock.advance(Duration::from_secs(60 * 60 * 24 + 1));
        limiter.sweep();

        assert_eq!(limiter.stats(IP).requests_day, 0);
        assert!(limiter.entries.is_empty());
    }
}
