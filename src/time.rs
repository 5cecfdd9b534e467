//! Monotonic time types used by the reactor's delay queue and send-buffer ticker.
use std::sync::atomic;
use std::time::{SystemTime, UNIX_EPOCH};

/// A point in time, measured in milliseconds since the Unix epoch.
///
/// Never goes backwards within a process: [`LocalTime::now`] clamps to the last
/// observed value, which keeps delay-queue deadlines monotonic even if the
/// system clock is stepped backwards underneath us.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Ord, PartialOrd, Default, Hash)]
pub struct LocalTime {
    millis: u128,
}

impl std::fmt::Display for LocalTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_millis())
    }
}

impl LocalTime {
    /// Current time, clamped to be non-decreasing across calls in this process.
    pub fn now() -> Self {
        static LAST: atomic::AtomicU64 = atomic::AtomicU64::new(0);

        let now = Self::from(SystemTime::now()).as_millis();
        let last = LAST.load(atomic::Ordering::SeqCst);

        if now < last as u128 {
            Self::from_millis(last as u128)
        } else {
            // u64 millis overflows in the year 292,277,026,596; truncation is fine.
            LAST.store(now as u64, atomic::Ordering::SeqCst);
            Self::from_millis(now)
        }
    }

    pub const fn from_millis(millis: u128) -> Self {
        Self { millis }
    }

    pub const fn as_millis(&self) -> u128 {
        self.millis
    }

    /// Duration elapsed since an earlier point in time.
    ///
    /// Saturates to zero instead of panicking when `earlier` is actually later,
    /// which can happen transiently around `LocalTime::now`'s clamp.
    pub fn duration_since(&self, earlier: LocalTime) -> LocalDuration {
        LocalDuration::from_millis(self.millis.saturating_sub(earlier.millis))
    }
}

impl From<SystemTime> for LocalTime {
    fn from(system: SystemTime) -> Self {
        let millis = system
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self { millis }
    }
}

impl std::ops::Sub<LocalTime> for LocalTime {
    type Output = LocalDuration;

    fn sub(self, other: LocalTime) -> LocalDuration {
        self.duration_since(other)
    }
}

impl std::ops::Add<LocalDuration> for LocalTime {
    type Output = LocalTime;

    fn add(self, other: LocalDuration) -> LocalTime {
        LocalTime {
            millis: self.millis + other.0,
        }
    }
}

/// A duration, as measured by [`LocalTime`].
#[derive(Debug, Copy, Clone, PartialOrd, Ord, PartialEq, Eq, Default)]
pub struct LocalDuration(u128);

impl LocalDuration {
    pub const ZERO: LocalDuration = Self::from_millis(0);

    pub const fn from_millis(millis: u128) -> Self {
        Self(millis)
    }

    pub const fn from_secs(secs: u64) -> Self {
        Self::from_millis(secs as u128 * 1000)
    }

    pub const fn as_millis(&self) -> u128 {
        self.0
    }

    pub const fn as_secs(&self) -> u64 {
        (self.0 / 1000) as u64
    }
}

impl std::fmt::Display for LocalDuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", std::time::Duration::from(*self))
    }
}

impl From<LocalDuration> for std::time::Duration {
    fn from(other: LocalDuration) -> Self {
        std::time::Duration::from_millis(other.0 as u64)
    }
}

impl From<std::time::Duration> for LocalDuration {
    fn from(other: std::time::Duration) -> Self {
        Self::from_millis(other.as_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_is_monotonic() {
        let a = LocalTime::now();
        let b = LocalTime::now();
        assert!(b >= a);
    }

    #[test]
    fn duration_since_saturates() {
        let a = LocalTime::from_millis(10);
        let b = LocalTime::from_millis(5);
        assert_eq!(a.duration_since(b), LocalDuration::from_millis(5));
        assert_eq!(b.duration_since(a), LocalDuration::ZERO);
    }
}
