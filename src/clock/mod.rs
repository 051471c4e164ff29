use std::fmt;
use std::ops::Add;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::ser::{Serialize, SerializeStruct, Serializer};

/// Wall-clock instant as reported by the probing daemon, in microseconds
/// since the Unix epoch.
///
/// Sample windows (transmit/receive) and object start times all use this
/// type. It deliberately carries no timezone or monotonic component: the
/// values come off the wire and are only ever compared with each other.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const ZERO: Self = Self(0);

    /// Build a timestamp from a `struct timeval`-style pair.
    pub const fn from_parts(sec: u32, usec: u32) -> Self {
        Self(sec as u64 * 1_000_000 + usec as u64)
    }

    pub const fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    /// Current system time.
    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }

    pub fn from_system_time(t: SystemTime) -> Self {
        let since = t.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
        Self(u64::try_from(since.as_micros()).unwrap_or(u64::MAX))
    }

    pub const fn as_micros(self) -> u64 {
        self.0
    }

    pub const fn secs(self) -> u64 {
        self.0 / 1_000_000
    }

    pub const fn subsec_micros(self) -> u32 {
        (self.0 % 1_000_000) as u32
    }

    /// Elapsed time from `earlier` to `self`, saturating at zero.
    pub fn saturating_since(self, earlier: Timestamp) -> Duration {
        Duration::from_micros(self.0.saturating_sub(earlier.0))
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        let micros = u64::try_from(rhs.as_micros()).unwrap_or(u64::MAX);
        Timestamp(self.0.saturating_add(micros))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.secs(), self.subsec_micros())
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut st = serializer.serialize_struct("Timestamp", 2)?;
        st.serialize_field("sec", &self.secs())?;
        st.serialize_field("usec", &self.subsec_micros())?;
        st.end()
    }
}

/// Split a span of whole seconds into hours, minutes and seconds.
pub fn hms(total_secs: u64) -> (u64, u64, u64) {
    let s = total_secs % 60;
    let m = (total_secs / 60) % 60;
    let h = total_secs / 3600;
    (h, m, s)
}
