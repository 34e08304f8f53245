use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Time source behind TTL expiry and time-window checks.
pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Settable clock for tests.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<SystemTime>>,
}

impl ManualClock {
    pub fn at_unix(secs: u64) -> Self {
        Self {
            now: Arc::new(Mutex::new(UNIX_EPOCH + Duration::from_secs(secs))),
        }
    }

    pub fn set_unix(&self, secs: u64) {
        *self.now.lock().unwrap() = UNIX_EPOCH + Duration::from_secs(secs);
    }

    pub fn advance(&self, delta: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += delta;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().unwrap()
    }
}

/// Seconds since the Unix epoch as a float, clamped to zero before it.
pub fn unix_seconds(time: SystemTime) -> f64 {
    time.duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or(0.0)
}

/// Whole seconds since the Unix epoch, clamped to zero before it.
pub fn unix_timestamp(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

/// UTC hour of day for a Unix timestamp.
pub fn utc_hour(unix_secs: u64) -> u8 {
    ((unix_secs / 3600) % 24) as u8
}

/// Day of week for a Unix timestamp, 0 = Sunday.
pub fn utc_weekday(unix_secs: u64) -> u8 {
    ((unix_secs / 86_400 + 4) % 7) as u8
}
