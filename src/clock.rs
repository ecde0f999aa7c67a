use chrono::{DateTime, Utc};

/// Time source for the engine. Row timestamps and envelope timestamps both
/// come from here so nothing in the matching path reads ambient time.
#[derive(Debug, Clone, Copy, Default)]
pub struct Clock;

impl Clock {
    pub fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    /// Milliseconds since the Unix epoch, for event envelopes.
    pub fn now_ms(&self) -> i64 {
        self.now().timestamp_millis()
    }
}
