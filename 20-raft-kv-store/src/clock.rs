use chrono::{DateTime, Utc};

/// Wall-clock source for TTL arithmetic.
///
/// Only the gateway (turning a TTL into an absolute expiration), the
/// expiration scheduler and response rendering read the clock. The apply path
/// never does.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
