use std::sync::RwLock;

use chrono::{Days, NaiveDate, NaiveDateTime, Utc};
use chrono_tz::Tz;

/// Organizational wall clock. All "today" and "already started" decisions go
/// through one fixed time zone.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;

    fn today(&self) -> NaiveDate {
        self.now().date()
    }
}

pub struct OrgClock {
    tz: Tz,
}

impl OrgClock {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }
}

impl Clock for OrgClock {
    fn now(&self) -> NaiveDateTime {
        Utc::now().with_timezone(&self.tz).naive_local()
    }
}

/// Manually driven clock for tests and replays.
pub struct FixedClock {
    now: RwLock<NaiveDateTime>,
}

impl FixedClock {
    pub fn new(now: NaiveDateTime) -> Self {
        Self { now: RwLock::new(now) }
    }

    pub fn set(&self, now: NaiveDateTime) {
        if let Ok(mut guard) = self.now.write() {
            *guard = now;
        }
    }

    pub fn advance_days(&self, days: u64) {
        if let Ok(mut guard) = self.now.write()
            && let Some(next) = guard.checked_add_days(Days::new(days))
        {
            *guard = next;
        }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> NaiveDateTime {
        match self.now.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}
