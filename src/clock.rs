use std::sync::atomic::{AtomicI32, Ordering};

use chrono::{DateTime, Datelike, Local, NaiveDate, NaiveTime, Utc};

/// Source of "today" for enrollment windows and of timestamps for audit entries.
pub trait Clock: Send + Sync {
    /// Calendar date in the institution's local time zone.
    fn today(&self) -> NaiveDate;

    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn today(&self) -> NaiveDate {
        Local::now().date_naive()
    }

    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock pinned to one calendar day, movable with [`FixedClock::set`].
#[derive(Debug)]
pub struct FixedClock {
    days_from_ce: AtomicI32,
}

impl FixedClock {
    pub fn new(today: NaiveDate) -> Self {
        Self {
            days_from_ce: AtomicI32::new(today.num_days_from_ce()),
        }
    }

    pub fn set(&self, today: NaiveDate) {
        self.days_from_ce.store(today.num_days_from_ce(), Ordering::Relaxed);
    }
}

impl Clock for FixedClock {
    fn today(&self) -> NaiveDate {
        NaiveDate::from_num_days_from_ce_opt(self.days_from_ce.load(Ordering::Relaxed))
            .unwrap_or_default()
    }

    fn now(&self) -> DateTime<Utc> {
        self.today().and_time(NaiveTime::default()).and_utc()
    }
}
