//! Hard limits enforced at the engine, ledger, account and tenant boundaries.

use std::time::Duration;

/// Courses a student may occupy a seat in at the same time.
pub const MAX_OCCUPIED_PER_STUDENT: usize = 5;

/// Waitlists a student may sit on at the same time.
pub const MAX_WAITING_PER_STUDENT: usize = 3;

/// Waitlist length at which a full course stops admitting waiters.
pub const MAX_WAITERS_PER_COURSE: usize = 10_000;

pub const MAX_ID_LEN: usize = 64;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_EMAIL_LEN: usize = 254;
pub const MIN_PASSWORD_LEN: usize = 6;
pub const MAX_PASSWORD_LEN: usize = 1024;

/// Longest session lifetime; larger configured values are clamped to this.
pub const MAX_SESSION_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

pub const MAX_COURSES_PER_TENANT: usize = 100_000;
pub const MAX_CAPACITY: u32 = 100_000;

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 128;
