//! Storage contracts consumed by the engine, and the implementations behind them.

mod audit;
mod ledger;

pub use audit::{JsonlAuditLog, MemoryAuditLog};
pub use ledger::Ledger;

use async_trait::async_trait;

use crate::model::{AuditEntry, Course, CourseId, Student, StudentId};

#[derive(Debug)]
pub enum StoreError {
    /// Targeted update against a course that does not exist.
    CourseNotFound(CourseId),
    /// Create-only insert hit an existing key (course id, student id or email).
    AlreadyExists(String),
    Invalid(&'static str),
    LimitExceeded(&'static str),
    Wal(String),
    Io(std::io::Error),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::CourseNotFound(id) => write!(f, "course not found: {id}"),
            StoreError::AlreadyExists(key) => write!(f, "already exists: {key}"),
            StoreError::Invalid(msg) => write!(f, "invalid record: {msg}"),
            StoreError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            StoreError::Wal(e) => write!(f, "WAL error: {e}"),
            StoreError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e)
    }
}

/// Per-course capacity, occupants and waitlist.
///
/// `occupants`+`occupancy` and `waiters` are independently writable: an implementation must
/// never let a write to one clobber a concurrent write to the other.
#[async_trait]
pub trait CapacityStore: Send + Sync {
    async fn get(&self, course_id: &str) -> Result<Option<Course>, StoreError>;

    /// Atomically append `student_id` to the occupants and bump occupancy, if and only if
    /// occupancy is below `capacity` and the student is not already an occupant at the
    /// instant of application. `Ok(false)` is a normal outcome, not an error.
    async fn compare_and_reserve(
        &self,
        course_id: &str,
        student_id: &str,
        capacity: u32,
    ) -> Result<bool, StoreError>;

    /// Overwrite occupants and occupancy, but only while the current occupants still equal
    /// `expected` (the list the caller read). `Ok(false)` means another writer got there
    /// first and nothing was written.
    async fn replace_occupants(
        &self,
        course_id: &str,
        expected: &[StudentId],
        occupants: Vec<StudentId>,
        occupancy: u32,
    ) -> Result<bool, StoreError>;

    async fn append_waiter(&self, course_id: &str, student_id: &str) -> Result<(), StoreError>;

    /// Overwrite the waitlist while it still equals `expected`; `Ok(false)` otherwise.
    async fn replace_waiters(
        &self,
        course_id: &str,
        expected: &[StudentId],
        waiters: Vec<StudentId>,
    ) -> Result<bool, StoreError>;
}

/// Student records. `save` overwrites the whole record.
#[async_trait]
pub trait RequesterStore: Send + Sync {
    async fn get(&self, student_id: &str) -> Result<Option<Student>, StoreError>;

    async fn save(&self, student: &Student) -> Result<(), StoreError>;

    /// Create-only insert; fails with `AlreadyExists` on a taken id or email.
    async fn insert(&self, student: &Student) -> Result<(), StoreError>;

    async fn find_by_email(&self, email: &str) -> Result<Option<Student>, StoreError>;
}

/// Append-only activity log.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, entry: &AuditEntry) -> Result<(), StoreError>;
}

/// Append to the audit sink without failing the caller. Failures are logged and counted.
pub async fn record_audit(sink: &dyn AuditSink, entry: AuditEntry) {
    if let Err(e) = sink.append(&entry).await {
        metrics::counter!(crate::observability::AUDIT_FAILURES_TOTAL).increment(1);
        tracing::warn!(
            student = %entry.student_id,
            action = entry.action.as_str(),
            "audit append failed: {e}"
        );
    }
}
