mod enroll;
mod error;
mod promotion;
mod release;

pub use error::{EngineError, ErrorKind, Membership};

use std::sync::Arc;

use tracing::warn;

use crate::clock::Clock;
use crate::model::*;
use crate::store::{AuditSink, CapacityStore, RequesterStore, record_audit};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnrollOutcome {
    Enrolled,
    /// 1-based position in the waitlist at the time of joining.
    Waitlisted { position: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropOutcome {
    /// Seat released; `promoted` is the waiter that took it, if any.
    Dropped { promoted: Option<StudentId> },
    OptedOut,
}

/// Enrollment and waitlist orchestration.
///
/// Holds no state of its own and takes no engine-wide lock: concurrent calls are safe because
/// seat allocation goes through `CapacityStore::compare_and_reserve`, which is the only
/// linearization point. List rewrites are conditional on the list the engine read, and are
/// retried against a fresh read when another writer changed it first.
pub struct Engine {
    courses: Arc<dyn CapacityStore>,
    students: Arc<dyn RequesterStore>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
}

impl Engine {
    pub fn new(
        courses: Arc<dyn CapacityStore>,
        students: Arc<dyn RequesterStore>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            courses,
            students,
            audit,
            clock,
        }
    }

    async fn load_student(&self, student_id: &str) -> Result<Student, EngineError> {
        self.students
            .get(student_id)
            .await?
            .ok_or_else(|| EngineError::StudentNotFound(student_id.to_string()))
    }

    async fn load_course(&self, course_id: &str) -> Result<Course, EngineError> {
        self.courses
            .get(course_id)
            .await?
            .ok_or_else(|| EngineError::CourseNotFound(course_id.to_string()))
    }

    async fn record(&self, student_id: &str, action: Action, course_id: &str) {
        let entry = AuditEntry::new(student_id, action, Some(course_id), self.clock.now());
        record_audit(self.audit.as_ref(), entry).await;
    }
}

/// Merge course-side membership into the student record. The course lists win.
fn reconcile(student: &mut Student, course: &Course) {
    let mut repaired = false;
    if course.is_occupant(&student.id) && !student.occupies(course.id()) {
        student.add_occupied(course.id());
        repaired = true;
    }
    if course.is_waiter(&student.id) && !student.is_waiting(course.id()) {
        student.add_waiting(course.id());
        repaired = true;
    }
    if repaired {
        warn!(student = %student.id, course = course.id(), "student record repaired from course lists");
    }
}
