use tracing::{debug, info};

use crate::limits::*;
use crate::model::Action;
use crate::observability::ENROLLMENTS_TOTAL;

use super::{reconcile, Engine, EngineError, EnrollOutcome, Membership};

impl Engine {
    /// Take a seat in `course_id`, or join its waitlist when it is full.
    pub async fn enroll(&self, student_id: &str, course_id: &str) -> Result<EnrollOutcome, EngineError> {
        let mut student = self.load_student(student_id).await?;
        let course = self.load_course(course_id).await?;

        if let Some(closed_after) = course.enroll_window_closed(self.clock.today()) {
            return Err(EngineError::WindowClosed {
                course_id: course_id.to_string(),
                closed_after,
            });
        }
        reconcile(&mut student, &course);
        if student.occupies(course_id) {
            return Err(EngineError::AlreadyInState {
                course_id: course_id.to_string(),
                state: Membership::Occupant,
            });
        }
        if student.is_waiting(course_id) {
            return Err(EngineError::AlreadyInState {
                course_id: course_id.to_string(),
                state: Membership::Waiter,
            });
        }
        if student.occupied.len() >= MAX_OCCUPIED_PER_STUDENT {
            return Err(EngineError::LimitExceeded {
                state: Membership::Occupant,
                max: MAX_OCCUPIED_PER_STUDENT,
            });
        }

        // A seat freed while others wait belongs to the head of the line.
        if course.has_free_seat() && !course.waiters.is_empty() {
            debug!(course = course_id, waiting = course.waiters.len(), "free seat with waiters; promoting first");
            self.promote(course_id).await;
        }

        if self
            .courses
            .compare_and_reserve(course_id, student_id, course.capacity())
            .await?
        {
            student.add_occupied(course_id);
            self.students.save(&student).await?;
            self.record(student_id, Action::Enrolled, course_id).await;
            metrics::counter!(ENROLLMENTS_TOTAL, "outcome" => "enrolled").increment(1);
            info!(student = student_id, course = course_id, "enrolled");
            return Ok(EnrollOutcome::Enrolled);
        }

        // The reservation can also fail because a concurrent call for the same student won.
        let latest = self.load_course(course_id).await?;
        if latest.is_occupant(student_id) {
            return Err(EngineError::AlreadyInState {
                course_id: course_id.to_string(),
                state: Membership::Occupant,
            });
        }
        if latest.is_waiter(student_id) {
            return Err(EngineError::AlreadyInState {
                course_id: course_id.to_string(),
                state: Membership::Waiter,
            });
        }
        if student.waiting.len() >= MAX_WAITING_PER_STUDENT {
            metrics::counter!(ENROLLMENTS_TOTAL, "outcome" => "rejected_limit").increment(1);
            return Err(EngineError::LimitExceeded {
                state: Membership::Waiter,
                max: MAX_WAITING_PER_STUDENT,
            });
        }
        if latest.waiters.len() >= MAX_WAITERS_PER_COURSE {
            metrics::counter!(ENROLLMENTS_TOTAL, "outcome" => "rejected_full").increment(1);
            return Err(EngineError::CapacityExhaustedAndWaitlistFull {
                course_id: course_id.to_string(),
            });
        }

        self.courses.append_waiter(course_id, student_id).await?;
        student.add_waiting(course_id);
        self.students.save(&student).await?;
        self.record(student_id, Action::Waitlisted, course_id).await;
        let position = latest.waiters.len() + 1;
        metrics::counter!(ENROLLMENTS_TOTAL, "outcome" => "waitlisted").increment(1);
        info!(student = student_id, course = course_id, position, "waitlisted");
        Ok(EnrollOutcome::Waitlisted { position })
    }
}
