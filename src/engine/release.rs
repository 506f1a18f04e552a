use tracing::{debug, info, warn};

use crate::model::{Action, Student};
use crate::observability::DROPS_TOTAL;

use super::{reconcile, DropOutcome, Engine, EngineError};

impl Engine {
    /// Give up a seat (promoting the next eligible waiter) or leave the waitlist.
    pub async fn drop_course(&self, student_id: &str, course_id: &str) -> Result<DropOutcome, EngineError> {
        let mut student = self.load_student(student_id).await?;
        let course = self.load_course(course_id).await?;

        if let Some(closed_after) = course.drop_window_closed(self.clock.today()) {
            return Err(EngineError::WindowClosed {
                course_id: course_id.to_string(),
                closed_after,
            });
        }
        reconcile(&mut student, &course);

        if student.occupies(course_id) {
            self.release_seat(student, course_id).await
        } else if student.is_waiting(course_id) {
            self.leave_waitlist(student, course_id).await
        } else {
            Err(EngineError::NotInState {
                course_id: course_id.to_string(),
            })
        }
    }

    async fn release_seat(&self, mut student: Student, course_id: &str) -> Result<DropOutcome, EngineError> {
        student.remove_occupied(course_id);

        if !self.remove_occupant(course_id, &student.id).await? {
            warn!(student = %student.id, course = course_id, "student missing from occupants; no seat released");
        }
        self.students.save(&student).await?;
        self.record(&student.id, Action::Dropped, course_id).await;
        metrics::counter!(DROPS_TOTAL, "outcome" => "dropped").increment(1);
        info!(student = %student.id, course = course_id, "dropped");

        let promoted = self.promote(course_id).await;
        Ok(DropOutcome::Dropped { promoted })
    }

    async fn leave_waitlist(&self, mut student: Student, course_id: &str) -> Result<DropOutcome, EngineError> {
        student.remove_waiting(course_id);

        if !self.remove_waiter(course_id, &student.id).await? {
            debug!(student = %student.id, course = course_id, "student already gone from waitlist");
        }
        self.students.save(&student).await?;
        self.record(&student.id, Action::OptedOut, course_id).await;
        metrics::counter!(DROPS_TOTAL, "outcome" => "opted_out").increment(1);
        info!(student = %student.id, course = course_id, "opted out of waitlist");
        Ok(DropOutcome::OptedOut)
    }

    /// Take `student_id` out of the occupants and free one seat. Re-reads and retries when a
    /// concurrent writer changed the list first. `false` if the student held no seat.
    async fn remove_occupant(&self, course_id: &str, student_id: &str) -> Result<bool, EngineError> {
        loop {
            let course = self.load_course(course_id).await?;
            if !course.is_occupant(student_id) {
                return Ok(false);
            }
            let occupants = course
                .occupants
                .iter()
                .filter(|s| *s != student_id)
                .cloned()
                .collect();
            let occupancy = course.occupancy.saturating_sub(1);
            if self
                .courses
                .replace_occupants(course_id, &course.occupants, occupants, occupancy)
                .await?
            {
                return Ok(true);
            }
            debug!(student = student_id, course = course_id, "occupants changed concurrently; retrying");
        }
    }

    /// Take `student_id` off the waitlist, retrying on concurrent changes. `false` if absent.
    pub(super) async fn remove_waiter(&self, course_id: &str, student_id: &str) -> Result<bool, EngineError> {
        loop {
            let course = self.load_course(course_id).await?;
            if !course.is_waiter(student_id) {
                return Ok(false);
            }
            let waiters = course
                .waiters
                .iter()
                .filter(|s| *s != student_id)
                .cloned()
                .collect();
            if self
                .courses
                .replace_waiters(course_id, &course.waiters, waiters)
                .await?
            {
                return Ok(true);
            }
            debug!(student = student_id, course = course_id, "waitlist changed concurrently; retrying");
        }
    }
}
