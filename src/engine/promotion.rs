use tracing::{debug, info, warn};

use crate::limits::MAX_OCCUPIED_PER_STUDENT;
use crate::model::{Action, StudentId};
use crate::observability::PROMOTIONS_TOTAL;

use super::{Engine, EngineError};

impl Engine {
    /// Move at most one waiter into a free seat. Never fails the caller: errors are logged
    /// and reported as "nobody promoted".
    pub(super) async fn promote(&self, course_id: &str) -> Option<StudentId> {
        match self.try_promote(course_id).await {
            Ok(promoted) => promoted,
            Err(e) => {
                warn!(course = course_id, "promotion failed: {e}");
                None
            }
        }
    }

    async fn try_promote(&self, course_id: &str) -> Result<Option<StudentId>, EngineError> {
        let course = self.load_course(course_id).await?;
        if course.waiters.is_empty() || !course.has_free_seat() {
            return Ok(None);
        }

        for candidate_id in &course.waiters {
            let Some(mut candidate) = self.students.get(candidate_id).await? else {
                debug!(course = course_id, candidate = %candidate_id, "skip: no student record");
                continue;
            };
            if candidate.occupies(course_id) || course.is_occupant(candidate_id) {
                debug!(course = course_id, candidate = %candidate_id, "skip: already enrolled");
                continue;
            }
            if candidate.occupied.len() >= MAX_OCCUPIED_PER_STUDENT {
                debug!(course = course_id, candidate = %candidate_id, "skip: at enrollment limit");
                continue;
            }
            if !self
                .courses
                .compare_and_reserve(course_id, candidate_id, course.capacity())
                .await?
            {
                debug!(course = course_id, candidate = %candidate_id, "seat taken before promotion");
                continue;
            }

            candidate.add_occupied(course_id);
            candidate.remove_waiting(course_id);
            self.students.save(&candidate).await?;
            self.remove_waiter(course_id, candidate_id).await?;
            self.record(candidate_id, Action::AutoPromoted, course_id).await;
            metrics::counter!(PROMOTIONS_TOTAL).increment(1);
            info!(student = %candidate_id, course = course_id, "promoted from waitlist");
            return Ok(Some(candidate_id.clone()));
        }

        debug!(course = course_id, "no eligible waiter; seat stays free");
        Ok(None)
    }
}
