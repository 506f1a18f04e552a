use chrono::NaiveDate;

use crate::model::{CourseId, StudentId};
use crate::store::StoreError;

/// Which of a course's two lists a student belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    Occupant,
    Waiter,
}

impl std::fmt::Display for Membership {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Membership::Occupant => f.write_str("enrolled in"),
            Membership::Waiter => f.write_str("waitlisted for"),
        }
    }
}

#[derive(Debug)]
pub enum EngineError {
    StudentNotFound(StudentId),
    CourseNotFound(CourseId),
    WindowClosed {
        course_id: CourseId,
        closed_after: NaiveDate,
    },
    AlreadyInState {
        course_id: CourseId,
        state: Membership,
    },
    /// Already in `max` courses of the given kind.
    LimitExceeded {
        state: Membership,
        max: usize,
    },
    CapacityExhaustedAndWaitlistFull {
        course_id: CourseId,
    },
    NotInState {
        course_id: CourseId,
    },
    Store(StoreError),
}

/// Coarse classification used by callers that map errors onto their own codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    WindowClosed,
    AlreadyInState,
    LimitExceeded,
    CapacityExhaustedAndWaitlistFull,
    NotInState,
    Store,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::StudentNotFound(_) | EngineError::CourseNotFound(_) => ErrorKind::NotFound,
            EngineError::WindowClosed { .. } => ErrorKind::WindowClosed,
            EngineError::AlreadyInState { .. } => ErrorKind::AlreadyInState,
            EngineError::LimitExceeded { .. } => ErrorKind::LimitExceeded,
            EngineError::CapacityExhaustedAndWaitlistFull { .. } => {
                ErrorKind::CapacityExhaustedAndWaitlistFull
            }
            EngineError::NotInState { .. } => ErrorKind::NotInState,
            EngineError::Store(_) => ErrorKind::Store,
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::StudentNotFound(id) => write!(f, "student not found: {id}"),
            EngineError::CourseNotFound(id) => write!(f, "course not found: {id}"),
            EngineError::WindowClosed {
                course_id,
                closed_after,
            } => write!(f, "window for course {course_id} closed after {closed_after}"),
            EngineError::AlreadyInState { course_id, state } => {
                write!(f, "already {state} course {course_id}")
            }
            EngineError::LimitExceeded {
                state: Membership::Occupant,
                max,
            } => write!(f, "limit exceeded: already enrolled in {max} courses"),
            EngineError::LimitExceeded {
                state: Membership::Waiter,
                max,
            } => write!(f, "limit exceeded: already on {max} waitlists"),
            EngineError::CapacityExhaustedAndWaitlistFull { course_id } => {
                write!(f, "course {course_id} is full and its waitlist is closed")
            }
            EngineError::NotInState { course_id } => {
                write!(f, "neither enrolled in nor waitlisted for course {course_id}")
            }
            EngineError::Store(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::CourseNotFound(id) => EngineError::CourseNotFound(id),
            other => EngineError::Store(other),
        }
    }
}
