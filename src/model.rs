use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

pub type StudentId = String;
pub type CourseId = String;

/// Administrative description of a course. Seat and waitlist state lives in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseSpec {
    pub id: CourseId,
    pub name: String,
    /// Max concurrent occupants.
    pub capacity: u32,
    /// Informational; nothing is gated on it.
    pub start_date: Option<NaiveDate>,
    /// Drops are rejected once today is past this date.
    pub end_date: Option<NaiveDate>,
    /// Enrollments are rejected once today is past this date.
    pub enroll_by: Option<NaiveDate>,
}

impl CourseSpec {
    pub fn new(id: impl Into<CourseId>, name: impl Into<String>, capacity: u32) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            capacity,
            start_date: None,
            end_date: None,
            enroll_by: None,
        }
    }

    pub fn with_start_date(mut self, date: NaiveDate) -> Self {
        self.start_date = Some(date);
        self
    }

    pub fn with_end_date(mut self, date: NaiveDate) -> Self {
        self.end_date = Some(date);
        self
    }

    pub fn with_enroll_by(mut self, date: NaiveDate) -> Self {
        self.enroll_by = Some(date);
        self
    }
}

/// Consistent snapshot of a course: metadata plus both independently written sub-fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Course {
    pub spec: CourseSpec,
    pub occupancy: u32,
    /// Seat holders in reservation order. `occupants.len() == occupancy`.
    pub occupants: Vec<StudentId>,
    /// FIFO: index 0 is promoted first.
    pub waiters: Vec<StudentId>,
}

impl Course {
    pub fn empty(spec: CourseSpec) -> Self {
        Self {
            spec,
            occupancy: 0,
            occupants: Vec::new(),
            waiters: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn capacity(&self) -> u32 {
        self.spec.capacity
    }

    pub fn has_free_seat(&self) -> bool {
        self.occupancy < self.spec.capacity
    }

    pub fn remaining(&self) -> u32 {
        self.spec.capacity.saturating_sub(self.occupancy)
    }

    pub fn is_occupant(&self, student_id: &str) -> bool {
        self.occupants.iter().any(|s| s == student_id)
    }

    pub fn is_waiter(&self, student_id: &str) -> bool {
        self.waiters.iter().any(|s| s == student_id)
    }

    /// The enroll-by date, once `today` is past it.
    pub fn enroll_window_closed(&self, today: NaiveDate) -> Option<NaiveDate> {
        self.spec.enroll_by.filter(|d| today > *d)
    }

    /// The end date, once `today` is past it.
    pub fn drop_window_closed(&self, today: NaiveDate) -> Option<NaiveDate> {
        self.spec.end_date.filter(|d| today > *d)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Student {
    pub id: StudentId,
    pub name: String,
    /// Trimmed and lowercased at registration.
    pub email: String,
    /// Argon2id PHC string.
    pub password_hash: String,
    /// Courses this student holds a seat in, in enrollment order.
    pub occupied: Vec<CourseId>,
    /// Courses this student is waitlisted on, in join order.
    pub waiting: Vec<CourseId>,
}

impl Student {
    pub fn new(
        id: impl Into<StudentId>,
        name: impl Into<String>,
        email: impl Into<String>,
        password_hash: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            email: email.into(),
            password_hash: password_hash.into(),
            occupied: Vec::new(),
            waiting: Vec::new(),
        }
    }

    pub fn occupies(&self, course_id: &str) -> bool {
        self.occupied.iter().any(|c| c == course_id)
    }

    pub fn is_waiting(&self, course_id: &str) -> bool {
        self.waiting.iter().any(|c| c == course_id)
    }

    pub fn add_occupied(&mut self, course_id: &str) {
        if !self.occupies(course_id) {
            self.occupied.push(course_id.to_string());
        }
    }

    pub fn remove_occupied(&mut self, course_id: &str) -> bool {
        remove_all(&mut self.occupied, course_id)
    }

    pub fn add_waiting(&mut self, course_id: &str) {
        if !self.is_waiting(course_id) {
            self.waiting.push(course_id.to_string());
        }
    }

    pub fn remove_waiting(&mut self, course_id: &str) -> bool {
        remove_all(&mut self.waiting, course_id)
    }
}

fn remove_all(list: &mut Vec<String>, value: &str) -> bool {
    let before = list.len();
    list.retain(|v| v != value);
    list.len() != before
}

/// What an audit entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    Signup,
    Login,
    Logout,
    Enrolled,
    Waitlisted,
    Dropped,
    OptedOut,
    AutoPromoted,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Signup => "SIGNUP",
            Action::Login => "LOGIN",
            Action::Logout => "LOGOUT",
            Action::Enrolled => "ENROLLED",
            Action::Waitlisted => "WAITLISTED",
            Action::Dropped => "DROPPED",
            Action::OptedOut => "OPTED_OUT",
            Action::AutoPromoted => "AUTO_PROMOTED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Ulid,
    pub student_id: StudentId,
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub course_id: Option<CourseId>,
    pub at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(student_id: &str, action: Action, course_id: Option<&str>, at: DateTime<Utc>) -> Self {
        Self {
            id: Ulid::new(),
            student_id: student_id.to_string(),
            action,
            course_id: course_id.map(str::to_string),
            at,
        }
    }
}

/// WAL record format. Seat events and waitlist events are separate kinds so replay applies
/// them as the independent sub-field updates they were.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    /// Also used by compaction to restore a full course snapshot.
    CourseCreated {
        course: Course,
    },
    SeatReserved {
        course_id: CourseId,
        student_id: StudentId,
    },
    OccupantsReplaced {
        course_id: CourseId,
        occupants: Vec<StudentId>,
        occupancy: u32,
    },
    WaiterAppended {
        course_id: CourseId,
        student_id: StudentId,
    },
    WaitersReplaced {
        course_id: CourseId,
        waiters: Vec<StudentId>,
    },
    StudentSaved {
        student: Student,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn enroll_by_is_inclusive() {
        let course = Course::empty(CourseSpec::new("C1", "Rust", 2).with_enroll_by(date(2025, 9, 10)));
        assert_eq!(course.enroll_window_closed(date(2025, 9, 9)), None);
        assert_eq!(course.enroll_window_closed(date(2025, 9, 10)), None);
        assert_eq!(course.enroll_window_closed(date(2025, 9, 11)), Some(date(2025, 9, 10)));
    }

    #[test]
    fn end_date_gates_drops_only() {
        let course = Course::empty(CourseSpec::new("C1", "Rust", 2).with_end_date(date(2025, 12, 1)));
        assert_eq!(course.enroll_window_closed(date(2026, 1, 1)), None);
        assert_eq!(course.drop_window_closed(date(2025, 12, 2)), Some(date(2025, 12, 1)));
        assert_eq!(course.drop_window_closed(date(2025, 12, 1)), None);
    }

    #[test]
    fn open_windows_never_close() {
        let course = Course::empty(CourseSpec::new("C1", "Rust", 2));
        assert!(course.enroll_window_closed(date(2999, 1, 1)).is_none());
        assert!(course.drop_window_closed(date(2999, 1, 1)).is_none());
    }

    #[test]
    fn remaining_saturates() {
        let mut course = Course::empty(CourseSpec::new("C1", "Rust", 2));
        assert_eq!(course.remaining(), 2);
        assert!(course.has_free_seat());
        course.occupancy = 3; // overcommitted by hand
        assert_eq!(course.remaining(), 0);
        assert!(!course.has_free_seat());
    }

    #[test]
    fn student_sets_deduplicate() {
        let mut s = Student::new("S1", "Alice", "alice@example.com", "x");
        s.add_occupied("C1");
        s.add_occupied("C1");
        assert_eq!(s.occupied, vec!["C1".to_string()]);
        assert!(s.remove_occupied("C1"));
        assert!(!s.remove_occupied("C1"));

        s.add_waiting("C2");
        s.add_waiting("C3");
        assert!(s.is_waiting("C2"));
        assert!(s.remove_waiting("C2"));
        assert_eq!(s.waiting, vec!["C3".to_string()]);
    }

    #[test]
    fn action_names_match_log_format() {
        for action in [
            Action::Signup,
            Action::Login,
            Action::Logout,
            Action::Enrolled,
            Action::Waitlisted,
            Action::Dropped,
            Action::OptedOut,
            Action::AutoPromoted,
        ] {
            let json = serde_json::to_string(&action).unwrap();
            assert_eq!(json, format!("\"{}\"", action.as_str()));
        }
    }

    #[test]
    fn audit_entry_omits_missing_course() {
        let entry = AuditEntry::new("S1", Action::Signup, None, Utc::now());
        let json = serde_json::to_string(&entry).unwrap();
        assert!(!json.contains("course_id"));
        let back: AuditEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn event_survives_bincode() {
        let mut course = Course::empty(
            CourseSpec::new("C1", "Rust", 3)
                .with_start_date(date(2025, 9, 1))
                .with_enroll_by(date(2025, 9, 15)),
        );
        course.occupancy = 1;
        course.occupants.push("S1".into());
        course.waiters.push("S2".into());
        let event = Event::CourseCreated { course };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
