use std::sync::Arc;

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher as _, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use tracing::info;

use crate::clock::Clock;
use crate::limits::*;
use crate::model::*;
use crate::observability::LOGINS_TOTAL;
use crate::session::SessionStore;
use crate::store::{AuditSink, RequesterStore, StoreError, record_audit};

#[derive(Debug)]
pub enum AccountError {
    Invalid(&'static str),
    DuplicateId(StudentId),
    DuplicateEmail(String),
    /// Unknown email or wrong password; deliberately indistinguishable.
    InvalidCredentials,
    InvalidSession,
    StudentNotFound(StudentId),
    Hashing(String),
    Store(StoreError),
}

impl std::fmt::Display for AccountError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccountError::Invalid(msg) => write!(f, "invalid registration: {msg}"),
            AccountError::DuplicateId(id) => write!(f, "student id already registered: {id}"),
            AccountError::DuplicateEmail(email) => write!(f, "email already registered: {email}"),
            AccountError::InvalidCredentials => write!(f, "invalid email or password"),
            AccountError::InvalidSession => write!(f, "invalid or expired session"),
            AccountError::StudentNotFound(id) => write!(f, "student not found: {id}"),
            AccountError::Hashing(e) => write!(f, "password hashing failed: {e}"),
            AccountError::Store(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for AccountError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AccountError::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for AccountError {
    fn from(e: StoreError) -> Self {
        AccountError::Store(e)
    }
}

/// Argon2id hashing with a random salt per password.
#[derive(Debug, Clone)]
pub struct PasswordHasher {
    params: Params,
}

impl PasswordHasher {
    pub fn new() -> Self {
        Self {
            params: Params::default(),
        }
    }

    /// Custom cost; memory in KiB. Verification always uses the parameters stored in the hash.
    pub fn with_cost(m_cost: u32, t_cost: u32) -> Result<Self, AccountError> {
        let params = Params::new(m_cost, t_cost, 1, None).map_err(|e| AccountError::Hashing(e.to_string()))?;
        Ok(Self { params })
    }

    fn argon2(&self) -> Argon2<'static> {
        Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone())
    }

    pub fn hash(&self, password: &str) -> Result<String, AccountError> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .argon2()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| AccountError::Hashing(e.to_string()))?;
        Ok(hash.to_string())
    }

    /// `Ok(false)` on mismatch; `Err` only for a malformed stored hash.
    pub fn verify(&self, password: &str, hash: &str) -> Result<bool, AccountError> {
        let parsed = PasswordHash::new(hash).map_err(|e| AccountError::Hashing(e.to_string()))?;
        match self.argon2().verify_password(password.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(argon2::password_hash::Error::Password) => Ok(false),
            Err(e) => Err(AccountError::Hashing(e.to_string())),
        }
    }
}

impl Default for PasswordHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// What a student sees about themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub id: StudentId,
    pub name: String,
    pub email: String,
    pub occupied: Vec<CourseId>,
    pub waiting: Vec<CourseId>,
}

impl From<Student> for Profile {
    fn from(s: Student) -> Self {
        Self {
            id: s.id,
            name: s.name,
            email: s.email,
            occupied: s.occupied,
            waiting: s.waiting,
        }
    }
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Registration, login and session lookup.
pub struct Accounts {
    students: Arc<dyn RequesterStore>,
    sessions: Arc<SessionStore>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    hasher: PasswordHasher,
}

impl Accounts {
    pub fn new(
        students: Arc<dyn RequesterStore>,
        sessions: Arc<SessionStore>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
        hasher: PasswordHasher,
    ) -> Self {
        Self {
            students,
            sessions,
            audit,
            clock,
            hasher,
        }
    }

    async fn record(&self, student_id: &str, action: Action) {
        let entry = AuditEntry::new(student_id, action, None, self.clock.now());
        record_audit(self.audit.as_ref(), entry).await;
    }

    async fn hash_off_thread(&self, password: String) -> Result<String, AccountError> {
        let hasher = self.hasher.clone();
        tokio::task::spawn_blocking(move || hasher.hash(&password))
            .await
            .map_err(|e| AccountError::Hashing(e.to_string()))?
    }

    async fn verify_off_thread(&self, password: String, hash: String) -> Result<bool, AccountError> {
        let hasher = self.hasher.clone();
        tokio::task::spawn_blocking(move || hasher.verify(&password, &hash))
            .await
            .map_err(|e| AccountError::Hashing(e.to_string()))?
    }

    pub async fn register(
        &self,
        id: &str,
        name: &str,
        email: &str,
        password: &str,
    ) -> Result<Profile, AccountError> {
        let id = id.trim();
        let name = name.trim();
        let email = normalize_email(email);
        if id.is_empty() {
            return Err(AccountError::Invalid("student id required"));
        }
        if id.len() > MAX_ID_LEN {
            return Err(AccountError::Invalid("student id too long"));
        }
        if name.is_empty() {
            return Err(AccountError::Invalid("name required"));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(AccountError::Invalid("name too long"));
        }
        if email.is_empty() {
            return Err(AccountError::Invalid("email required"));
        }
        if email.len() > MAX_EMAIL_LEN {
            return Err(AccountError::Invalid("email too long"));
        }
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(AccountError::Invalid("password too short"));
        }
        if password.len() > MAX_PASSWORD_LEN {
            return Err(AccountError::Invalid("password too long"));
        }
        if self.students.get(id).await?.is_some() {
            return Err(AccountError::DuplicateId(id.to_string()));
        }
        if self.students.find_by_email(&email).await?.is_some() {
            return Err(AccountError::DuplicateEmail(email));
        }

        let hash = self.hash_off_thread(password.to_string()).await?;
        let student = Student::new(id, name, email.clone(), hash);
        match self.students.insert(&student).await {
            Ok(()) => {}
            // Lost a race with a concurrent registration.
            Err(StoreError::AlreadyExists(key)) if key == email => {
                return Err(AccountError::DuplicateEmail(email));
            }
            Err(StoreError::AlreadyExists(_)) => return Err(AccountError::DuplicateId(id.to_string())),
            Err(e) => return Err(e.into()),
        }
        self.record(id, Action::Signup).await;
        info!(student = id, "registered");
        Ok(student.into())
    }

    /// Verify credentials and open a session; returns its token.
    pub async fn login(&self, email: &str, password: &str) -> Result<String, AccountError> {
        let email = normalize_email(email);
        let Some(student) = self.students.find_by_email(&email).await? else {
            metrics::counter!(LOGINS_TOTAL, "status" => "rejected").increment(1);
            return Err(AccountError::InvalidCredentials);
        };
        if !self
            .verify_off_thread(password.to_string(), student.password_hash.clone())
            .await?
        {
            metrics::counter!(LOGINS_TOTAL, "status" => "rejected").increment(1);
            return Err(AccountError::InvalidCredentials);
        }
        let token = self.sessions.create(&student.id);
        self.record(&student.id, Action::Login).await;
        metrics::counter!(LOGINS_TOTAL, "status" => "ok").increment(1);
        info!(student = %student.id, "logged in");
        Ok(token)
    }

    pub async fn logout(&self, token: &str) -> Result<(), AccountError> {
        let student_id = self.sessions.invalidate(token).ok_or(AccountError::InvalidSession)?;
        self.record(&student_id, Action::Logout).await;
        info!(student = %student_id, "logged out");
        Ok(())
    }

    /// The student behind a live session token.
    pub fn authenticate(&self, token: &str) -> Result<StudentId, AccountError> {
        self.sessions.resolve(token).ok_or(AccountError::InvalidSession)
    }

    pub async fn profile(&self, student_id: &str) -> Result<Profile, AccountError> {
        self.students
            .get(student_id)
            .await?
            .map(Profile::from)
            .ok_or_else(|| AccountError::StudentNotFound(student_id.to_string()))
    }
}
