use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use uuid::Uuid;

use crate::error::{Error, Result};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Student,
    Instructor,
    Admin,
}

impl Role {
    /// Instructors and admins may grade labs and review certificates.
    pub fn is_staff(&self) -> bool {
        matches!(self, Role::Instructor | Role::Admin)
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "student" => Ok(Role::Student),
            "instructor" => Ok(Role::Instructor),
            "admin" => Ok(Role::Admin),
            other => Err(Error::Validation(format!("role {other:?}"))),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub role: Role,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Course {
    pub id: Uuid,
    pub title: String,
    pub instructor_id: Uuid,
}

/// A unit of course content. Lives in the content store, not alongside enrollments.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Module {
    pub id: Uuid,
    pub course_id: Uuid,
    pub title: String,
    #[serde(default)]
    pub position: i32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Lab {
    pub id: Uuid,
    pub title: String,
}

/// A student taking a course. `progress` and `finished` are derived from
/// module completions and written only by the progress aggregator.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Enrollment {
    pub id: Uuid,
    pub student_id: Uuid,
    pub course_id: Uuid,
    pub progress: f64,
    pub finished: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Enrollment {
    pub fn new(student_id: Uuid, course_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            student_id,
            course_id,
            progress: 0.0,
            finished: false,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ModuleCompletion {
    pub student_id: Uuid,
    pub module_id: Uuid,
    pub course_id: Uuid,
    pub complete: bool,
    pub completed_at: DateTime<Utc>,
}

/// A numeric lab grade on the 0–100 scale.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, PartialOrd)]
#[serde(try_from = "f64", into = "f64")]
pub struct Grade(f64);

impl Grade {
    pub const MAX: f64 = 100.0;

    pub fn new(value: f64) -> Result<Self> {
        if value.is_finite() && (0.0..=Self::MAX).contains(&value) {
            Ok(Grade(value))
        } else {
            Err(Error::Validation(format!("grade {value}: expected 0..=100")))
        }
    }

    pub fn value(self) -> f64 {
        self.0
    }

    pub fn passes(self, threshold: f64) -> bool {
        self.0 >= threshold
    }
}

impl TryFrom<f64> for Grade {
    type Error = Error;

    fn try_from(value: f64) -> Result<Self> {
        Grade::new(value)
    }
}

impl From<Grade> for f64 {
    fn from(g: Grade) -> f64 {
        g.0
    }
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabGradeState {
    Ungraded,
    Graded,
}

/// Existence of the record means the student is enrolled in the lab.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LabGradeRecord {
    pub student_id: Uuid,
    pub lab_id: Uuid,
    pub grade: Option<Grade>,
    pub feedback: Option<String>,
    pub graded_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LabGradeRecord {
    pub fn enrolled(student_id: Uuid, lab_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            student_id,
            lab_id,
            grade: None,
            feedback: None,
            graded_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn state(&self) -> LabGradeState {
        match self.grade {
            Some(_) => LabGradeState::Graded,
            None => LabGradeState::Ungraded,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CertificateStatus {
    Pending,
    Approved,
    Rejected,
}

impl CertificateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CertificateStatus::Pending => "pending",
            CertificateStatus::Approved => "approved",
            CertificateStatus::Rejected => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, CertificateStatus::Pending)
    }
}

impl FromStr for CertificateStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(CertificateStatus::Pending),
            "approved" => Ok(CertificateStatus::Approved),
            "rejected" => Ok(CertificateStatus::Rejected),
            other => Err(Error::Validation(format!("certificate status {other:?}"))),
        }
    }
}

impl fmt::Display for CertificateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a certificate is for. A certificate names at most one subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CertificateSubject {
    Course(Uuid),
    Lab(Uuid),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Certificate {
    pub id: Uuid,
    pub student_id: Uuid,
    pub course_id: Option<Uuid>,
    pub lab_id: Option<Uuid>,
    pub title: String,
    pub status: CertificateStatus,
    /// Issued by a completion trigger rather than by an instructor.
    pub auto_issued: bool,
    pub approved_by: Option<Uuid>,
    pub approved_at: Option<DateTime<Utc>>,
    pub issued_at: DateTime<Utc>,
}

impl Certificate {
    pub fn pending(
        student_id: Uuid,
        subject: Option<CertificateSubject>,
        title: impl Into<String>,
        auto_issued: bool,
    ) -> Self {
        let (course_id, lab_id) = match subject {
            Some(CertificateSubject::Course(id)) => (Some(id), None),
            Some(CertificateSubject::Lab(id)) => (None, Some(id)),
            None => (None, None),
        };
        Self {
            id: Uuid::new_v4(),
            student_id,
            course_id,
            lab_id,
            title: title.into(),
            status: CertificateStatus::Pending,
            auto_issued,
            approved_by: None,
            approved_at: None,
            issued_at: Utc::now(),
        }
    }

    pub fn subject(&self) -> Option<CertificateSubject> {
        match (self.course_id, self.lab_id) {
            (Some(c), _) => Some(CertificateSubject::Course(c)),
            (None, Some(l)) => Some(CertificateSubject::Lab(l)),
            (None, None) => None,
        }
    }
}

// --- read-side views ---

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct EnrollmentWithProgress {
    #[serde(flatten)]
    pub enrollment: Enrollment,
    pub module_count: u64,
    pub completed_modules: u64,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ModuleWithProgress {
    #[serde(flatten)]
    pub module: Module,
    pub complete: bool,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct LabWithUngradedCount {
    #[serde(flatten)]
    pub lab: Lab,
    pub ungraded_count: u64,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct UngradedStudent {
    pub user_id: Uuid,
    pub name: String,
    pub email: String,
}

impl From<User> for UngradedStudent {
    fn from(u: User) -> Self {
        Self {
            user_id: u.id,
            name: u.name,
            email: u.email,
        }
    }
}

// --- requests ---

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MarkCompleteReq {
    pub module_id: Uuid,
    pub course_id: Uuid,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SubmitGradeReq {
    pub student_id: Uuid,
    pub lab_id: Uuid,
    pub grade: f64,
    #[serde(default)]
    pub feedback: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GenerateCertificateReq {
    pub student_id: Uuid,
    pub course_id: Option<Uuid>,
    pub lab_id: Option<Uuid>,
    pub title: String,
}
