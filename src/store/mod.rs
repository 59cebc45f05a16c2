//! Data-access contracts for the progress engine.
//!
//! Each trait covers one owned table (or collaborator). Ownership is the
//! concurrency rule: enrollments are written only by the progress aggregator,
//! lab grade records only by the lab grading workflow, certificate status only
//! by the approval workflow.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::models::*;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<User>>;
    async fn get_many(&self, ids: &[Uuid]) -> Result<Vec<User>>;
}

#[async_trait]
pub trait CourseStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<Course>>;
    async fn by_instructor(&self, instructor_id: Uuid) -> Result<Vec<Course>>;
}

/// Course content. May be backed by a different database than the rest.
#[async_trait]
pub trait ModuleStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<Module>>;
    async fn count_in_course(&self, course_id: Uuid) -> Result<u64>;
    /// Ordered by position.
    async fn list_for_course(&self, course_id: Uuid) -> Result<Vec<Module>>;
}

#[async_trait]
pub trait EnrollmentStore: Send + Sync {
    /// Fails with `Conflict` when (student, course) already has an enrollment.
    async fn create(&self, enrollment: &Enrollment) -> Result<()>;
    async fn get(&self, student_id: Uuid, course_id: Uuid) -> Result<Option<Enrollment>>;
    async fn for_student(&self, student_id: Uuid) -> Result<Vec<Enrollment>>;
    async fn count_for_course(&self, course_id: Uuid) -> Result<u64>;
    /// Writes `progress`, `finished` and `updated_at`. Idempotent.
    async fn update_progress(&self, enrollment: &Enrollment) -> Result<()>;
}

#[async_trait]
pub trait CompletionStore: Send + Sync {
    async fn get(&self, student_id: Uuid, module_id: Uuid) -> Result<Option<ModuleCompletion>>;
    /// Insert or flip to complete, keyed by (student, module). Idempotent.
    async fn upsert(&self, completion: &ModuleCompletion) -> Result<()>;
    async fn count_complete(&self, student_id: Uuid, course_id: Uuid) -> Result<u64>;
    async fn for_student_course(
        &self,
        student_id: Uuid,
        course_id: Uuid,
    ) -> Result<Vec<ModuleCompletion>>;
}

#[async_trait]
pub trait LabStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<Lab>>;
    async fn list(&self) -> Result<Vec<Lab>>;
}

#[async_trait]
pub trait LabGradeStore: Send + Sync {
    async fn get(&self, student_id: Uuid, lab_id: Uuid) -> Result<Option<LabGradeRecord>>;
    /// Fails with `Conflict` when (student, lab) already has a record.
    async fn create(&self, record: &LabGradeRecord) -> Result<()>;
    /// Writes grade, feedback, grader and `updated_at`. Idempotent.
    async fn update_grade(&self, record: &LabGradeRecord) -> Result<()>;
    async fn ungraded_for_lab(&self, lab_id: Uuid) -> Result<Vec<LabGradeRecord>>;
    async fn count_ungraded(&self, lab_id: Uuid) -> Result<u64>;
}

#[async_trait]
pub trait CertificateStore: Send + Sync {
    async fn create(&self, cert: &Certificate) -> Result<()>;
    async fn get(&self, id: Uuid) -> Result<Option<Certificate>>;
    /// Every pending certificate, oldest first.
    async fn pending(&self) -> Result<Vec<Certificate>>;
    /// Newest first.
    async fn for_student(&self, student_id: Uuid) -> Result<Vec<Certificate>>;
    /// Writes status, reviewer and review time, but only while the stored
    /// certificate is still pending. Returns whether the write applied; a
    /// missing or already reviewed certificate yields `false`.
    async fn update_review(&self, cert: &Certificate) -> Result<bool>;
}

/// Store handles injected into the workflows.
#[derive(Clone)]
pub struct Stores {
    pub users: Arc<dyn UserStore>,
    pub courses: Arc<dyn CourseStore>,
    pub modules: Arc<dyn ModuleStore>,
    pub enrollments: Arc<dyn EnrollmentStore>,
    pub completions: Arc<dyn CompletionStore>,
    pub labs: Arc<dyn LabStore>,
    pub lab_grades: Arc<dyn LabGradeStore>,
    pub certificates: Arc<dyn CertificateStore>,
}

impl Stores {
    pub fn postgres(store: PgStore) -> Self {
        let store = Arc::new(store);
        Self {
            users: store.clone(),
            courses: store.clone(),
            modules: store.clone(),
            enrollments: store.clone(),
            completions: store.clone(),
            labs: store.clone(),
            lab_grades: store.clone(),
            certificates: store,
        }
    }

    pub fn memory(store: Arc<MemoryStore>) -> Self {
        Self {
            users: store.clone(),
            courses: store.clone(),
            modules: store.clone(),
            enrollments: store.clone(),
            completions: store.clone(),
            labs: store.clone(),
            lab_grades: store.clone(),
            certificates: store,
        }
    }
}
