use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{query, query_as, query_scalar};
use uuid::Uuid;

use super::*;
use crate::db::Db;
use crate::error::{Error, Result};

#[derive(Clone)]
pub struct PgStore {
    pool: Db,
}

impl PgStore {
    pub fn new(pool: Db) -> Self {
        Self { pool }
    }
}

// --- row shapes; enums are stored as text ---

#[derive(sqlx::FromRow)]
struct UserRow {
    id: Uuid,
    name: String,
    email: String,
    role: String,
}

impl TryFrom<UserRow> for User {
    type Error = Error;

    fn try_from(r: UserRow) -> Result<Self> {
        Ok(User {
            id: r.id,
            name: r.name,
            email: r.email,
            role: r.role.parse()?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct CourseRow {
    id: Uuid,
    title: String,
    instructor_id: Uuid,
}

impl From<CourseRow> for Course {
    fn from(r: CourseRow) -> Self {
        Course {
            id: r.id,
            title: r.title,
            instructor_id: r.instructor_id,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ModuleRow {
    id: Uuid,
    course_id: Uuid,
    title: String,
    position: i32,
}

impl From<ModuleRow> for Module {
    fn from(r: ModuleRow) -> Self {
        Module {
            id: r.id,
            course_id: r.course_id,
            title: r.title,
            position: r.position,
        }
    }
}

#[derive(sqlx::FromRow)]
struct EnrollmentRow {
    id: Uuid,
    student_id: Uuid,
    course_id: Uuid,
    progress: f64,
    finished: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<EnrollmentRow> for Enrollment {
    fn from(r: EnrollmentRow) -> Self {
        Enrollment {
            id: r.id,
            student_id: r.student_id,
            course_id: r.course_id,
            progress: r.progress,
            finished: r.finished,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct CompletionRow {
    student_id: Uuid,
    module_id: Uuid,
    course_id: Uuid,
    complete: bool,
    completed_at: DateTime<Utc>,
}

impl From<CompletionRow> for ModuleCompletion {
    fn from(r: CompletionRow) -> Self {
        ModuleCompletion {
            student_id: r.student_id,
            module_id: r.module_id,
            course_id: r.course_id,
            complete: r.complete,
            completed_at: r.completed_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct LabRow {
    id: Uuid,
    title: String,
}

#[derive(sqlx::FromRow)]
struct LabGradeRow {
    student_id: Uuid,
    lab_id: Uuid,
    grade: Option<f64>,
    feedback: Option<String>,
    graded_by: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<LabGradeRow> for LabGradeRecord {
    type Error = Error;

    fn try_from(r: LabGradeRow) -> Result<Self> {
        Ok(LabGradeRecord {
            student_id: r.student_id,
            lab_id: r.lab_id,
            grade: r.grade.map(Grade::new).transpose()?,
            feedback: r.feedback,
            graded_by: r.graded_by,
            created_at: r.created_at,
            updated_at: r.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct CertificateRow {
    id: Uuid,
    student_id: Uuid,
    course_id: Option<Uuid>,
    lab_id: Option<Uuid>,
    title: String,
    status: String,
    auto_issued: bool,
    approved_by: Option<Uuid>,
    approved_at: Option<DateTime<Utc>>,
    issued_at: DateTime<Utc>,
}

impl TryFrom<CertificateRow> for Certificate {
    type Error = Error;

    fn try_from(r: CertificateRow) -> Result<Self> {
        Ok(Certificate {
            id: r.id,
            student_id: r.student_id,
            course_id: r.course_id,
            lab_id: r.lab_id,
            title: r.title,
            status: r.status.parse()?,
            auto_issued: r.auto_issued,
            approved_by: r.approved_by,
            approved_at: r.approved_at,
            issued_at: r.issued_at,
        })
    }
}

fn count(n: i64) -> u64 {
    u64::try_from(n).unwrap_or(0)
}

const ENROLLMENT_COLS: &str =
    "id, student_id, course_id, progress, finished, created_at, updated_at";
const LAB_GRADE_COLS: &str =
    "student_id, lab_id, grade, feedback, graded_by, created_at, updated_at";
const CERT_COLS: &str = "id, student_id, course_id, lab_id, title, status, auto_issued, \
     approved_by, approved_at, issued_at";

#[async_trait]
impl UserStore for PgStore {
    async fn get(&self, id: Uuid) -> Result<Option<User>> {
        query_as::<_, UserRow>("SELECT id, name, email, role FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(User::try_from)
            .transpose()
    }

    async fn get_many(&self, ids: &[Uuid]) -> Result<Vec<User>> {
        query_as::<_, UserRow>("SELECT id, name, email, role FROM users WHERE id = ANY($1)")
            .bind(ids)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(User::try_from)
            .collect()
    }
}

#[async_trait]
impl CourseStore for PgStore {
    async fn get(&self, id: Uuid) -> Result<Option<Course>> {
        let row = query_as::<_, CourseRow>(
            "SELECT id, title, instructor_id FROM courses WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Course::from))
    }

    async fn by_instructor(&self, instructor_id: Uuid) -> Result<Vec<Course>> {
        let rows = query_as::<_, CourseRow>(
            "SELECT id, title, instructor_id FROM courses WHERE instructor_id = $1 ORDER BY created_at",
        )
        .bind(instructor_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Course::from).collect())
    }
}

#[async_trait]
impl ModuleStore for PgStore {
    async fn get(&self, id: Uuid) -> Result<Option<Module>> {
        let row = query_as::<_, ModuleRow>(
            "SELECT id, course_id, title, position FROM modules WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Module::from))
    }

    async fn count_in_course(&self, course_id: Uuid) -> Result<u64> {
        let n: i64 = query_scalar("SELECT COUNT(*) FROM modules WHERE course_id = $1")
            .bind(course_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count(n))
    }

    async fn list_for_course(&self, course_id: Uuid) -> Result<Vec<Module>> {
        let rows = query_as::<_, ModuleRow>(
            "SELECT id, course_id, title, position FROM modules WHERE course_id = $1 ORDER BY position, id",
        )
        .bind(course_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Module::from).collect())
    }
}

#[async_trait]
impl EnrollmentStore for PgStore {
    async fn create(&self, e: &Enrollment) -> Result<()> {
        query(
            r#"
            INSERT INTO enrollments (id, student_id, course_id, progress, finished, created_at, updated_at)
            VALUES ($1,$2,$3,$4,$5,$6,$7)
            "#,
        )
        .bind(e.id)
        .bind(e.student_id)
        .bind(e.course_id)
        .bind(e.progress)
        .bind(e.finished)
        .bind(e.created_at)
        .bind(e.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|err| match Error::from(err) {
            Error::Conflict(_) => Error::Conflict("already enrolled in this course".into()),
            other => other,
        })?;
        Ok(())
    }

    async fn get(&self, student_id: Uuid, course_id: Uuid) -> Result<Option<Enrollment>> {
        let sql = format!(
            "SELECT {ENROLLMENT_COLS} FROM enrollments WHERE student_id = $1 AND course_id = $2"
        );
        let row = query_as::<_, EnrollmentRow>(&sql)
            .bind(student_id)
            .bind(course_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Enrollment::from))
    }

    async fn for_student(&self, student_id: Uuid) -> Result<Vec<Enrollment>> {
        let sql = format!(
            "SELECT {ENROLLMENT_COLS} FROM enrollments WHERE student_id = $1 ORDER BY created_at"
        );
        let rows = query_as::<_, EnrollmentRow>(&sql)
            .bind(student_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Enrollment::from).collect())
    }

    async fn count_for_course(&self, course_id: Uuid) -> Result<u64> {
        let n: i64 = query_scalar("SELECT COUNT(*) FROM enrollments WHERE course_id = $1")
            .bind(course_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count(n))
    }

    async fn update_progress(&self, e: &Enrollment) -> Result<()> {
        let done = query(
            "UPDATE enrollments SET progress = $3, finished = $4, updated_at = $5 \
             WHERE student_id = $1 AND course_id = $2",
        )
        .bind(e.student_id)
        .bind(e.course_id)
        .bind(e.progress)
        .bind(e.finished)
        .bind(e.updated_at)
        .execute(&self.pool)
        .await?;
        if done.rows_affected() == 0 {
            return Err(Error::not_found("enrollment"));
        }
        Ok(())
    }
}

#[async_trait]
impl CompletionStore for PgStore {
    async fn get(&self, student_id: Uuid, module_id: Uuid) -> Result<Option<ModuleCompletion>> {
        let row = query_as::<_, CompletionRow>(
            "SELECT student_id, module_id, course_id, complete, completed_at \
             FROM module_completions WHERE student_id = $1 AND module_id = $2",
        )
        .bind(student_id)
        .bind(module_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(ModuleCompletion::from))
    }

    async fn upsert(&self, c: &ModuleCompletion) -> Result<()> {
        query(
            r#"
            INSERT INTO module_completions (student_id, module_id, course_id, complete, completed_at)
            VALUES ($1,$2,$3,$4,$5)
            ON CONFLICT (student_id, module_id)
            DO UPDATE SET complete = EXCLUDED.complete, completed_at = EXCLUDED.completed_at
            "#,
        )
        .bind(c.student_id)
        .bind(c.module_id)
        .bind(c.course_id)
        .bind(c.complete)
        .bind(c.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn count_complete(&self, student_id: Uuid, course_id: Uuid) -> Result<u64> {
        let n: i64 = query_scalar(
            "SELECT COUNT(*) FROM module_completions \
             WHERE student_id = $1 AND course_id = $2 AND complete",
        )
        .bind(student_id)
        .bind(course_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count(n))
    }

    async fn for_student_course(
        &self,
        student_id: Uuid,
        course_id: Uuid,
    ) -> Result<Vec<ModuleCompletion>> {
        let rows = query_as::<_, CompletionRow>(
            "SELECT student_id, module_id, course_id, complete, completed_at \
             FROM module_completions WHERE student_id = $1 AND course_id = $2",
        )
        .bind(student_id)
        .bind(course_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ModuleCompletion::from).collect())
    }
}

#[async_trait]
impl LabStore for PgStore {
    async fn get(&self, id: Uuid) -> Result<Option<Lab>> {
        let row = query_as::<_, LabRow>("SELECT id, title FROM labs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| Lab { id: r.id, title: r.title }))
    }

    async fn list(&self) -> Result<Vec<Lab>> {
        let rows = query_as::<_, LabRow>("SELECT id, title FROM labs ORDER BY title, id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| Lab { id: r.id, title: r.title })
            .collect())
    }
}

#[async_trait]
impl LabGradeStore for PgStore {
    async fn get(&self, student_id: Uuid, lab_id: Uuid) -> Result<Option<LabGradeRecord>> {
        let sql =
            format!("SELECT {LAB_GRADE_COLS} FROM lab_grades WHERE student_id = $1 AND lab_id = $2");
        query_as::<_, LabGradeRow>(&sql)
            .bind(student_id)
            .bind(lab_id)
            .fetch_optional(&self.pool)
            .await?
            .map(LabGradeRecord::try_from)
            .transpose()
    }

    async fn create(&self, r: &LabGradeRecord) -> Result<()> {
        query(
            r#"
            INSERT INTO lab_grades (student_id, lab_id, grade, feedback, graded_by, created_at, updated_at)
            VALUES ($1,$2,$3,$4,$5,$6,$7)
            "#,
        )
        .bind(r.student_id)
        .bind(r.lab_id)
        .bind(r.grade.map(Grade::value))
        .bind(r.feedback.as_deref())
        .bind(r.graded_by)
        .bind(r.created_at)
        .bind(r.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|err| match Error::from(err) {
            Error::Conflict(_) => Error::Conflict("already enrolled in this lab".into()),
            other => other,
        })?;
        Ok(())
    }

    async fn update_grade(&self, r: &LabGradeRecord) -> Result<()> {
        let done = query(
            "UPDATE lab_grades SET grade = $3, feedback = $4, graded_by = $5, updated_at = $6 \
             WHERE student_id = $1 AND lab_id = $2",
        )
        .bind(r.student_id)
        .bind(r.lab_id)
        .bind(r.grade.map(Grade::value))
        .bind(r.feedback.as_deref())
        .bind(r.graded_by)
        .bind(r.updated_at)
        .execute(&self.pool)
        .await?;
        if done.rows_affected() == 0 {
            return Err(Error::not_found("lab enrollment"));
        }
        Ok(())
    }

    async fn ungraded_for_lab(&self, lab_id: Uuid) -> Result<Vec<LabGradeRecord>> {
        let sql = format!(
            "SELECT {LAB_GRADE_COLS} FROM lab_grades WHERE lab_id = $1 AND grade IS NULL ORDER BY created_at"
        );
        query_as::<_, LabGradeRow>(&sql)
            .bind(lab_id)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(LabGradeRecord::try_from)
            .collect()
    }

    async fn count_ungraded(&self, lab_id: Uuid) -> Result<u64> {
        let n: i64 =
            query_scalar("SELECT COUNT(*) FROM lab_grades WHERE lab_id = $1 AND grade IS NULL")
                .bind(lab_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count(n))
    }
}

#[async_trait]
impl CertificateStore for PgStore {
    async fn create(&self, c: &Certificate) -> Result<()> {
        query(
            r#"
            INSERT INTO certificates
                (id, student_id, course_id, lab_id, title, status, auto_issued, approved_by, approved_at, issued_at)
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)
            "#,
        )
        .bind(c.id)
        .bind(c.student_id)
        .bind(c.course_id)
        .bind(c.lab_id)
        .bind(&c.title)
        .bind(c.status.as_str())
        .bind(c.auto_issued)
        .bind(c.approved_by)
        .bind(c.approved_at)
        .bind(c.issued_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Certificate>> {
        let sql = format!("SELECT {CERT_COLS} FROM certificates WHERE id = $1");
        query_as::<_, CertificateRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Certificate::try_from)
            .transpose()
    }

    async fn pending(&self) -> Result<Vec<Certificate>> {
        let sql = format!(
            "SELECT {CERT_COLS} FROM certificates WHERE status = 'pending' ORDER BY issued_at"
        );
        query_as::<_, CertificateRow>(&sql)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Certificate::try_from)
            .collect()
    }

    async fn for_student(&self, student_id: Uuid) -> Result<Vec<Certificate>> {
        let sql = format!(
            "SELECT {CERT_COLS} FROM certificates WHERE student_id = $1 ORDER BY issued_at DESC"
        );
        query_as::<_, CertificateRow>(&sql)
            .bind(student_id)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Certificate::try_from)
            .collect()
    }

    async fn update_review(&self, c: &Certificate) -> Result<bool> {
        let done = query(
            "UPDATE certificates SET status = $2, approved_by = $3, approved_at = $4 \
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(c.id)
        .bind(c.status.as_str())
        .bind(c.approved_by)
        .bind(c.approved_at)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() > 0)
    }
}
