//! In-process backend. Used by the test suites and when the service runs
//! without `DATABASE_URL`.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::*;
use crate::error::{Error, Result};

/// Collaborator-owned records loaded at startup.
#[derive(Deserialize, Debug, Default)]
pub struct Seed {
    #[serde(default)]
    pub users: Vec<User>,
    #[serde(default)]
    pub courses: Vec<Course>,
    #[serde(default)]
    pub modules: Vec<Module>,
    #[serde(default)]
    pub labs: Vec<Lab>,
}

#[derive(Default)]
struct State {
    users: HashMap<Uuid, User>,
    courses: HashMap<Uuid, Course>,
    modules: HashMap<Uuid, Module>,
    labs: HashMap<Uuid, Lab>,
    enrollments: HashMap<(Uuid, Uuid), Enrollment>,
    completions: HashMap<(Uuid, Uuid), ModuleCompletion>,
    lab_grades: HashMap<(Uuid, Uuid), LabGradeRecord>,
    certificates: Vec<Certificate>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed(&self, seed: Seed) {
        let mut st = self.state.write().await;
        st.users.extend(seed.users.into_iter().map(|u| (u.id, u)));
        st.courses.extend(seed.courses.into_iter().map(|c| (c.id, c)));
        st.modules.extend(seed.modules.into_iter().map(|m| (m.id, m)));
        st.labs.extend(seed.labs.into_iter().map(|l| (l.id, l)));
    }

    pub async fn seed_from_file(&self, path: &Path) -> Result<()> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::Validation(format!("seed file {}: {e}", path.display())))?;
        let seed: Seed = serde_json::from_str(&raw)
            .map_err(|e| Error::Validation(format!("seed file {}: {e}", path.display())))?;
        tracing::info!(
            users = seed.users.len(),
            courses = seed.courses.len(),
            modules = seed.modules.len(),
            labs = seed.labs.len(),
            "seeded in-memory store"
        );
        self.seed(seed).await;
        Ok(())
    }

    pub async fn insert_user(&self, user: User) {
        self.state.write().await.users.insert(user.id, user);
    }

    pub async fn insert_course(&self, course: Course) {
        self.state.write().await.courses.insert(course.id, course);
    }

    pub async fn insert_module(&self, module: Module) {
        self.state.write().await.modules.insert(module.id, module);
    }

    pub async fn insert_lab(&self, lab: Lab) {
        self.state.write().await.labs.insert(lab.id, lab);
    }

    /// Every certificate ever created, in creation order.
    pub async fn all_certificates(&self) -> Vec<Certificate> {
        self.state.read().await.certificates.clone()
    }

    pub async fn lab_grade_count(&self, lab_id: Uuid) -> usize {
        self.state
            .read()
            .await
            .lab_grades
            .values()
            .filter(|r| r.lab_id == lab_id)
            .count()
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn get(&self, id: Uuid) -> Result<Option<User>> {
        Ok(self.state.read().await.users.get(&id).cloned())
    }

    async fn get_many(&self, ids: &[Uuid]) -> Result<Vec<User>> {
        let st = self.state.read().await;
        Ok(ids.iter().filter_map(|id| st.users.get(id).cloned()).collect())
    }
}

#[async_trait]
impl CourseStore for MemoryStore {
    async fn get(&self, id: Uuid) -> Result<Option<Course>> {
        Ok(self.state.read().await.courses.get(&id).cloned())
    }

    async fn by_instructor(&self, instructor_id: Uuid) -> Result<Vec<Course>> {
        let st = self.state.read().await;
        Ok(st
            .courses
            .values()
            .filter(|c| c.instructor_id == instructor_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ModuleStore for MemoryStore {
    async fn get(&self, id: Uuid) -> Result<Option<Module>> {
        Ok(self.state.read().await.modules.get(&id).cloned())
    }

    async fn count_in_course(&self, course_id: Uuid) -> Result<u64> {
        let st = self.state.read().await;
        Ok(st.modules.values().filter(|m| m.course_id == course_id).count() as u64)
    }

    async fn list_for_course(&self, course_id: Uuid) -> Result<Vec<Module>> {
        let st = self.state.read().await;
        let mut out: Vec<Module> = st
            .modules
            .values()
            .filter(|m| m.course_id == course_id)
            .cloned()
            .collect();
        out.sort_by_key(|m| (m.position, m.id));
        Ok(out)
    }
}

#[async_trait]
impl EnrollmentStore for MemoryStore {
    async fn create(&self, enrollment: &Enrollment) -> Result<()> {
        let mut st = self.state.write().await;
        let key = (enrollment.student_id, enrollment.course_id);
        if st.enrollments.contains_key(&key) {
            return Err(Error::Conflict("already enrolled in this course".into()));
        }
        st.enrollments.insert(key, enrollment.clone());
        Ok(())
    }

    async fn get(&self, student_id: Uuid, course_id: Uuid) -> Result<Option<Enrollment>> {
        let st = self.state.read().await;
        Ok(st.enrollments.get(&(student_id, course_id)).cloned())
    }

    async fn for_student(&self, student_id: Uuid) -> Result<Vec<Enrollment>> {
        let st = self.state.read().await;
        let mut out: Vec<Enrollment> = st
            .enrollments
            .values()
            .filter(|e| e.student_id == student_id)
            .cloned()
            .collect();
        out.sort_by_key(|e| e.created_at);
        Ok(out)
    }

    async fn count_for_course(&self, course_id: Uuid) -> Result<u64> {
        let st = self.state.read().await;
        Ok(st.enrollments.values().filter(|e| e.course_id == course_id).count() as u64)
    }

    async fn update_progress(&self, enrollment: &Enrollment) -> Result<()> {
        let mut st = self.state.write().await;
        let row = st
            .enrollments
            .get_mut(&(enrollment.student_id, enrollment.course_id))
            .ok_or_else(|| Error::not_found("enrollment"))?;
        row.progress = enrollment.progress;
        row.finished = enrollment.finished;
        row.updated_at = enrollment.updated_at;
        Ok(())
    }
}

#[async_trait]
impl CompletionStore for MemoryStore {
    async fn get(&self, student_id: Uuid, module_id: Uuid) -> Result<Option<ModuleCompletion>> {
        let st = self.state.read().await;
        Ok(st.completions.get(&(student_id, module_id)).cloned())
    }

    async fn upsert(&self, completion: &ModuleCompletion) -> Result<()> {
        let mut st = self.state.write().await;
        st.completions
            .entry((completion.student_id, completion.module_id))
            .and_modify(|c| {
                c.complete = completion.complete;
                c.completed_at = completion.completed_at;
            })
            .or_insert_with(|| completion.clone());
        Ok(())
    }

    async fn count_complete(&self, student_id: Uuid, course_id: Uuid) -> Result<u64> {
        let st = self.state.read().await;
        Ok(st
            .completions
            .values()
            .filter(|c| c.student_id == student_id && c.course_id == course_id && c.complete)
            .count() as u64)
    }

    async fn for_student_course(
        &self,
        student_id: Uuid,
        course_id: Uuid,
    ) -> Result<Vec<ModuleCompletion>> {
        let st = self.state.read().await;
        Ok(st
            .completions
            .values()
            .filter(|c| c.student_id == student_id && c.course_id == course_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl LabStore for MemoryStore {
    async fn get(&self, id: Uuid) -> Result<Option<Lab>> {
        Ok(self.state.read().await.labs.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<Lab>> {
        let st = self.state.read().await;
        let mut out: Vec<Lab> = st.labs.values().cloned().collect();
        out.sort_by(|a, b| a.title.cmp(&b.title).then(a.id.cmp(&b.id)));
        Ok(out)
    }
}

#[async_trait]
impl LabGradeStore for MemoryStore {
    async fn get(&self, student_id: Uuid, lab_id: Uuid) -> Result<Option<LabGradeRecord>> {
        let st = self.state.read().await;
        Ok(st.lab_grades.get(&(student_id, lab_id)).cloned())
    }

    async fn create(&self, record: &LabGradeRecord) -> Result<()> {
        let mut st = self.state.write().await;
        let key = (record.student_id, record.lab_id);
        if st.lab_grades.contains_key(&key) {
            return Err(Error::Conflict("already enrolled in this lab".into()));
        }
        st.lab_grades.insert(key, record.clone());
        Ok(())
    }

    async fn update_grade(&self, record: &LabGradeRecord) -> Result<()> {
        let mut st = self.state.write().await;
        let row = st
            .lab_grades
            .get_mut(&(record.student_id, record.lab_id))
            .ok_or_else(|| Error::not_found("lab enrollment"))?;
        row.grade = record.grade;
        row.feedback = record.feedback.clone();
        row.graded_by = record.graded_by;
        row.updated_at = record.updated_at;
        Ok(())
    }

    async fn ungraded_for_lab(&self, lab_id: Uuid) -> Result<Vec<LabGradeRecord>> {
        let st = self.state.read().await;
        let mut out: Vec<LabGradeRecord> = st
            .lab_grades
            .values()
            .filter(|r| r.lab_id == lab_id && r.grade.is_none())
            .cloned()
            .collect();
        out.sort_by_key(|r| r.created_at);
        Ok(out)
    }

    async fn count_ungraded(&self, lab_id: Uuid) -> Result<u64> {
        let st = self.state.read().await;
        Ok(st
            .lab_grades
            .values()
            .filter(|r| r.lab_id == lab_id && r.grade.is_none())
            .count() as u64)
    }
}

#[async_trait]
impl CertificateStore for MemoryStore {
    async fn create(&self, cert: &Certificate) -> Result<()> {
        self.state.write().await.certificates.push(cert.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Certificate>> {
        let st = self.state.read().await;
        Ok(st.certificates.iter().find(|c| c.id == id).cloned())
    }

    async fn pending(&self) -> Result<Vec<Certificate>> {
        let st = self.state.read().await;
        Ok(st
            .certificates
            .iter()
            .filter(|c| c.status == CertificateStatus::Pending)
            .cloned()
            .collect())
    }

    async fn for_student(&self, student_id: Uuid) -> Result<Vec<Certificate>> {
        let st = self.state.read().await;
        // creation order reversed keeps ties stable when timestamps collide
        let mut out: Vec<Certificate> = st
            .certificates
            .iter()
            .rev()
            .filter(|c| c.student_id == student_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.issued_at.cmp(&a.issued_at));
        Ok(out)
    }

    async fn update_review(&self, cert: &Certificate) -> Result<bool> {
        let mut st = self.state.write().await;
        let Some(row) = st
            .certificates
            .iter_mut()
            .find(|c| c.id == cert.id && c.status == CertificateStatus::Pending)
        else {
            return Ok(false);
        };
        row.status = cert.status;
        row.approved_by = cert.approved_by;
        row.approved_at = cert.approved_at;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn completion_upsert_keeps_one_row_per_module() {
        let store = MemoryStore::new();
        let (student, module, course) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let mut c = ModuleCompletion {
            student_id: student,
            module_id: module,
            course_id: course,
            complete: false,
            completed_at: Utc::now(),
        };
        CompletionStore::upsert(&store, &c).await.unwrap();
        c.complete = true;
        CompletionStore::upsert(&store, &c).await.unwrap();
        CompletionStore::upsert(&store, &c).await.unwrap();

        assert_eq!(store.count_complete(student, course).await.unwrap(), 1);
        assert_eq!(store.for_student_course(student, course).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn review_write_applies_only_to_pending() {
        let store = MemoryStore::new();
        let cert = Certificate::pending(Uuid::new_v4(), None, "Honours", false);
        CertificateStore::create(&store, &cert).await.unwrap();

        let mut approved = cert.clone();
        approved.status = CertificateStatus::Approved;
        approved.approved_by = Some(Uuid::new_v4());
        approved.approved_at = Some(Utc::now());
        assert!(store.update_review(&approved).await.unwrap());

        let mut rejected = cert.clone();
        rejected.status = CertificateStatus::Rejected;
        rejected.approved_by = Some(Uuid::new_v4());
        assert!(!store.update_review(&rejected).await.unwrap());

        let stored = CertificateStore::get(&store, cert.id).await.unwrap().unwrap();
        assert_eq!(stored, approved);
        assert!(!store.update_review(&Certificate::pending(Uuid::new_v4(), None, "x", false)).await.unwrap());
    }

    #[tokio::test]
    async fn duplicate_enrollment_conflicts() {
        let store = MemoryStore::new();
        let e = Enrollment::new(Uuid::new_v4(), Uuid::new_v4());
        EnrollmentStore::create(&store, &e).await.unwrap();
        let again = Enrollment::new(e.student_id, e.course_id);
        assert!(matches!(
            EnrollmentStore::create(&store, &again).await,
            Err(Error::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn modules_listed_by_position() {
        let store = MemoryStore::new();
        let course = Uuid::new_v4();
        for (title, position) in [("third", 3), ("first", 1), ("second", 2)] {
            store
                .insert_module(Module {
                    id: Uuid::new_v4(),
                    course_id: course,
                    title: title.into(),
                    position,
                })
                .await;
        }
        let titles: Vec<String> = store
            .list_for_course(course)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.title)
            .collect();
        assert_eq!(titles, ["first", "second", "third"]);
        assert_eq!(store.count_in_course(course).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn seed_parses_fixture_json() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        let seed: Seed = serde_json::from_value(serde_json::json!({
            "users": [{ "id": id, "name": "Ana", "email": "ana@example.com", "role": "instructor" }]
        }))
        .unwrap();
        store.seed(seed).await;
        let user = UserStore::get(&store, id).await.unwrap().unwrap();
        assert_eq!(user.role, Role::Instructor);
    }
}
