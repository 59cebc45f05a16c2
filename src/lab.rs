//! Lab enrollment and grading: `unenrolled -> enrolled-ungraded -> graded`.
//!
//! Grades are numeric on the 0–100 scale. A record is created by enrollment
//! and only ever updated by grading.

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::approval::require_staff;
use crate::certification::CertificationTrigger;
use crate::error::{Error, Result};
use crate::models::*;
use crate::retry::RetryPolicy;
use crate::store::Stores;

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct GradeOutcome {
    pub record: LabGradeRecord,
    /// Whether the grade passed and a certificate issuance was attempted.
    pub certificate_triggered: bool,
}

pub struct LabGrading {
    stores: Stores,
    trigger: CertificationTrigger,
    retry: RetryPolicy,
}

impl LabGrading {
    pub fn new(stores: Stores, trigger: CertificationTrigger, retry: RetryPolicy) -> Self {
        Self {
            stores,
            trigger,
            retry,
        }
    }

    pub async fn enroll(&self, student_id: Uuid, lab_id: Uuid) -> Result<LabGradeRecord> {
        if self.stores.lab_grades.get(student_id, lab_id).await?.is_some() {
            return Err(Error::Conflict("already enrolled in this lab".into()));
        }
        if self.stores.labs.get(lab_id).await?.is_none() {
            return Err(Error::not_found(format!("lab {lab_id}")));
        }
        let record = LabGradeRecord::enrolled(student_id, lab_id);
        self.stores.lab_grades.create(&record).await?;
        info!(student = %student_id, lab = %lab_id, "enrolled in lab");
        Ok(record)
    }

    /// Grades an enrolled student. A student with no record is rejected with
    /// `NotFound`; no record is created on their behalf.
    pub async fn submit_grade(
        &self,
        instructor_id: Uuid,
        student_id: Uuid,
        lab_id: Uuid,
        grade: f64,
        feedback: &str,
    ) -> Result<GradeOutcome> {
        require_staff(&self.stores, instructor_id, "grade labs").await?;
        let grade = Grade::new(grade)?;

        let mut record = self
            .stores
            .lab_grades
            .get(student_id, lab_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("lab enrollment for student {student_id}")))?;

        record.grade = Some(grade);
        record.feedback = Some(feedback.to_string());
        record.graded_by = Some(instructor_id);
        record.updated_at = Utc::now();

        let lab_grades = &self.stores.lab_grades;
        let snapshot = &record;
        self.retry
            .run("lab_grade.update", || lab_grades.update_grade(snapshot))
            .await?;
        info!(student = %student_id, lab = %lab_id, %grade, grader = %instructor_id, "lab graded");

        let certificate_triggered = self.trigger.lab_graded(student_id, lab_id, grade).await;
        Ok(GradeOutcome {
            record,
            certificate_triggered,
        })
    }

    pub async fn count_ungraded(&self, lab_id: Uuid) -> Result<u64> {
        self.stores.lab_grades.count_ungraded(lab_id).await
    }

    pub async fn ungraded_students(&self, lab_id: Uuid) -> Result<Vec<UngradedStudent>> {
        let ids: Vec<Uuid> = self
            .stores
            .lab_grades
            .ungraded_for_lab(lab_id)
            .await?
            .into_iter()
            .map(|r| r.student_id)
            .collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let users = self.stores.users.get_many(&ids).await?;
        Ok(users.into_iter().map(UngradedStudent::from).collect())
    }

    /// Every lab with its ungraded count. A failed count reads as zero.
    pub async fn labs_with_ungraded_count(&self) -> Result<Vec<LabWithUngradedCount>> {
        let labs = self.stores.labs.list().await?;
        let mut out = Vec::with_capacity(labs.len());
        for lab in labs {
            let ungraded_count = self
                .stores
                .lab_grades
                .count_ungraded(lab.id)
                .await
                .unwrap_or_else(|e| {
                    warn!(lab = %lab.id, error = %e, "ungraded count unavailable");
                    0
                });
            out.push(LabWithUngradedCount {
                lab,
                ungraded_count,
            });
        }
        Ok(out)
    }
}
