//! Read-only views composed from the workflows. Nothing here writes.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use crate::approval::{latest_per_subject, require_staff, CertificateApproval};
use crate::error::Result;
use crate::lab::LabGrading;
use crate::models::*;
use crate::progress::ProgressAggregator;
use crate::store::Stores;

const RECENT_CERTIFICATES: usize = 3;

#[derive(Serialize, Debug, Clone)]
pub struct StudentDashboard {
    pub total_enrollments: usize,
    pub completed_courses: usize,
    pub in_progress_courses: usize,
    pub ongoing: Vec<EnrollmentWithProgress>,
    pub total_certificates: usize,
    pub recent_certificates: Vec<Certificate>,
}

#[derive(Serialize, Debug, Clone)]
pub struct InstructorDashboard {
    pub total_courses: usize,
    pub total_students: u64,
    pub pending_certificates: Vec<Certificate>,
    pub ungraded_labs: Vec<LabWithUngradedCount>,
}

pub struct Dashboards {
    stores: Stores,
    progress: Arc<ProgressAggregator>,
    approval: Arc<CertificateApproval>,
    labs: Arc<LabGrading>,
}

impl Dashboards {
    pub fn new(
        stores: Stores,
        progress: Arc<ProgressAggregator>,
        approval: Arc<CertificateApproval>,
        labs: Arc<LabGrading>,
    ) -> Self {
        Self {
            stores,
            progress,
            approval,
            labs,
        }
    }

    pub async fn student(&self, student_id: Uuid) -> Result<StudentDashboard> {
        let enrollments = self.progress.student_enrollments(student_id).await?;
        let completed_courses = enrollments.iter().filter(|e| e.enrollment.finished).count();
        let total_enrollments = enrollments.len();
        let ongoing: Vec<_> = enrollments
            .into_iter()
            .filter(|e| !e.enrollment.finished)
            .collect();

        let certificates = self
            .approval
            .for_student(student_id)
            .await
            .unwrap_or_else(|e| {
                warn!(student = %student_id, error = %e, "certificates unavailable");
                Vec::new()
            });
        let total_certificates = certificates.len();
        let mut recent_certificates = latest_per_subject(certificates);
        recent_certificates.truncate(RECENT_CERTIFICATES);

        Ok(StudentDashboard {
            total_enrollments,
            completed_courses,
            in_progress_courses: ongoing.len(),
            ongoing,
            total_certificates,
            recent_certificates,
        })
    }

    /// Pending certificates are filtered here, not in the approval workflow:
    /// course certificates for the instructor's own courses, plus every lab
    /// certificate since labs have no owning instructor.
    pub async fn instructor(&self, instructor_id: Uuid) -> Result<InstructorDashboard> {
        require_staff(&self.stores, instructor_id, "view the instructor dashboard").await?;
        let courses = self.stores.courses.by_instructor(instructor_id).await?;

        let mut total_students = 0;
        for course in &courses {
            total_students += self
                .stores
                .enrollments
                .count_for_course(course.id)
                .await
                .unwrap_or_else(|e| {
                    warn!(course = %course.id, error = %e, "enrollment count unavailable");
                    0
                });
        }

        let own: HashSet<Uuid> = courses.iter().map(|c| c.id).collect();
        let pending_certificates = self
            .approval
            .pending()
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "pending certificates unavailable");
                Vec::new()
            })
            .into_iter()
            .filter(|c| match c.subject() {
                Some(CertificateSubject::Course(id)) => own.contains(&id),
                Some(CertificateSubject::Lab(_)) => true,
                None => false,
            })
            .collect();

        let ungraded_labs = self
            .labs
            .labs_with_ungraded_count()
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "lab listing unavailable");
                Vec::new()
            })
            .into_iter()
            .filter(|l| l.ungraded_count > 0)
            .collect();

        Ok(InstructorDashboard {
            total_courses: courses.len(),
            total_students,
            pending_certificates,
            ungraded_labs,
        })
    }
}
