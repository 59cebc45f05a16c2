//! Certificate issuance as a side effect of crossing a completion threshold.
//!
//! Issuance is best-effort: the progress or grade write that caused it is the
//! source of truth and is never rolled back when the certificate insert fails.
//! Failures are logged; a reconciliation job can re-issue from enrollments with
//! `finished = true` and passing lab grades that lack a certificate.

use std::{str::FromStr, sync::Arc};

use tracing::{debug, error, info};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{Certificate, CertificateSubject, Grade};
use crate::retry::RetryPolicy;
use crate::store::CertificateStore;

pub const COURSE_CERTIFICATE_TITLE: &str = "Course Completion Certificate";
pub const LAB_CERTIFICATE_TITLE: &str = "Lab Completion Certificate";

/// Whether issuance runs on the caller's task or on a spawned one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueMode {
    Inline,
    Background,
}

impl FromStr for IssueMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inline" => Ok(IssueMode::Inline),
            "background" => Ok(IssueMode::Background),
            other => Err(Error::Validation(format!("CERT_ISSUE_MODE {other:?}"))),
        }
    }
}

#[derive(Clone)]
pub struct CertificationTrigger {
    certificates: Arc<dyn CertificateStore>,
    retry: RetryPolicy,
    mode: IssueMode,
    pass_threshold: f64,
}

impl CertificationTrigger {
    pub fn new(
        certificates: Arc<dyn CertificateStore>,
        retry: RetryPolicy,
        mode: IssueMode,
        pass_threshold: f64,
    ) -> Self {
        Self {
            certificates,
            retry,
            mode,
            pass_threshold,
        }
    }

    /// Called once per false→true transition of `enrollment.finished`.
    pub async fn course_completed(&self, student_id: Uuid, course_id: Uuid) {
        info!(student = %student_id, course = %course_id, "course completed, issuing certificate");
        let cert = Certificate::pending(
            student_id,
            Some(CertificateSubject::Course(course_id)),
            COURSE_CERTIFICATE_TITLE,
            true,
        );
        self.dispatch(cert).await;
    }

    /// Issues a lab certificate when `grade` meets the pass threshold.
    /// Returns whether an issuance attempt was made.
    pub async fn lab_graded(&self, student_id: Uuid, lab_id: Uuid, grade: Grade) -> bool {
        if !grade.passes(self.pass_threshold) {
            debug!(student = %student_id, lab = %lab_id, %grade, "grade below pass threshold");
            return false;
        }
        info!(student = %student_id, lab = %lab_id, %grade, "lab passed, issuing certificate");
        let cert = Certificate::pending(
            student_id,
            Some(CertificateSubject::Lab(lab_id)),
            LAB_CERTIFICATE_TITLE,
            true,
        );
        self.dispatch(cert).await;
        true
    }

    async fn dispatch(&self, cert: Certificate) {
        match self.mode {
            IssueMode::Inline => issue(self.certificates.as_ref(), self.retry, cert).await,
            IssueMode::Background => {
                let store = self.certificates.clone();
                let retry = self.retry;
                tokio::spawn(async move { issue(store.as_ref(), retry, cert).await });
            }
        }
    }
}

async fn issue(store: &dyn CertificateStore, retry: RetryPolicy, cert: Certificate) {
    if let Some(CertificateSubject::Course(course_id)) = cert.subject() {
        // at most one auto-issued certificate per (student, course)
        match store.for_student(cert.student_id).await {
            Ok(existing)
                if existing
                    .iter()
                    .any(|c| c.auto_issued && c.course_id == Some(course_id)) =>
            {
                debug!(student = %cert.student_id, course = %course_id, "course certificate already issued");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                error!(student = %cert.student_id, course = %course_id, error = %e, "certificate lookup failed, not issuing");
                return;
            }
        }
    }

    // a lost acknowledgement can duplicate the row; duplicates are tolerated downstream
    match retry.run("certificate.create", || store.create(&cert)).await {
        Ok(()) => info!(
            certificate = %cert.id,
            student = %cert.student_id,
            title = %cert.title,
            "pending certificate created"
        ),
        Err(e) => error!(
            student = %cert.student_id,
            course = ?cert.course_id,
            lab = ?cert.lab_id,
            error = %e,
            "certificate issuance failed"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CertificateStatus;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::time::Duration;

    fn trigger(store: Arc<dyn CertificateStore>, mode: IssueMode) -> CertificationTrigger {
        CertificationTrigger::new(store, RetryPolicy::once(), mode, 75.0)
    }

    #[tokio::test]
    async fn course_completion_creates_pending_certificate() {
        let store = Arc::new(MemoryStore::new());
        let (student, course) = (Uuid::new_v4(), Uuid::new_v4());
        trigger(store.clone(), IssueMode::Inline)
            .course_completed(student, course)
            .await;

        let certs = store.all_certificates().await;
        assert_eq!(certs.len(), 1);
        assert_eq!(certs[0].course_id, Some(course));
        assert_eq!(certs[0].lab_id, None);
        assert_eq!(certs[0].status, CertificateStatus::Pending);
        assert_eq!(certs[0].title, COURSE_CERTIFICATE_TITLE);
        assert!(certs[0].auto_issued);
    }

    #[tokio::test]
    async fn course_certificate_not_issued_twice() {
        let store = Arc::new(MemoryStore::new());
        let t = trigger(store.clone(), IssueMode::Inline);
        let (student, course) = (Uuid::new_v4(), Uuid::new_v4());
        t.course_completed(student, course).await;
        t.course_completed(student, course).await;
        assert_eq!(store.all_certificates().await.len(), 1);
    }

    #[tokio::test]
    async fn lab_threshold_decides_issuance() {
        let store = Arc::new(MemoryStore::new());
        let t = trigger(store.clone(), IssueMode::Inline);
        let lab = Uuid::new_v4();

        assert!(!t.lab_graded(Uuid::new_v4(), lab, Grade::new(74.0).unwrap()).await);
        assert!(store.all_certificates().await.is_empty());

        let passing = Uuid::new_v4();
        assert!(t.lab_graded(passing, lab, Grade::new(75.0).unwrap()).await);
        let certs = store.all_certificates().await;
        assert_eq!(certs.len(), 1);
        assert_eq!(certs[0].student_id, passing);
        assert_eq!(certs[0].lab_id, Some(lab));
    }

    #[tokio::test]
    async fn lab_passes_are_not_deduplicated() {
        let store = Arc::new(MemoryStore::new());
        let t = trigger(store.clone(), IssueMode::Inline);
        let (student, lab) = (Uuid::new_v4(), Uuid::new_v4());
        let grade = Grade::new(90.0).unwrap();
        t.lab_graded(student, lab, grade).await;
        t.lab_graded(student, lab, grade).await;
        assert_eq!(store.all_certificates().await.len(), 2);
    }

    #[tokio::test]
    async fn background_mode_issues_eventually() {
        let store = Arc::new(MemoryStore::new());
        trigger(store.clone(), IssueMode::Background)
            .course_completed(Uuid::new_v4(), Uuid::new_v4())
            .await;

        for _ in 0..100 {
            if !store.all_certificates().await.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("background issuance never landed");
    }

    struct BrokenCertificates;

    #[async_trait]
    impl CertificateStore for BrokenCertificates {
        async fn create(&self, _: &Certificate) -> Result<()> {
            Err(Error::Store("insert refused".into()))
        }
        async fn get(&self, _: Uuid) -> Result<Option<Certificate>> {
            Ok(None)
        }
        async fn pending(&self) -> Result<Vec<Certificate>> {
            Ok(vec![])
        }
        async fn for_student(&self, _: Uuid) -> Result<Vec<Certificate>> {
            Ok(vec![])
        }
        async fn update_review(&self, _: &Certificate) -> Result<bool> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn insert_failure_is_swallowed() {
        let t = trigger(Arc::new(BrokenCertificates), IssueMode::Inline);
        // no panic, no error surfaced; the attempt is still reported
        assert!(t.lab_graded(Uuid::new_v4(), Uuid::new_v4(), Grade::new(80.0).unwrap()).await);
    }

    #[test]
    fn issue_mode_parses() {
        assert_eq!("Inline".parse::<IssueMode>().unwrap(), IssueMode::Inline);
        assert_eq!("background".parse::<IssueMode>().unwrap(), IssueMode::Background);
        assert!("later".parse::<IssueMode>().is_err());
    }
}
