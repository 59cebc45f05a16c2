//! Review of issued certificates: `pending -> approved | rejected`.
//!
//! Approved and rejected are terminal. Repeating the decision already taken
//! is a no-op; reversing it is a conflict.

use std::collections::HashSet;

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::*;
use crate::retry::RetryPolicy;
use crate::store::Stores;

pub struct CertificateApproval {
    stores: Stores,
    retry: RetryPolicy,
}

impl CertificateApproval {
    pub fn new(stores: Stores, retry: RetryPolicy) -> Self {
        Self { stores, retry }
    }

    pub async fn approve(&self, cert_id: Uuid, reviewer_id: Uuid) -> Result<Certificate> {
        self.review(cert_id, reviewer_id, CertificateStatus::Approved).await
    }

    pub async fn reject(&self, cert_id: Uuid, reviewer_id: Uuid) -> Result<Certificate> {
        self.review(cert_id, reviewer_id, CertificateStatus::Rejected).await
    }

    async fn review(
        &self,
        cert_id: Uuid,
        reviewer_id: Uuid,
        target: CertificateStatus,
    ) -> Result<Certificate> {
        require_staff(&self.stores, reviewer_id, "review certificates").await?;

        let mut cert = self
            .stores
            .certificates
            .get(cert_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("certificate {cert_id}")))?;

        if cert.status.is_terminal() {
            return settled(cert, target);
        }

        cert.status = target;
        cert.approved_by = Some(reviewer_id);
        cert.approved_at = Some(Utc::now());

        let certificates = &self.stores.certificates;
        let snapshot = &cert;
        let applied = self
            .retry
            .run("certificate.update_review", || certificates.update_review(snapshot))
            .await?;
        if !applied {
            // reviewed concurrently, or the write landed on an earlier attempt
            let current = certificates
                .get(cert_id)
                .await?
                .ok_or_else(|| Error::not_found(format!("certificate {cert_id}")))?;
            return settled(current, target);
        }
        info!(certificate = %cert_id, reviewer = %reviewer_id, status = %target, "certificate reviewed");
        Ok(cert)
    }

    /// Every pending certificate in the system. Scoping to a reviewer's own
    /// courses is left to the caller.
    pub async fn pending(&self) -> Result<Vec<Certificate>> {
        self.stores.certificates.pending().await
    }

    /// [`pending`](Self::pending) behind the reviewer role check.
    pub async fn pending_for_reviewer(&self, reviewer_id: Uuid) -> Result<Vec<Certificate>> {
        require_staff(&self.stores, reviewer_id, "list pending certificates").await?;
        self.pending().await
    }

    /// Instructor-initiated issuance, outside the completion triggers.
    pub async fn generate(
        &self,
        issuer_id: Uuid,
        student_id: Uuid,
        course_id: Option<Uuid>,
        lab_id: Option<Uuid>,
        title: &str,
    ) -> Result<Certificate> {
        require_staff(&self.stores, issuer_id, "issue certificates").await?;

        let title = title.trim();
        if title.is_empty() {
            return Err(Error::Validation("certificate title: must not be empty".into()));
        }
        let subject = match (course_id, lab_id) {
            (Some(_), Some(_)) => {
                return Err(Error::Validation(
                    "certificate subject: course and lab are mutually exclusive".into(),
                ))
            }
            (Some(c), None) => Some(CertificateSubject::Course(c)),
            (None, Some(l)) => Some(CertificateSubject::Lab(l)),
            (None, None) => None,
        };

        if self.stores.users.get(student_id).await?.is_none() {
            return Err(Error::not_found(format!("user {student_id}")));
        }
        match subject {
            Some(CertificateSubject::Course(c)) => {
                if self.stores.courses.get(c).await?.is_none() {
                    return Err(Error::not_found(format!("course {c}")));
                }
            }
            Some(CertificateSubject::Lab(l)) => {
                if self.stores.labs.get(l).await?.is_none() {
                    return Err(Error::not_found(format!("lab {l}")));
                }
            }
            None => {}
        }

        let cert = Certificate::pending(student_id, subject, title, false);
        self.stores.certificates.create(&cert).await?;
        info!(certificate = %cert.id, student = %student_id, issuer = %issuer_id, "certificate generated");
        Ok(cert)
    }

    /// Newest first, duplicates included.
    pub async fn for_student(&self, student_id: Uuid) -> Result<Vec<Certificate>> {
        self.stores.certificates.for_student(student_id).await
    }

    /// Newest certificate per subject; the display rule for tolerated duplicates.
    pub async fn latest_for_student(&self, student_id: Uuid) -> Result<Vec<Certificate>> {
        Ok(latest_per_subject(self.for_student(student_id).await?))
    }
}

/// Outcome of a review against a certificate that is no longer pending.
fn settled(cert: Certificate, target: CertificateStatus) -> Result<Certificate> {
    if cert.status == target {
        debug!(certificate = %cert.id, status = %target, "review repeated, nothing to do");
        return Ok(cert);
    }
    Err(Error::Conflict(format!(
        "certificate {} is already {}",
        cert.id, cert.status
    )))
}

/// Keeps the most recently issued certificate for each subject, newest first.
/// Certificates without a subject are grouped by title.
pub fn latest_per_subject(mut certs: Vec<Certificate>) -> Vec<Certificate> {
    #[derive(PartialEq, Eq, Hash)]
    enum Key {
        Subject(CertificateSubject),
        Title(String),
    }

    // stable sort keeps store order among equal timestamps
    certs.sort_by(|a, b| b.issued_at.cmp(&a.issued_at));
    let mut seen = HashSet::new();
    certs.retain(|c| {
        let key = match c.subject() {
            Some(s) => Key::Subject(s),
            None => Key::Title(c.title.clone()),
        };
        seen.insert(key)
    });
    certs
}

/// Resolves the user and checks for an instructor or admin role.
pub(crate) async fn require_staff(stores: &Stores, user_id: Uuid, action: &str) -> Result<User> {
    let user = stores
        .users
        .get(user_id)
        .await?
        .ok_or_else(|| Error::Authorization(format!("unknown user {user_id} cannot {action}")))?;
    if !user.role.is_staff() {
        return Err(Error::Authorization(format!(
            "only instructors and admins can {action}"
        )));
    }
    Ok(user)
}
