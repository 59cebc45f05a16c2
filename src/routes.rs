use std::sync::Arc;

use axum::{
    async_trait,
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::dashboard::{InstructorDashboard, StudentDashboard};
use crate::lab::GradeOutcome;
use crate::models::*;
use crate::progress::CompletionOutcome;
use crate::Engine;

/// Authenticated principal, set by the gateway in front of this service.
pub const CALLER_HEADER: &str = "x-user-id";

type AppState = Arc<Engine>;
type Reply<T> = Result<Json<T>, (StatusCode, String)>;

pub fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        // course progress
        .route("/api/courses/:course_id/enroll", post(enroll_course))
        .route("/api/courses/:course_id/modules", get(course_modules))
        .route("/api/modules/complete", post(mark_complete))
        .route("/api/me/enrollments", get(my_enrollments))
        // labs
        .route("/api/labs/ungraded", get(labs_ungraded))
        .route("/api/labs/grade", post(submit_grade))
        .route("/api/labs/:lab_id/enroll", post(enroll_lab))
        .route("/api/labs/:lab_id/ungraded", get(ungraded_students))
        .route("/api/labs/:lab_id/ungraded/count", get(ungraded_count))
        // certificates
        .route("/api/certificates", post(generate_certificate))
        .route("/api/certificates/pending", get(pending_certificates))
        .route("/api/certificates/:cert_id/approve", post(approve_certificate))
        .route("/api/certificates/:cert_id/reject", post(reject_certificate))
        .route("/api/me/certificates", get(my_certificates))
        // dashboards
        .route("/api/dashboard/student", get(student_dashboard))
        .route("/api/dashboard/instructor", get(instructor_dashboard))
        .with_state(engine)
}

pub struct Caller(pub Uuid);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = (StatusCode, String);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(CALLER_HEADER)
            .ok_or_else(|| e400("x-user-id header is required"))?;
        raw.to_str()
            .ok()
            .and_then(|s| Uuid::parse_str(s.trim()).ok())
            .map(Caller)
            .ok_or_else(|| e400("x-user-id must be a UUID"))
    }
}

async fn enroll_course(
    State(engine): State<AppState>,
    Caller(student): Caller,
    Path(course_id): Path<Uuid>,
) -> Reply<Enrollment> {
    Ok(Json(engine.progress.enroll(student, course_id).await?))
}

async fn course_modules(
    State(engine): State<AppState>,
    Caller(student): Caller,
    Path(course_id): Path<Uuid>,
) -> Reply<Vec<ModuleWithProgress>> {
    Ok(Json(engine.progress.modules_with_progress(student, course_id).await?))
}

async fn mark_complete(
    State(engine): State<AppState>,
    Caller(student): Caller,
    Json(req): Json<MarkCompleteReq>,
) -> Reply<CompletionOutcome> {
    let out = engine
        .progress
        .mark_module_complete(student, req.module_id, req.course_id)
        .await?;
    Ok(Json(out))
}

async fn my_enrollments(
    State(engine): State<AppState>,
    Caller(student): Caller,
) -> Reply<Vec<EnrollmentWithProgress>> {
    Ok(Json(engine.progress.student_enrollments(student).await?))
}

async fn enroll_lab(
    State(engine): State<AppState>,
    Caller(student): Caller,
    Path(lab_id): Path<Uuid>,
) -> Reply<LabGradeRecord> {
    Ok(Json(engine.labs.enroll(student, lab_id).await?))
}

async fn submit_grade(
    State(engine): State<AppState>,
    Caller(instructor): Caller,
    Json(req): Json<SubmitGradeReq>,
) -> Reply<GradeOutcome> {
    let out = engine
        .labs
        .submit_grade(instructor, req.student_id, req.lab_id, req.grade, &req.feedback)
        .await?;
    Ok(Json(out))
}

async fn labs_ungraded(
    State(engine): State<AppState>,
    Caller(_): Caller,
) -> Reply<Vec<LabWithUngradedCount>> {
    Ok(Json(engine.labs.labs_with_ungraded_count().await?))
}

async fn ungraded_students(
    State(engine): State<AppState>,
    Caller(_): Caller,
    Path(lab_id): Path<Uuid>,
) -> Reply<Vec<UngradedStudent>> {
    Ok(Json(engine.labs.ungraded_students(lab_id).await?))
}

async fn ungraded_count(
    State(engine): State<AppState>,
    Caller(_): Caller,
    Path(lab_id): Path<Uuid>,
) -> Reply<serde_json::Value> {
    let n = engine.labs.count_ungraded(lab_id).await?;
    Ok(Json(serde_json::json!({ "lab_id": lab_id, "ungraded_count": n })))
}

async fn generate_certificate(
    State(engine): State<AppState>,
    Caller(issuer): Caller,
    Json(req): Json<GenerateCertificateReq>,
) -> Reply<Certificate> {
    let cert = engine
        .approval
        .generate(issuer, req.student_id, req.course_id, req.lab_id, &req.title)
        .await?;
    Ok(Json(cert))
}

async fn pending_certificates(
    State(engine): State<AppState>,
    Caller(reviewer): Caller,
) -> Reply<Vec<Certificate>> {
    Ok(Json(engine.approval.pending_for_reviewer(reviewer).await?))
}

async fn approve_certificate(
    State(engine): State<AppState>,
    Caller(reviewer): Caller,
    Path(cert_id): Path<Uuid>,
) -> Reply<Certificate> {
    Ok(Json(engine.approval.approve(cert_id, reviewer).await?))
}

async fn reject_certificate(
    State(engine): State<AppState>,
    Caller(reviewer): Caller,
    Path(cert_id): Path<Uuid>,
) -> Reply<Certificate> {
    Ok(Json(engine.approval.reject(cert_id, reviewer).await?))
}

#[derive(Deserialize, Debug, Default)]
struct CertificateQuery {
    #[serde(default)]
    latest: bool,
}

async fn my_certificates(
    State(engine): State<AppState>,
    Caller(student): Caller,
    Query(q): Query<CertificateQuery>,
) -> Reply<Vec<Certificate>> {
    let certs = if q.latest {
        engine.approval.latest_for_student(student).await?
    } else {
        engine.approval.for_student(student).await?
    };
    Ok(Json(certs))
}

async fn student_dashboard(
    State(engine): State<AppState>,
    Caller(student): Caller,
) -> Reply<StudentDashboard> {
    Ok(Json(engine.dashboards.student(student).await?))
}

async fn instructor_dashboard(
    State(engine): State<AppState>,
    Caller(instructor): Caller,
) -> Reply<InstructorDashboard> {
    Ok(Json(engine.dashboards.instructor(instructor).await?))
}

// --- helpers ---
fn e400<T: Into<String>>(msg: T) -> (StatusCode, String) {
    (StatusCode::BAD_REQUEST, msg.into())
}
