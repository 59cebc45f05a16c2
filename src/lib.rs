//! Progress and certification engine for the learning platform.
//!
//! Tracks module completion and lab grades, derives enrollment progress,
//! issues pending certificates when completion thresholds are crossed, and
//! runs the review workflow over those certificates.

use std::sync::Arc;

pub mod approval;
pub mod certification;
pub mod config;
pub mod dashboard;
pub mod db;
pub mod error;
pub mod lab;
pub mod models;
pub mod progress;
pub mod retry;
pub mod routes;
pub mod store;

use approval::CertificateApproval;
use certification::CertificationTrigger;
use config::Config;
use dashboard::Dashboards;
use lab::LabGrading;
use progress::ProgressAggregator;
use store::Stores;

pub use error::{Error, Result};

/// The workflows, wired over one set of stores.
pub struct Engine {
    pub progress: Arc<ProgressAggregator>,
    pub approval: Arc<CertificateApproval>,
    pub labs: Arc<LabGrading>,
    pub dashboards: Dashboards,
}

impl Engine {
    pub fn new(stores: Stores, config: &Config) -> Self {
        let trigger = CertificationTrigger::new(
            stores.certificates.clone(),
            config.retry,
            config.issue_mode,
            config.lab_pass_threshold,
        );
        let progress = Arc::new(ProgressAggregator::new(
            stores.clone(),
            trigger.clone(),
            config.retry,
        ));
        let approval = Arc::new(CertificateApproval::new(stores.clone(), config.retry));
        let labs = Arc::new(LabGrading::new(stores.clone(), trigger, config.retry));
        let dashboards = Dashboards::new(stores, progress.clone(), approval.clone(), labs.clone());
        Self {
            progress,
            approval,
            labs,
            dashboards,
        }
    }
}
