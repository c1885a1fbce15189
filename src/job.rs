//! Composite job records and state transitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::compositor::{CompositeOutcome, StrategyAttempt};
use crate::layers::LayerReport;
use crate::strategy::{PageSize, Strategy};

/// Record of one composite request, kept for status lookups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositeJob {
    pub job_id: String,
    pub layer_name: String,
    pub dpi: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_strategy: Option<Strategy>,
    pub template: UploadInfo,
    pub artwork: UploadInfo,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<Strategy>,
    #[serde(default)]
    pub attempts: Vec<StrategyAttempt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_size: Option<PageSize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layers: Option<LayerReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_bytes: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error: Option<String>,
}

/// What the client uploaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadInfo {
    pub file_name: String,
    pub content_type: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Complete,
    Failed,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Complete => write!(f, "complete"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

impl CompositeJob {
    pub fn new(
        layer_name: String,
        dpi: u32,
        requested_strategy: Option<Strategy>,
        template: UploadInfo,
        artwork: UploadInfo,
    ) -> Self {
        let now = Utc::now();
        Self {
            job_id: Uuid::new_v4().to_string(),
            layer_name,
            dpi,
            requested_strategy,
            template,
            artwork,
            status: JobStatus::Queued,
            strategy: None,
            attempts: Vec::new(),
            page_size: None,
            page_count: None,
            layers: None,
            output_bytes: None,
            created_at: now,
            updated_at: now,
            error: None,
        }
    }

    pub fn start_processing(&mut self) {
        self.status = JobStatus::Processing;
        self.updated_at = Utc::now();
    }

    pub fn mark_complete(&mut self, outcome: &CompositeOutcome) {
        self.status = JobStatus::Complete;
        self.strategy = Some(outcome.strategy);
        self.attempts = outcome.attempts.clone();
        self.page_size = Some(outcome.page_size);
        self.page_count = Some(outcome.page_count);
        self.layers = outcome.layers.clone();
        self.output_bytes = Some(outcome.output_bytes);
        self.updated_at = Utc::now();
        self.error = None;
    }

    pub fn mark_failed(&mut self, error: String, attempts: Vec<StrategyAttempt>) {
        self.status = JobStatus::Failed;
        self.attempts = attempts;
        self.updated_at = Utc::now();
        self.error = Some(error);
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, JobStatus::Complete | JobStatus::Failed)
    }

    pub fn processing_duration_ms(&self) -> Option<i64> {
        if self.is_terminal() {
            Some(self.updated_at.signed_duration_since(self.created_at).num_milliseconds())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn upload(name: &str, content_type: &str) -> UploadInfo {
        UploadInfo {
            file_name: name.to_string(),
            content_type: content_type.to_string(),
            size_bytes: 1024,
        }
    }

    fn job() -> CompositeJob {
        CompositeJob::new(
            "ARTWORK HERE".to_string(),
            300,
            None,
            upload("mug.pdf", "application/pdf"),
            upload("art.png", "image/png"),
        )
    }

    #[test]
    fn test_job_creation() {
        let job = job();

        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.attempts.is_empty());
        assert!(job.error.is_none());
        assert!(job.processing_duration_ms().is_none());
        assert!(Uuid::parse_str(&job.job_id).is_ok());
    }

    #[test]
    fn test_complete_records_outcome() {
        let mut job = job();
        job.start_processing();
        assert_eq!(job.status, JobStatus::Processing);

        let outcome = CompositeOutcome {
            strategy: Strategy::PdftkBackground,
            page_size: PageSize::new(612.0, 792.0),
            page_count: 2,
            layers: None,
            attempts: vec![
                StrategyAttempt {
                    strategy: Strategy::QpdfUnderlay,
                    succeeded: false,
                    duration_ms: 12,
                    error: Some("qpdf not found".to_string()),
                },
                StrategyAttempt {
                    strategy: Strategy::PdftkBackground,
                    succeeded: true,
                    duration_ms: 80,
                    error: None,
                },
            ],
            output_bytes: 2048,
        };
        job.mark_complete(&outcome);

        assert_eq!(job.status, JobStatus::Complete);
        assert_eq!(job.strategy, Some(Strategy::PdftkBackground));
        assert_eq!(job.attempts.len(), 2);
        assert_eq!(job.output_bytes, Some(2048));
        assert_eq!(job.page_count, Some(2));
        assert!(job.processing_duration_ms().is_some());
    }

    #[test]
    fn test_failed_keeps_error() {
        let mut job = job();
        job.start_processing();
        job.mark_failed("all compositing strategies failed".to_string(), Vec::new());

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("all compositing strategies failed"));
        assert!(job.is_terminal());
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let mut job = job();
        job.start_processing();

        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["status"], "processing");
        assert!(json.get("strategy").is_none());

        let back: CompositeJob = serde_json::from_value(json).unwrap();
        assert_eq!(back.job_id, job.job_id);
        assert_eq!(back.status, JobStatus::Processing);
    }
}
