//! External rendering and job-submission boundaries.
//!
//! DOCX generation and out-of-process report jobs are external
//! collaborators; the service only needs their interfaces. The passthrough
//! renderer keeps the download endpoints functional without the document
//! vendor wired in.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

/// Renders markdown into a downloadable document.
#[async_trait]
pub trait DocumentRenderer: Send + Sync {
    async fn render_markdown(&self, title: &str, markdown: &str) -> anyhow::Result<Vec<u8>>;

    fn content_type(&self) -> &'static str;

    fn file_extension(&self) -> &'static str;
}

/// Ships the markdown bytes as-is.
#[derive(Debug, Default)]
pub struct MarkdownPassthroughRenderer;

#[async_trait]
impl DocumentRenderer for MarkdownPassthroughRenderer {
    async fn render_markdown(&self, _title: &str, markdown: &str) -> anyhow::Result<Vec<u8>> {
        Ok(markdown.as_bytes().to_vec())
    }

    fn content_type(&self) -> &'static str {
        "text/markdown; charset=utf-8"
    }

    fn file_extension(&self) -> &'static str {
        "md"
    }
}

/// Handle returned for an out-of-process report job.
#[derive(Debug, Clone, Serialize)]
pub struct JobHandle {
    pub job_id: String,
    pub status: String,
}

/// Submits report runs to an external job runner (`cloud_run_job` mode).
#[async_trait]
pub trait JobSubmitter: Send + Sync {
    async fn submit_report_job(
        &self,
        thread_id: &str,
        payload: Value,
    ) -> anyhow::Result<JobHandle>;
}

/// Accepts jobs and does nothing with them; placeholder for deployments
/// without a job runner.
#[derive(Debug, Default)]
pub struct NullJobSubmitter;

#[async_trait]
impl JobSubmitter for NullJobSubmitter {
    async fn submit_report_job(
        &self,
        thread_id: &str,
        _payload: Value,
    ) -> anyhow::Result<JobHandle> {
        Ok(JobHandle {
            job_id: format!("job-{}-{}", thread_id, Uuid::new_v4()),
            status: "submitted".to_string(),
        })
    }
}

/// Source of the raw procedure documents a report run starts from. The
/// production implementation reads the knowledge store; tests inject fixed
/// sets.
#[async_trait]
pub trait ProcedureSource: Send + Sync {
    async fn load_procedures(&self) -> anyhow::Result<Vec<Value>>;
}

/// Fixed in-memory procedure set.
#[derive(Debug, Default)]
pub struct StaticProcedureSource {
    procedures: Vec<Value>,
}

impl StaticProcedureSource {
    pub fn new(procedures: Vec<Value>) -> Self {
        Self { procedures }
    }
}

#[async_trait]
impl ProcedureSource for StaticProcedureSource {
    async fn load_procedures(&self) -> anyhow::Result<Vec<Value>> {
        Ok(self.procedures.clone())
    }
}
