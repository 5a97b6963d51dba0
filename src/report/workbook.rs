//! Workbook orchestrator.
//!
//! Runs one job from sheet allocation to its single notification:
//!
//! 1. allocate sheets in ordinal order and spawn one task per sheet onto the
//!    shared worker pool;
//! 2. await the tasks in submission order, each under the wait budget;
//! 3. write the artifact if every sheet succeeded;
//! 4. notify exactly once.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rust_xlsxwriter::Workbook;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::sheet::{Cell, SheetBuffer, SheetOutcome, SheetSpec, SheetTask};
use super::{ActionKind, Notification, Notifier, WorkbookJob};
use crate::config::ReportConfig;
use crate::error::{SqlbookError, SqlbookResult};
use crate::executor::QueryExecutor;

/// Message of the error attached to timed-out mail jobs.
pub const TIMEOUT_MESSAGE: &str = "Get data timeout";

#[derive(Debug, Clone)]
pub enum JobFailure {
    /// These sheets reported failure; every other sheet completed.
    SheetsFailed { failed: Vec<usize> },
    /// The sheet with this ordinal exceeded the wait budget.
    Timeout { ordinal: usize },
    /// The job could not run or its artifact could not be written.
    Fault(SqlbookError),
}

impl JobFailure {
    /// The error a notification carries for this failure, if any.
    pub fn error(&self) -> Option<SqlbookError> {
        match self {
            Self::SheetsFailed { .. } => None,
            Self::Timeout { .. } => Some(SqlbookError::Timeout(TIMEOUT_MESSAGE.to_string())),
            Self::Fault(e) => Some(e.clone()),
        }
    }
}

#[derive(Debug, Clone)]
pub enum JobOutcome {
    Success(PathBuf),
    Failed(JobFailure),
}

impl JobOutcome {
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Success(path) => Some(path),
            Self::Failed(_) => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

pub struct WorkbookOrchestrator {
    executor: QueryExecutor,
    notifier: Arc<dyn Notifier>,
    workers: Arc<Semaphore>,
    task_wait: Duration,
    output_dir: PathBuf,
}

impl WorkbookOrchestrator {
    pub fn new(executor: QueryExecutor, notifier: Arc<dyn Notifier>, config: &ReportConfig) -> Self {
        Self {
            executor,
            notifier,
            workers: Arc::new(Semaphore::new(config.workers.max(1))),
            task_wait: config.task_wait(),
            output_dir: config.output_dir.clone(),
        }
    }

    /// Override the per-task wait budget.
    pub fn with_task_wait(mut self, wait: Duration) -> Self {
        self.task_wait = wait;
        self
    }

    /// `{output_dir}/{task_key}-{xid}.xlsx`
    pub fn artifact_path(&self, job: &WorkbookJob) -> PathBuf {
        self.output_dir
            .join(format!("{}-{}.xlsx", file_component(&job.task_key), file_component(&job.xid)))
    }

    /// Run a job to completion. Emits exactly one notification.
    pub async fn run(&self, job: WorkbookJob) -> JobOutcome {
        let started = Instant::now();
        info!(
            task_key = %job.task_key,
            action = %job.action,
            requester = %job.requester,
            xid = %job.xid,
            "Workbook worker start"
        );
        job.log_info(&format!(
            "Task({}) workbook worker start action={}, requester={}, xid={}",
            job.task_key, job.action, job.requester, job.xid
        ));

        let outcome = self.generate(&job).await;

        if let JobOutcome::Failed(failure) = &outcome {
            let reason = match failure {
                JobFailure::SheetsFailed { failed } => format!("sheets {failed:?} failed"),
                JobFailure::Timeout { ordinal } => format!("sheet {ordinal}: {TIMEOUT_MESSAGE}"),
                JobFailure::Fault(e) => e.to_string(),
            };
            error!(task_key = %job.task_key, xid = %job.xid, "Workbook worker failed: {}", reason);
            job.log_error(&format!("Task({}) workbook worker error, e={}", job.task_key, reason));
        }

        self.notifier.notify(notification(&job, &outcome)).await;

        let elapsed = started.elapsed().as_millis();
        let path = outcome.path().map(|p| p.display().to_string()).unwrap_or_default();
        info!(
            task_key = %job.task_key,
            status = outcome.is_success(),
            action = %job.action,
            requester = %job.requester,
            xid = %job.xid,
            path = %path,
            elapsed_ms = elapsed as u64,
            "Workbook worker complete"
        );
        job.log_info(&format!(
            "Task({}) workbook worker complete status={}, action={}, requester={}, xid={}, filePath={}, cost={}ms",
            job.task_key,
            outcome.is_success(),
            job.action,
            job.requester,
            job.xid,
            path,
            elapsed
        ));

        outcome
    }

    async fn generate(&self, job: &WorkbookJob) -> JobOutcome {
        if job.sheets.is_empty() {
            return JobOutcome::Failed(JobFailure::Fault(SqlbookError::Configuration(format!(
                "Task({}) workbook has no sheets",
                job.task_key
            ))));
        }

        // Ordinals are fixed here, before any task runs.
        let specs: Vec<SheetSpec> = job
            .sheets
            .iter()
            .enumerate()
            .map(|(i, request)| SheetSpec::new(i + 1, request.clone(), job.row_limit))
            .collect();

        let handles: Vec<(usize, JoinHandle<SheetOutcome>)> = specs
            .into_iter()
            .map(|spec| {
                let ordinal = spec.ordinal;
                let task = SheetTask::new(spec, self.executor.clone(), job.task_key.clone(), job.logger.clone());
                let workers = self.workers.clone();
                let handle = tokio::spawn(async move {
                    let Ok(_permit) = workers.acquire_owned().await else {
                        return SheetOutcome { ordinal, sheet: None };
                    };
                    task.run().await
                });
                (ordinal, handle)
            })
            .collect();

        let mut sheets = Vec::with_capacity(handles.len());
        let mut failed = Vec::new();
        let mut pending = handles.into_iter();

        while let Some((ordinal, mut handle)) = pending.next() {
            match tokio::time::timeout(self.task_wait, &mut handle).await {
                Ok(Ok(SheetOutcome { sheet: Some(sheet), .. })) => sheets.push(sheet),
                Ok(Ok(SheetOutcome { sheet: None, .. })) => {
                    handle.abort();
                    failed.push(ordinal);
                }
                Ok(Err(e)) => {
                    error!(task_key = %job.task_key, ordinal, error = %e, "Sheet task aborted");
                    for (_, rest) in pending {
                        rest.abort();
                    }
                    return JobOutcome::Failed(JobFailure::Fault(SqlbookError::Execution(format!(
                        "Sheet {ordinal} task aborted: {e}"
                    ))));
                }
                Err(_) => {
                    warn!(
                        task_key = %job.task_key,
                        ordinal,
                        "Sheet task exceeded {}ms, cancelling remaining tasks",
                        self.task_wait.as_millis()
                    );
                    handle.abort();
                    for (_, rest) in pending {
                        rest.abort();
                    }
                    return JobOutcome::Failed(JobFailure::Timeout { ordinal });
                }
            }
        }

        if !failed.is_empty() {
            return JobOutcome::Failed(JobFailure::SheetsFailed { failed });
        }

        let path = self.artifact_path(job);
        match write_artifact(&path, sheets).await {
            Ok(()) => JobOutcome::Success(path),
            Err(e) => JobOutcome::Failed(JobFailure::Fault(e)),
        }
    }
}

fn notification(job: &WorkbookJob, outcome: &JobOutcome) -> Notification {
    let (result, error) = match outcome {
        JobOutcome::Success(path) => (Some(path.clone()), None),
        JobOutcome::Failed(failure) => {
            let error = match job.action {
                ActionKind::Mail => failure.error(),
                ActionKind::Export => None,
            };
            (None, error)
        }
    };
    Notification {
        action: job.action,
        task_key: job.task_key.clone(),
        xid: job.xid.clone(),
        result,
        error,
        completed_at: Utc::now(),
    }
}

fn file_component(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Render `sheets` in ordinal order and save them to `path`. A partial file
/// is removed on failure.
async fn write_artifact(path: &Path, mut sheets: Vec<SheetBuffer>) -> SqlbookResult<()> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    sheets.sort_by_key(|s| s.ordinal);

    let target = path.to_path_buf();
    let written = tokio::task::spawn_blocking(move || render(&target, &sheets))
        .await
        .unwrap_or_else(|e| Err(SqlbookError::Artifact(format!("Render task failed: {e}"))));

    if written.is_err() && tokio::fs::try_exists(path).await.unwrap_or(false) {
        if let Err(e) = tokio::fs::remove_file(path).await {
            warn!(path = %path.display(), error = %e, "Failed to remove partial artifact");
        }
    }
    written
}

fn render(path: &Path, sheets: &[SheetBuffer]) -> SqlbookResult<()> {
    let mut workbook = Workbook::new();
    for sheet in sheets {
        let worksheet = workbook.add_worksheet();
        worksheet.set_name(&sheet.name)?;

        for (col, title) in sheet.header.iter().enumerate() {
            worksheet.write_string(0, column_index(col)?, title)?;
        }
        for (i, row) in sheet.rows.iter().enumerate() {
            let row_index = u32::try_from(i + 1)
                .map_err(|_| SqlbookError::Artifact(format!("Sheet {} has too many rows", sheet.name)))?;
            for (col, cell) in row.iter().enumerate() {
                let col = column_index(col)?;
                match cell {
                    Cell::Empty => {}
                    Cell::Number(n) => {
                        worksheet.write_number(row_index, col, *n)?;
                    }
                    Cell::Bool(b) => {
                        worksheet.write_boolean(row_index, col, *b)?;
                    }
                    Cell::Text(s) => {
                        worksheet.write_string(row_index, col, s)?;
                    }
                }
            }
        }
    }
    workbook.save(path)?;
    Ok(())
}

fn column_index(col: usize) -> SqlbookResult<u16> {
    u16::try_from(col).map_err(|_| SqlbookError::Artifact(format!("Column {col} out of range")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sheet(ordinal: usize, name: &str) -> SheetBuffer {
        SheetBuffer {
            ordinal,
            name: name.to_string(),
            header: vec!["id".into(), "ok".into(), "note".into()],
            rows: vec![vec![Cell::Number(1.0), Cell::Bool(true), Cell::Text("first".into())]],
        }
    }

    #[test]
    fn test_failure_errors() {
        assert!(JobFailure::SheetsFailed { failed: vec![2] }.error().is_none());
        match (JobFailure::Timeout { ordinal: 1 }).error() {
            Some(SqlbookError::Timeout(msg)) => assert_eq!(msg, TIMEOUT_MESSAGE),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_file_component() {
        assert_eq!(file_component("daily/report 1"), "daily_report_1");
        assert_eq!(file_component("job-7_a"), "job-7_a");
    }

    #[tokio::test]
    async fn test_write_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("job-x.xlsx");
        write_artifact(&path, vec![sheet(2, "2-b"), sheet(1, "1-a")]).await.unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..2], b"PK");
    }

    #[tokio::test]
    async fn test_write_failure_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.xlsx");
        // Duplicate sheet names are rejected by the writer.
        let err = write_artifact(&path, vec![sheet(1, "same"), sheet(2, "same")])
            .await
            .unwrap_err();
        assert!(matches!(err, SqlbookError::Artifact(_)));
        assert!(!path.exists());
    }
}
