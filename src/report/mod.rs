//! Multi-sheet workbook reports.
//!
//! A [`WorkbookJob`] fans out one [`sheet::SheetTask`] per requested sheet
//! and the [`workbook::WorkbookOrchestrator`] collects them into one `.xlsx`
//! artifact and one [`Notification`].

pub mod sheet;
pub mod workbook;

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::SqlbookError;
use crate::source::SourceInfo;

/// What happens with the artifact once the job completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    /// Hand the artifact back for download.
    Export,
    /// Attach the artifact to a mail. Failures carry their error.
    Mail,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Export => f.write_str("export"),
            Self::Mail => f.write_str("mail"),
        }
    }
}

/// One header cell: `title` is shown, `key` selects the row value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetHeader {
    pub key: String,
    pub title: String,
}

/// One requested sheet, as supplied by the SQL-building collaborator.
#[derive(Debug, Clone)]
pub struct SheetRequest {
    pub name: String,
    pub source: Arc<SourceInfo>,
    /// Statements run in order before the query, on the same source.
    pub execute_sql: Vec<String>,
    pub query_sql: String,
    pub exclude_columns: BTreeSet<String>,
    /// `None` writes the result column names as the header row.
    pub headers: Option<Vec<SheetHeader>>,
}

/// Extra per-job log sink, in addition to `tracing`.
pub trait JobLogger: Send + Sync {
    fn info(&self, message: &str);
    fn error(&self, message: &str);
}

pub struct WorkbookJob {
    pub task_key: String,
    /// Correlation id carried into the artifact name and notification.
    pub xid: String,
    pub action: ActionKind,
    pub requester: String,
    pub sheets: Vec<SheetRequest>,
    /// Row limit per sheet; values below 1 mean "global cap only".
    pub row_limit: i64,
    pub logger: Option<Arc<dyn JobLogger>>,
}

impl WorkbookJob {
    pub fn new(task_key: impl Into<String>, xid: impl Into<String>, action: ActionKind) -> Self {
        Self {
            task_key: task_key.into(),
            xid: xid.into(),
            action,
            requester: String::new(),
            sheets: Vec::new(),
            row_limit: 0,
            logger: None,
        }
    }

    pub fn requester(mut self, requester: impl Into<String>) -> Self {
        self.requester = requester.into();
        self
    }

    pub fn sheet(mut self, sheet: SheetRequest) -> Self {
        self.sheets.push(sheet);
        self
    }

    pub fn row_limit(mut self, limit: i64) -> Self {
        self.row_limit = limit;
        self
    }

    pub fn logger(mut self, logger: Arc<dyn JobLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub(crate) fn log_info(&self, message: &str) {
        if let Some(logger) = &self.logger {
            logger.info(message);
        }
    }

    pub(crate) fn log_error(&self, message: &str) {
        if let Some(logger) = &self.logger {
            logger.error(message);
        }
    }
}

impl fmt::Debug for WorkbookJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkbookJob")
            .field("task_key", &self.task_key)
            .field("xid", &self.xid)
            .field("action", &self.action)
            .field("sheets", &self.sheets.len())
            .field("row_limit", &self.row_limit)
            .finish_non_exhaustive()
    }
}

/// Completion event of one job.
#[derive(Debug, Clone)]
pub struct Notification {
    pub action: ActionKind,
    pub task_key: String,
    pub xid: String,
    /// Artifact path on success.
    pub result: Option<PathBuf>,
    /// Failure cause, only for [`ActionKind::Mail`].
    pub error: Option<SqlbookError>,
    pub completed_at: DateTime<Utc>,
}

impl Notification {
    pub fn is_success(&self) -> bool {
        self.result.is_some()
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification);
}

/// Delivers notifications over an unbounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    sender: mpsc::UnboundedSender<Notification>,
}

impl ChannelNotifier {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn notify(&self, notification: Notification) {
        if self.sender.send(notification).is_err() {
            tracing::warn!("Notification receiver dropped");
        }
    }
}

/// Writes notifications to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: Notification) {
        match (&notification.result, &notification.error) {
            (Some(path), _) => tracing::info!(
                task_key = %notification.task_key,
                xid = %notification.xid,
                action = %notification.action,
                "Workbook ready: {}",
                path.display()
            ),
            (None, Some(error)) => tracing::error!(
                task_key = %notification.task_key,
                xid = %notification.xid,
                action = %notification.action,
                "Workbook failed: {}",
                error
            ),
            (None, None) => tracing::warn!(
                task_key = %notification.task_key,
                xid = %notification.xid,
                action = %notification.action,
                "Workbook failed"
            ),
        }
    }
}
