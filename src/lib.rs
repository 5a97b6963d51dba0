//! # sqlbook
//!
//! Multi-dialect SQL pagination and concurrent workbook reports.
//!
//! sqlbook takes already-built SQL text and either pages through its result
//! (native `LIMIT` where the dialect has it, scrollable cursors where it does
//! not) or fans several queries out into one `.xlsx` workbook.
//!
//! ## Quick Example
//!
//! ```rust,ignore
//! use sqlbook::prelude::*;
//!
//! let book = Sqlbook::with_sqlx(Config::default());
//! let source = book.source_info(SourceInfo::builder("postgres://report@db/app"))?;
//!
//! let page = book
//!     .executor()
//!     .query_paged(&source, "SELECT * FROM orders o", PagingRequest::page(2, 50), &Default::default())
//!     .await?;
//! ```
//!
//! ## Modules
//!
//! | Module     | Role                                              |
//! |------------|---------------------------------------------------|
//! | `dialect`  | URL to dialect resolution, paging syntax          |
//! | `sanitize` | Comment stripping, blocked statements             |
//! | `alias`    | FROM/JOIN alias prefixes, COUNT wrappers          |
//! | `pool`     | Connections partitioned by source identity        |
//! | `executor` | Paging state machine, row caps, metadata          |
//! | `cache`    | Single-flight result cache                        |
//! | `report`   | Sheet tasks and the workbook orchestrator         |

pub mod alias;
pub mod cache;
pub mod config;
pub mod dialect;
pub mod driver;
pub mod engine;
pub mod error;
pub mod executor;
pub mod pool;
pub mod report;
pub mod sanitize;
pub mod source;

pub use engine::Sqlbook;

pub mod prelude {
    pub use crate::config::Config;
    pub use crate::dialect::{Dialect, DialectKind, DialectRegistry};
    pub use crate::engine::Sqlbook;
    pub use crate::error::*;
    pub use crate::executor::metadata::{SourceInspector, TableInfo};
    pub use crate::executor::{PagedResult, PagingRequest, QueryExecutor, Row};
    pub use crate::report::workbook::{JobFailure, JobOutcome, WorkbookOrchestrator};
    pub use crate::report::{
        ActionKind, ChannelNotifier, JobLogger, LogNotifier, Notification, Notifier, SheetHeader, SheetRequest,
        WorkbookJob,
    };
    pub use crate::source::SourceInfo;
}
