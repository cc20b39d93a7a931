//! Backend connection interface.
//!
//! Implementations are synchronous; the executor calls them from blocking
//! worker threads so one slow statement never stalls the scheduler.

use thiserror::Error;

use crate::sql::SqlSyntax;
use crate::types::QueryResult;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("backend rejected statement: {message}")]
    Backend { sql: String, message: String },

    #[error("connection unavailable: {0}")]
    Unavailable(String),
}

impl ConnectionError {
    pub fn backend(sql: impl Into<String>, message: impl Into<String>) -> Self {
        ConnectionError::Backend {
            sql: sql.into(),
            message: message.into(),
        }
    }
}

pub trait DbmsConnection: Send + Sync {
    /// Run one statement. DDL returns an empty result.
    fn execute(&self, sql: &str) -> Result<QueryResult, ConnectionError>;

    /// Dialect used to render statements for this backend.
    fn syntax(&self) -> &dyn SqlSyntax;
}
