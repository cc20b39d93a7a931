//! Convenient re-exports for downstream crates.

pub use crate::config::AqpConfig;
pub use crate::connection::{ConnectionError, DbmsConnection};
pub use crate::error::{Error, Result};
pub use crate::id::{NodeId, QueueId};
pub use crate::manifest::{ManifestId, RunManifest};
pub use crate::query::{
    BaseTable, BinaryOp, Expr, FromItem, JoinKind, JoinTable, Literal, OrderItem,
    PlaceholderRef, SelectItem, SelectQuery, SubqueryKind, TableName,
};
pub use crate::scramble::{ScrambleCatalog, ScrambleMeta};
pub use crate::sql::{AnsiSyntax, HiveSyntax, SqlGenerator, SqlSyntax, Statement};
pub use crate::types::{QueryResult, Scalar};
