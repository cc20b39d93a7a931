//! YAML plan requests: a query object plus the scrambles it may use.
//!
//! Stands in for the SQL parser, which lives outside this workspace.
//!
//! Example:
//! ```yaml
//! scratch_schema: aqp_temp
//! scrambles:
//!   - { schema: default, table: people_scr, block_column: blk, block_count: 2 }
//! query:
//!   select_list:
//!     - expr: { func: { name: sum, args: [ { column: { table: s, name: age } } ] } }
//!       alias: a
//!   from_list:
//!     - table: { schema: default, table: people_scr, alias: s }
//! ```

use std::sync::Arc;

use aqp_core::config::AqpConfig;
use aqp_core::query::SelectQuery;
use aqp_core::scramble::ScrambleCatalog;
use serde::{Deserialize, Serialize};

use crate::block::BlockConversion;
use crate::compress::CompressionReport;
use crate::error::Result;
use crate::plan::QueryExecutionPlan;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanRequest {
    #[serde(default)]
    pub scratch_schema: Option<String>,
    #[serde(default)]
    pub scrambles: ScrambleCatalog,
    pub query: SelectQuery,
}

/// A built plan plus what the optional rewrite passes did to it.
#[derive(Debug)]
pub struct PreparedPlan {
    pub plan: QueryExecutionPlan,
    pub compression: Option<CompressionReport>,
    pub conversions: Vec<BlockConversion>,
}

impl PlanRequest {
    /// Scratch schema from the request, else from `config`.
    pub fn scratch_schema<'a>(&'a self, config: &'a AqpConfig) -> &'a str {
        self.scratch_schema
            .as_deref()
            .unwrap_or(&config.scratch_schema)
    }

    /// Build, then compress and convert as `config` asks.
    pub fn prepare(&self, config: &AqpConfig) -> Result<PreparedPlan> {
        config.validate()?;
        let mut plan = QueryExecutionPlan::from_query(
            self.scratch_schema(config),
            &self.query,
            Arc::new(self.scrambles.clone()),
        )?;
        let compression = config.compress.then(|| plan.compress());
        let conversions = if config.progressive {
            plan.make_progressive_if_available()?
        } else {
            vec![]
        };
        Ok(PreparedPlan {
            plan,
            compression,
            conversions,
        })
    }
}

/// Enum-valued fields are written as single-key maps (`{ column: {...} }`)
/// at every depth, not as YAML tags.
pub fn parse_plan_request(yaml_src: &str) -> Result<PlanRequest> {
    let de = serde_yaml::Deserializer::from_str(yaml_src);
    Ok(serde_yaml::with::singleton_map_recursive::deserialize(de)?)
}
